// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BitcoinError {
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Input {0} not present in transaction")]
    MissingInput(String),

    #[error("Missing prevout for input {0}")]
    MissingPrevout(String),

    #[error("Sighash computation failed: {0}")]
    Sighash(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Chain source error: {0}")]
    Chain(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl From<redb::DatabaseError> for BitcoinError {
    fn from(e: redb::DatabaseError) -> Self {
        BitcoinError::Database(e.to_string())
    }
}

impl From<redb::TransactionError> for BitcoinError {
    fn from(e: redb::TransactionError) -> Self {
        BitcoinError::Database(e.to_string())
    }
}

impl From<redb::TableError> for BitcoinError {
    fn from(e: redb::TableError) -> Self {
        BitcoinError::Database(e.to_string())
    }
}

impl From<redb::StorageError> for BitcoinError {
    fn from(e: redb::StorageError) -> Self {
        BitcoinError::Database(e.to_string())
    }
}

impl From<redb::CommitError> for BitcoinError {
    fn from(e: redb::CommitError) -> Self {
        BitcoinError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BitcoinError>;
