// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use thiserror::Error;

use crate::transport::{ConnectError, SendError};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Insufficient liquidity: need {needed} offers, have {available}")]
    InsufficientLiquidity { needed: usize, available: usize },

    #[error("Daemon stopped")]
    DaemonStopped,

    #[error("Bitcoin error: {0}")]
    Bitcoin(#[from] cojo_bitcoin::BitcoinError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
