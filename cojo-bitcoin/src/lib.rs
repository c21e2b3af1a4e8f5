// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bitcoin collaborators for coinjoin negotiation: identity keys and nicks,
//! wallet and chain traits, joint transaction helpers and a transaction cache.

#![forbid(unsafe_code)]

pub mod chain;
pub mod coinjoin;
pub mod error;
pub mod keys;
pub mod txcache;
pub mod wallet;

pub use chain::{ChainSource, MemoryChain, UtxoInfo};
pub use coinjoin::{estimate_vsize, CoinjoinTx, DUST_THRESHOLD};
pub use error::{BitcoinError, Result};
pub use keys::{
    derive_nick, message_digest, nick_matches_pubkey, parse_public_key, parse_signature,
    verify_digest, IdentityKey, KeySource, MAX_NICK_ATTEMPTS, NICK_PREFIX,
};
pub use txcache::{OurInput, TransactionCache, TransactionRecord};
pub use wallet::{p2wpkh_script, SoftwareWallet, Utxo, Wallet};

pub use bitcoin;
