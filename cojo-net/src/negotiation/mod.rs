// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Taker and maker state machines.
//!
//! Rounds never touch the network. Each handler takes the message that
//! arrived, mutates the round and returns what should be sent. Messages
//! are plain; sealing sensitive ones is the daemon's job.

#![forbid(unsafe_code)]

pub mod maker;
pub mod selection;
pub mod taker;

use std::collections::HashSet;
use std::fmt;

use cojo_bitcoin::bitcoin::OutPoint;
use cojo_bitcoin::{ChainSource, Wallet};

use crate::commitment::{CommitmentBlacklist, NonceTracker};
use crate::orderbook::Orderbook;
use crate::protocol::Message;
use crate::session::SessionManager;

pub use maker::{MakerPhase, MakerPolicy, MakerRound};
pub use selection::{select_offers, FeeLimits};
pub use taker::{TakerPhase, TakerPolicy, TakerRound};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Taker,
    Maker,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Broadcast(Message),
    Direct { to: String, message: Message },
}

impl Outbound {
    pub fn direct(to: &str, message: Message) -> Self {
        Outbound::Direct {
            to: to.to_string(),
            message,
        }
    }
}

/// State shared by every round, owned by whoever drives them.
#[derive(Default)]
pub struct RoundResources {
    pub sessions: SessionManager,
    pub orderbook: Orderbook,
    pub blacklist: CommitmentBlacklist,
    pub nonces: NonceTracker,
    /// Coins promised to a maker round that has not finished.
    pub reserved_utxos: HashSet<OutPoint>,
}

impl RoundResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context<'a>(
        &'a mut self,
        wallet: &'a dyn Wallet,
        chain: &'a dyn ChainSource,
    ) -> RoundContext<'a> {
        RoundContext {
            sessions: &mut self.sessions,
            orderbook: &mut self.orderbook,
            blacklist: &mut self.blacklist,
            nonces: &mut self.nonces,
            reserved_utxos: &mut self.reserved_utxos,
            wallet,
            chain,
        }
    }
}

pub struct RoundContext<'a> {
    pub sessions: &'a mut SessionManager,
    pub orderbook: &'a mut Orderbook,
    pub blacklist: &'a mut CommitmentBlacklist,
    pub nonces: &'a mut NonceTracker,
    pub reserved_utxos: &'a mut HashSet<OutPoint>,
    pub wallet: &'a dyn Wallet,
    pub chain: &'a dyn ChainSource,
}
