// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Counterparty discovery and coinjoin negotiation over line-oriented
//! public channels.
//!
//! Peers advertise offers in shared rooms, authenticate every command with
//! the key their nick is derived from, and move to end-to-end encrypted
//! direct messages once a round starts.

#![forbid(unsafe_code)]

pub mod channel;
pub mod codec;
pub mod commitment;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod negotiation;
pub mod orderbook;
pub mod protocol;
pub mod session;
pub mod transport;

pub use channel::{ChannelEvent, ChannelState, MessageChannel};
pub use codec::{AssembledCommand, Command, Reassembler};
pub use commitment::{commitment_hash, CommitmentBlacklist, NonceTracker};
pub use daemon::{Daemon, DaemonConfig, DaemonEvent, DaemonHandle};
pub use error::{NetError, Result};
pub use identity::{CounterpartyArena, CounterpartyId, IdentityRegistry};
pub use negotiation::{
    select_offers, FeeLimits, MakerPhase, MakerPolicy, MakerRound, Outbound, Role, RoundContext,
    RoundId, RoundResources, TakerPhase, TakerPolicy, TakerRound,
};
pub use orderbook::{Offer, OfferKey, Orderbook};
pub use protocol::{CjFee, Message, OfferKind, OfferTerms};
pub use session::{Session, SessionManager};
pub use transport::{
    install_default_crypto_provider, ChannelId, ConnectError, IrcConfig, IrcTransport, MemoryHub,
    MemoryTransport, ReconnectPolicy, SendError, Target, Transport, TransportEvent,
};
