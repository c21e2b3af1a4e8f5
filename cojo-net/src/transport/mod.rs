// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Line-oriented transports. A backend runs in its own task, owns its
//! socket (or hub connection) and reports upward only through the event
//! queue handed to [`Transport::start`].

#![forbid(unsafe_code)]

mod backoff;
mod irc;
mod memory;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

pub use backoff::ReconnectPolicy;
pub use irc::{install_default_crypto_provider, IrcConfig, IrcTransport, IRC_MAX_PAYLOAD};
pub use memory::{LineInterceptor, MemoryHub, MemoryTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("line of {len} bytes exceeds limit of {max}")]
    LineTooLong { len: usize, max: usize },

    #[error("link is down")]
    LinkDown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("no free nick after {0} attempts")]
    NicksExhausted(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Registration finished; `nick` is the name the network accepted.
    Connected { nick: String },
    Joined { room: String },
    NickInUse { nick: String },
    LineReceived {
        from: String,
        private: bool,
        line: String,
    },
    PeerJoined(String),
    PeerLeft(String),
    Disconnected(String),
    Fatal(ConnectError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Room,
    Nick(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TransportCommand {
    Join(String),
    SetNick(String),
    Send { target: Target, line: String },
    Leave,
    Disconnect,
}

pub type EventSender = mpsc::Sender<(ChannelId, TransportEvent)>;

pub trait Transport: Send + 'static {
    fn name(&self) -> &str;

    /// Longest text accepted by [`TransportHandle::send_line`].
    fn max_line_len(&self) -> usize;

    /// Spawns the backend task. Connecting happens in the background;
    /// failure after the retry budget arrives as [`TransportEvent::Fatal`].
    fn start(self: Box<Self>, channel: ChannelId, nick: String, events: EventSender)
        -> TransportHandle;
}

#[derive(Clone, Debug)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    link_up: Arc<AtomicBool>,
    max_line_len: usize,
}

impl TransportHandle {
    pub fn join(&self, room: &str) {
        let _ = self.commands.send(TransportCommand::Join(room.to_string()));
    }

    pub fn set_nick(&self, nick: &str) {
        let _ = self.commands.send(TransportCommand::SetNick(nick.to_string()));
    }

    pub fn send_line(&self, target: Target, line: &str) -> Result<(), SendError> {
        if line.len() > self.max_line_len {
            return Err(SendError::LineTooLong {
                len: line.len(),
                max: self.max_line_len,
            });
        }
        if !self.is_link_up() {
            return Err(SendError::LinkDown);
        }
        self.commands
            .send(TransportCommand::Send {
                target,
                line: line.to_string(),
            })
            .map_err(|_| SendError::LinkDown)
    }

    pub fn leave(&self) {
        let _ = self.commands.send(TransportCommand::Leave);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(TransportCommand::Disconnect);
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }
}

/// Backend side of a [`TransportHandle`].
pub(crate) struct TransportLink {
    pub(crate) commands: mpsc::UnboundedReceiver<TransportCommand>,
    link_up: Arc<AtomicBool>,
    channel: ChannelId,
    events: EventSender,
}

impl TransportLink {
    /// Returns false once the receiving side has gone away.
    pub(crate) async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send((self.channel, event)).await.is_ok()
    }

    pub(crate) fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    pub(crate) fn channel(&self) -> ChannelId {
        self.channel
    }
}

pub(crate) fn link(
    channel: ChannelId,
    events: EventSender,
    max_line_len: usize,
) -> (TransportHandle, TransportLink) {
    let (tx, rx) = mpsc::unbounded_channel();
    let link_up = Arc::new(AtomicBool::new(false));
    (
        TransportHandle {
            commands: tx,
            link_up: link_up.clone(),
            max_line_len,
        },
        TransportLink {
            commands: rx,
            link_up,
            channel,
            events,
        },
    )
}
