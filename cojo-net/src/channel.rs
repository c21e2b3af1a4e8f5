// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cojo_bitcoin::bitcoin::secp256k1::PublicKey;
use cojo_bitcoin::{derive_nick, KeySource, MAX_NICK_ATTEMPTS};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, Command, Reassembler};
use crate::error::{NetError, Result};
use crate::identity::{CounterpartyArena, CounterpartyId, IdentityRegistry};
use crate::transport::{
    ChannelId, ConnectError, EventSender, SendError, Target, Transport, TransportEvent,
    TransportHandle,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Joined,
    Leaving,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A complete command whose signature checked out.
    CommandReceived {
        sender: String,
        counterparty: CounterpartyId,
        pubkey: PublicKey,
        command: Command,
        private: bool,
    },
    PeerJoined(String),
    PeerLeft(String),
    StateChanged(ChannelState),
    Fatal(ConnectError),
}

/// One room on one transport.
pub struct MessageChannel {
    id: ChannelId,
    room: String,
    tag: String,
    transport: Option<Box<dyn Transport>>,
    handle: Option<TransportHandle>,
    state: ChannelState,
    stop_requested: bool,
    identity: Arc<dyn KeySource>,
    nick_attempt: u32,
    nick: String,
    presence: BTreeSet<String>,
    reassembler: Reassembler,
    arena: CounterpartyArena,
    next_instance: u32,
}

impl MessageChannel {
    pub fn new(
        id: ChannelId,
        room: &str,
        transport: Box<dyn Transport>,
        identity: Arc<dyn KeySource>,
    ) -> Self {
        let tag = format!("{}/{room}", transport.name());
        let nick = derive_nick(&identity.public_key(), 0);
        Self {
            id,
            room: room.to_string(),
            tag,
            transport: Some(transport),
            handle: None,
            state: ChannelState::Disconnected,
            stop_requested: false,
            identity,
            nick_attempt: 0,
            nick,
            presence: BTreeSet::new(),
            reassembler: Reassembler::new(),
            arena: CounterpartyArena::new(id),
            next_instance: rand::random(),
        }
    }

    pub fn with_reassembly(mut self, timeout: Duration, max_open_per_sender: usize) -> Self {
        self.reassembler = Reassembler::new()
            .with_timeout(timeout)
            .with_max_open_per_sender(max_open_per_sender);
        self
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Channel tag covered by every command signature.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn presence(&self) -> impl Iterator<Item = &String> {
        self.presence.iter()
    }

    pub fn is_present(&self, nick: &str) -> bool {
        self.presence.contains(nick)
    }

    pub fn arena(&self) -> &CounterpartyArena {
        &self.arena
    }

    pub fn start(&mut self, events: EventSender) -> Result<()> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| NetError::Transport(format!("{} already started", self.id)))?;
        info!(channel = %self.id, room = %self.room, nick = %self.nick, transport = transport.name(), "starting channel");
        self.handle = Some(transport.start(self.id, self.nick.clone(), events));
        self.state = ChannelState::Connecting;
        Ok(())
    }

    /// Leaves the room and disconnects. Events arriving afterwards are
    /// discarded; the returned events are the last this channel produces.
    pub fn stop(&mut self) -> Vec<ChannelEvent> {
        if self.stop_requested {
            return Vec::new();
        }
        self.stop_requested = true;
        if let Some(handle) = &self.handle {
            self.state = ChannelState::Leaving;
            handle.leave();
            handle.disconnect();
        }
        let mut out = self.drop_presence();
        self.state = ChannelState::Disconnected;
        out.push(ChannelEvent::StateChanged(ChannelState::Disconnected));
        out
    }

    pub fn broadcast(&mut self, command: &Command) -> Result<()> {
        self.send(Target::Room, command)
    }

    pub fn direct_message(&mut self, nick: &str, command: &Command) -> Result<()> {
        self.send(Target::Nick(nick.to_string()), command)
    }

    fn send(&mut self, target: Target, command: &Command) -> Result<()> {
        let handle = match (&self.handle, self.state) {
            (Some(handle), ChannelState::Joined) => handle,
            _ => return Err(NetError::Send(SendError::LinkDown)),
        };
        let instance = self.next_instance;
        self.next_instance = self.next_instance.wrapping_add(1);
        let lines = codec::encode(
            self.identity.as_ref(),
            &self.nick,
            &self.tag,
            command,
            instance,
            handle.max_line_len(),
        )?;
        for line in &lines {
            handle.send_line(target.clone(), line)?;
        }
        debug!(channel = %self.id, command = %command.name, fragments = lines.len(), "sent");
        Ok(())
    }

    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        registry: &IdentityRegistry,
    ) -> Vec<ChannelEvent> {
        if self.stop_requested {
            return Vec::new();
        }
        match event {
            TransportEvent::Connected { nick } => {
                debug!(channel = %self.id, nick = %nick, "registered");
                self.nick = nick;
                if let Some(handle) = &self.handle {
                    handle.join(&self.room);
                }
                Vec::new()
            }
            TransportEvent::Joined { room } => {
                if room != self.room {
                    debug!(channel = %self.id, room = %room, "joined unexpected room");
                    return Vec::new();
                }
                info!(channel = %self.id, room = %room, nick = %self.nick, "joined");
                self.state = ChannelState::Joined;
                vec![ChannelEvent::StateChanged(ChannelState::Joined)]
            }
            TransportEvent::NickInUse { nick } => self.next_nick(&nick),
            TransportEvent::LineReceived {
                from,
                private,
                line,
            } => self.receive_line(&from, private, &line, now, registry),
            TransportEvent::PeerJoined(nick) => {
                if nick == self.nick || !self.presence.insert(nick.clone()) {
                    return Vec::new();
                }
                self.arena.sighted(&nick);
                vec![ChannelEvent::PeerJoined(nick)]
            }
            TransportEvent::PeerLeft(nick) => {
                if !self.presence.remove(&nick) {
                    return Vec::new();
                }
                self.arena.remove(&nick);
                self.reassembler.drop_sender(&nick);
                vec![ChannelEvent::PeerLeft(nick)]
            }
            TransportEvent::Disconnected(reason) => {
                warn!(channel = %self.id, reason = %reason, "transport disconnected");
                let mut out = self.drop_presence();
                self.state = ChannelState::Connecting;
                out.push(ChannelEvent::StateChanged(ChannelState::Connecting));
                out
            }
            TransportEvent::Fatal(error) => {
                warn!(channel = %self.id, error = %error, "transport gave up");
                let mut out = self.drop_presence();
                self.state = ChannelState::Disconnected;
                out.push(ChannelEvent::StateChanged(ChannelState::Disconnected));
                out.push(ChannelEvent::Fatal(error));
                out
            }
        }
    }

    fn next_nick(&mut self, taken: &str) -> Vec<ChannelEvent> {
        self.nick_attempt += 1;
        if self.nick_attempt >= MAX_NICK_ATTEMPTS {
            warn!(channel = %self.id, attempts = self.nick_attempt, "no free nick left");
            if let Some(handle) = &self.handle {
                handle.disconnect();
            }
            self.stop_requested = true;
            self.state = ChannelState::Disconnected;
            return vec![
                ChannelEvent::StateChanged(ChannelState::Disconnected),
                ChannelEvent::Fatal(ConnectError::NicksExhausted(self.nick_attempt)),
            ];
        }
        let next = derive_nick(&self.identity.public_key(), self.nick_attempt);
        info!(channel = %self.id, taken, next = %next, "nick in use, trying next");
        self.nick = next;
        if let Some(handle) = &self.handle {
            handle.set_nick(&self.nick);
        }
        Vec::new()
    }

    fn receive_line(
        &mut self,
        from: &str,
        private: bool,
        line: &str,
        now: Instant,
        registry: &IdentityRegistry,
    ) -> Vec<ChannelEvent> {
        if from == self.nick {
            return Vec::new();
        }
        let assembled = match self.reassembler.push(from, line, now) {
            Ok(Some(assembled)) => assembled,
            Ok(None) => return Vec::new(),
            Err(e) => {
                debug!(channel = %self.id, from, error = %e, "dropping line");
                return Vec::new();
            }
        };
        let pinned = registry.key_for(&assembled.sender);
        match self.arena.authenticate(&assembled, &self.tag, pinned) {
            Ok(counterparty) => {
                if self.presence.insert(assembled.sender.clone()) {
                    debug!(channel = %self.id, nick = %assembled.sender, "sender seen before join notice");
                }
                vec![ChannelEvent::CommandReceived {
                    sender: assembled.sender,
                    counterparty,
                    pubkey: assembled.pubkey,
                    command: assembled.command,
                    private,
                }]
            }
            Err(e) => {
                debug!(channel = %self.id, from, error = %e, "dropping unauthenticated command");
                Vec::new()
            }
        }
    }

    fn drop_presence(&mut self) -> Vec<ChannelEvent> {
        let gone = std::mem::take(&mut self.presence);
        self.arena.clear();
        self.reassembler.clear();
        gone.into_iter().map(ChannelEvent::PeerLeft).collect()
    }

    /// Discards partial messages past the reassembly timeout.
    pub fn purge(&mut self, now: Instant) -> usize {
        let dropped = self.reassembler.purge(now);
        if dropped > 0 {
            debug!(channel = %self.id, dropped, "purged incomplete messages");
        }
        dropped
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.reassembler.next_deadline()
    }
}
