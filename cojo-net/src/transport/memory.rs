// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process chat hub. Behaves like a tiny IRC server: nick
//! registration with collisions, rooms, public and private lines, and
//! hooks to cut clients off or rewrite lines in flight.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    link, ChannelId, ConnectError, EventSender, ReconnectPolicy, Target, Transport,
    TransportCommand, TransportEvent, TransportHandle, TransportLink,
};

/// Called per recipient with `(from, to, line)`. Returning `None` drops
/// the line for that recipient.
pub type LineInterceptor = Arc<dyn Fn(&str, &str, &str) -> Option<String> + Send + Sync>;

enum RegisterError {
    Refused,
    NickInUse,
}

struct Client {
    inbox: mpsc::UnboundedSender<TransportEvent>,
    room: Option<String>,
}

struct HubState {
    clients: HashMap<String, Client>,
    rooms: HashMap<String, BTreeSet<String>>,
    accepting: bool,
    interceptor: Option<LineInterceptor>,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            accepting: true,
            interceptor: None,
        }
    }
}

impl HubState {
    fn notify_room(&self, room: &str, except: &str, event: TransportEvent) {
        if let Some(members) = self.rooms.get(room) {
            for member in members.iter().filter(|m| m.as_str() != except) {
                if let Some(client) = self.clients.get(member) {
                    let _ = client.inbox.send(event.clone());
                }
            }
        }
    }

    fn leave_room(&mut self, nick: &str) {
        let room = self.clients.get_mut(nick).and_then(|c| c.room.take());
        if let Some(room) = room {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(nick);
            }
            self.notify_room(&room, nick, TransportEvent::PeerLeft(nick.to_string()));
        }
    }

    fn remove_client(&mut self, nick: &str) -> bool {
        self.leave_room(nick);
        self.clients.remove(nick).is_some()
    }
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, max_line_len: usize) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            max_line_len,
            policy: ReconnectPolicy::default(),
        }
    }

    /// While false, every registration attempt is refused.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().accepting = accepting;
    }

    pub fn set_interceptor(&self, interceptor: Option<LineInterceptor>) {
        self.state.lock().interceptor = interceptor;
    }

    /// Cuts a client off as if its connection dropped.
    pub fn disconnect(&self, nick: &str) -> bool {
        self.state.lock().remove_client(nick)
    }

    /// Occupies `nick` without a live client behind it.
    pub fn reserve_nick(&self, nick: &str) {
        let (inbox, _) = mpsc::unbounded_channel();
        self.state
            .lock()
            .clients
            .insert(nick.to_string(), Client { inbox, room: None });
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn register(&self, nick: &str) -> Result<mpsc::UnboundedReceiver<TransportEvent>, RegisterError> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(RegisterError::Refused);
        }
        if state.clients.contains_key(nick) {
            return Err(RegisterError::NickInUse);
        }
        let (inbox, rx) = mpsc::unbounded_channel();
        state
            .clients
            .insert(nick.to_string(), Client { inbox, room: None });
        Ok(rx)
    }

    fn join(&self, nick: &str, room: &str) {
        let mut state = self.state.lock();
        state.leave_room(nick);
        let existing: Vec<String> = state
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        let Some(client) = state.clients.get_mut(nick) else {
            return;
        };
        client.room = Some(room.to_string());
        let _ = client.inbox.send(TransportEvent::Joined {
            room: room.to_string(),
        });
        for member in existing {
            let _ = client.inbox.send(TransportEvent::PeerJoined(member));
        }
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(nick.to_string());
        state.notify_room(room, nick, TransportEvent::PeerJoined(nick.to_string()));
    }

    fn part(&self, nick: &str) {
        self.state.lock().leave_room(nick);
    }

    fn rename(&self, old: &str, new: &str) -> bool {
        let mut state = self.state.lock();
        if state.clients.contains_key(new) {
            return false;
        }
        let Some(client) = state.clients.remove(old) else {
            return false;
        };
        let room = client.room.clone();
        state.clients.insert(new.to_string(), client);
        if let Some(room) = room {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(old);
                members.insert(new.to_string());
            }
            state.notify_room(&room, new, TransportEvent::PeerLeft(old.to_string()));
            state.notify_room(&room, new, TransportEvent::PeerJoined(new.to_string()));
        }
        true
    }

    fn deliver(&self, from: &str, target: &Target, line: &str) {
        let state = self.state.lock();
        let (recipients, private): (Vec<String>, bool) = match target {
            Target::Room => {
                let Some(room) = state.clients.get(from).and_then(|c| c.room.clone()) else {
                    debug!(from, "room line from client outside any room");
                    return;
                };
                let members = state
                    .rooms
                    .get(&room)
                    .map(|m| m.iter().filter(|n| n.as_str() != from).cloned().collect())
                    .unwrap_or_default();
                (members, false)
            }
            Target::Nick(nick) => (vec![nick.clone()], true),
        };

        for to in recipients {
            let Some(client) = state.clients.get(&to) else {
                debug!(from, to = %to, "private line to unknown nick");
                continue;
            };
            let line = match &state.interceptor {
                Some(intercept) => match intercept(from, &to, line) {
                    Some(l) => l,
                    None => continue,
                },
                None => line.to_string(),
            };
            let _ = client.inbox.send(TransportEvent::LineReceived {
                from: from.to_string(),
                private,
                line,
            });
        }
    }

    fn unregister(&self, nick: &str) {
        self.state.lock().remove_client(nick);
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
    max_line_len: usize,
    policy: ReconnectPolicy,
}

impl MemoryTransport {
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn max_line_len(&self) -> usize {
        self.max_line_len
    }

    fn start(self: Box<Self>, channel: ChannelId, nick: String, events: EventSender) -> TransportHandle {
        let (handle, link) = link(channel, events, self.max_line_len);
        let MemoryTransport { hub, policy, .. } = *self;
        tokio::spawn(run_client(hub, policy, nick, link));
        handle
    }
}

enum ServeOutcome {
    Stopped,
    Dropped,
    EventsClosed,
}

async fn run_client(hub: MemoryHub, policy: ReconnectPolicy, mut nick: String, mut link: TransportLink) {
    let mut failures = 0u32;
    loop {
        let inbox = match hub.register(&nick) {
            Ok(inbox) => inbox,
            Err(RegisterError::NickInUse) => {
                if !link.emit(TransportEvent::NickInUse { nick: nick.clone() }).await {
                    return;
                }
                match wait_for_nick(&mut link).await {
                    Some(next) => {
                        nick = next;
                        continue;
                    }
                    None => return,
                }
            }
            Err(RegisterError::Refused) => {
                let Some(delay) = policy.delay(failures) else {
                    let _ = link
                        .emit(TransportEvent::Fatal(ConnectError::RetriesExhausted {
                            attempts: failures,
                            last_error: "hub refused connection".into(),
                        }))
                        .await;
                    return;
                };
                failures += 1;
                debug!(channel = %link.channel(), attempt = failures, "memory hub refused, retrying");
                if !backoff(&mut link, &mut nick, delay).await {
                    return;
                }
                continue;
            }
        };

        failures = 0;
        link.set_link_up(true);
        if !link.emit(TransportEvent::Connected { nick: nick.clone() }).await {
            link.set_link_up(false);
            hub.unregister(&nick);
            return;
        }

        let outcome = serve(&hub, &mut link, &mut nick, inbox).await;
        link.set_link_up(false);
        match outcome {
            ServeOutcome::Stopped => {
                hub.unregister(&nick);
                let _ = link
                    .emit(TransportEvent::Disconnected("disconnect requested".into()))
                    .await;
                return;
            }
            ServeOutcome::EventsClosed => {
                hub.unregister(&nick);
                return;
            }
            ServeOutcome::Dropped => {
                if !link
                    .emit(TransportEvent::Disconnected("dropped by hub".into()))
                    .await
                {
                    return;
                }
                let Some(delay) = policy.delay(0) else {
                    let _ = link
                        .emit(TransportEvent::Fatal(ConnectError::RetriesExhausted {
                            attempts: 0,
                            last_error: "dropped by hub".into(),
                        }))
                        .await;
                    return;
                };
                if !backoff(&mut link, &mut nick, delay).await {
                    return;
                }
            }
        }
    }
}

async fn serve(
    hub: &MemoryHub,
    link: &mut TransportLink,
    nick: &mut String,
    mut inbox: mpsc::UnboundedReceiver<TransportEvent>,
) -> ServeOutcome {
    loop {
        tokio::select! {
            cmd = link.commands.recv() => match cmd {
                None | Some(TransportCommand::Disconnect) => return ServeOutcome::Stopped,
                Some(TransportCommand::Join(room)) => hub.join(nick, &room),
                Some(TransportCommand::SetNick(next)) => {
                    if hub.rename(nick, &next) {
                        *nick = next;
                    } else if !link.emit(TransportEvent::NickInUse { nick: next }).await {
                        return ServeOutcome::EventsClosed;
                    }
                }
                Some(TransportCommand::Send { target, line }) => hub.deliver(nick, &target, &line),
                Some(TransportCommand::Leave) => hub.part(nick),
            },
            event = inbox.recv() => match event {
                Some(event) => {
                    if !link.emit(event).await {
                        return ServeOutcome::EventsClosed;
                    }
                }
                None => return ServeOutcome::Dropped,
            },
        }
    }
}

async fn wait_for_nick(link: &mut TransportLink) -> Option<String> {
    loop {
        match link.commands.recv().await {
            Some(TransportCommand::SetNick(nick)) => return Some(nick),
            Some(TransportCommand::Disconnect) | None => return None,
            Some(_) => {}
        }
    }
}

/// Sleeps for `delay` while still honouring disconnect and nick changes.
/// Returns false when the owner asked to disconnect.
async fn backoff(link: &mut TransportLink, nick: &mut String, delay: std::time::Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = link.commands.recv() => match cmd {
                Some(TransportCommand::Disconnect) | None => return false,
                Some(TransportCommand::SetNick(next)) => *nick = next,
                Some(_) => {}
            },
        }
    }
}
