// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The coordinating task. Channels, the orderbook, sessions and every
//! round live here and are touched only from the daemon loop.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cojo_bitcoin::bitcoin::{Amount, Transaction, Txid};
use cojo_bitcoin::{ChainSource, KeySource, OurInput, TransactionCache, Utxo, Wallet};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelState, MessageChannel};
use crate::codec::{Command, DEFAULT_MAX_OPEN_PER_SENDER, DEFAULT_REASSEMBLY_TIMEOUT};
use crate::error::{NetError, Result};
use crate::identity::IdentityRegistry;
use crate::negotiation::{
    MakerPhase, MakerPolicy, MakerRound, Outbound, Role, RoundId, RoundResources, TakerPhase,
    TakerPolicy, TakerRound,
};
use crate::orderbook::Offer;
use crate::protocol::{is_sensitive, open_command, seal_command, FillPayload, Message, OfferTerms};
use crate::transport::{ChannelId, ConnectError, Transport, TransportEvent};

const IDLE_WAKEUP: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub reassembly_timeout: Duration,
    pub max_open_per_sender: usize,
    pub offer_max_age: Duration,
    pub taker: TakerPolicy,
    pub maker: MakerPolicy,
    pub event_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_open_per_sender: DEFAULT_MAX_OPEN_PER_SENDER,
            offer_max_age: Duration::from_secs(3600),
            taker: TakerPolicy::default(),
            maker: MakerPolicy::default(),
            event_capacity: 256,
        }
    }
}

#[derive(Clone, Debug)]
pub enum DaemonEvent {
    ChannelReady {
        channel: ChannelId,
        nick: String,
    },
    OfferSeen(Offer),
    OfferCancelled {
        counterparty: String,
        offer_id: u32,
    },
    /// Any authenticated command that is not sealed.
    CommandReceived {
        channel: ChannelId,
        sender: String,
        command: Command,
    },
    PeerLeft {
        nick: String,
    },
    RoundStarted {
        round: RoundId,
        role: Role,
    },
    RoundCompleted {
        round: RoundId,
        role: Role,
        txid: Txid,
    },
    RoundFailed {
        round: RoundId,
        role: Role,
        reason: String,
    },
    ChannelFatal {
        channel: ChannelId,
        error: ConnectError,
    },
}

enum Request {
    SubmitOffer {
        terms: OfferTerms,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelOffer {
        offer_id: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        command: Command,
        reply: oneshot::Sender<Result<usize>>,
    },
    Direct {
        nick: String,
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestOrderbook {
        reply: oneshot::Sender<Result<usize>>,
    },
    StartCoinjoin {
        amount: Amount,
        maker_count: usize,
        reply: oneshot::Sender<Result<RoundId>>,
    },
    AbortRound {
        round: RoundId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    OrderbookSnapshot {
        reply: oneshot::Sender<Vec<Offer>>,
    },
}

#[derive(Clone)]
pub struct DaemonHandle {
    requests: mpsc::Sender<Request>,
    shutdown_tx: mpsc::Sender<()>,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl DaemonHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| NetError::DaemonStopped)?;
        rx.await.map_err(|_| NetError::DaemonStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    /// Publishes an offer on every joined channel and keeps announcing it
    /// to newcomers until cancelled.
    pub async fn submit_offer(&self, terms: OfferTerms) -> Result<()> {
        self.call(|reply| Request::SubmitOffer { terms, reply }).await?
    }

    pub async fn cancel_offer(&self, offer_id: u32) -> Result<()> {
        self.call(|reply| Request::CancelOffer { offer_id, reply })
            .await?
    }

    /// Returns how many channels the command went out on.
    pub async fn broadcast_command(&self, command: Command) -> Result<usize> {
        self.call(|reply| Request::Broadcast { command, reply }).await?
    }

    pub async fn request_direct(&self, nick: &str, command: Command) -> Result<()> {
        let nick = nick.to_string();
        self.call(|reply| Request::Direct {
            nick,
            command,
            reply,
        })
        .await?
    }

    pub async fn request_orderbook(&self) -> Result<usize> {
        self.call(|reply| Request::RequestOrderbook { reply }).await?
    }

    pub async fn start_coinjoin(&self, amount: Amount, maker_count: usize) -> Result<RoundId> {
        self.call(|reply| Request::StartCoinjoin {
            amount,
            maker_count,
            reply,
        })
        .await?
    }

    pub async fn abort_round(&self, round: RoundId, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.call(|reply| Request::AbortRound {
            round,
            reason,
            reply,
        })
        .await?
    }

    pub async fn orderbook_snapshot(&self) -> Result<Vec<Offer>> {
        self.call(|reply| Request::OrderbookSnapshot { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

pub struct Daemon {
    config: DaemonConfig,
    identity: Arc<dyn KeySource>,
    wallet: Arc<dyn Wallet>,
    chain: Arc<dyn ChainSource>,
    channels: Vec<MessageChannel>,
    tx_cache: Option<Arc<TransactionCache>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        identity: Arc<dyn KeySource>,
        wallet: Arc<dyn Wallet>,
        chain: Arc<dyn ChainSource>,
    ) -> Self {
        Self {
            config,
            identity,
            wallet,
            chain,
            channels: Vec::new(),
            tx_cache: None,
        }
    }

    pub fn with_channel(mut self, room: &str, transport: Box<dyn Transport>) -> Self {
        let id = ChannelId(self.channels.len() as u32);
        let channel = MessageChannel::new(id, room, transport, self.identity.clone())
            .with_reassembly(
                self.config.reassembly_timeout,
                self.config.max_open_per_sender,
            );
        self.channels.push(channel);
        self
    }

    /// Completed coinjoins get our inputs recorded here.
    pub fn with_tx_cache(mut self, cache: Arc<TransactionCache>) -> Self {
        self.tx_cache = Some(cache);
        self
    }

    pub fn spawn(self) -> Result<(DaemonHandle, JoinHandle<()>)> {
        if self.channels.is_empty() {
            return Err(NetError::Transport("daemon has no channels".into()));
        }
        let capacity = self.config.event_capacity.max(1);
        let (transport_tx, transport_rx) = mpsc::channel(capacity);
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(capacity);

        let mut state = DaemonState {
            config: self.config,
            wallet: self.wallet,
            chain: self.chain,
            tx_cache: self.tx_cache,
            channels: self.channels,
            registry: IdentityRegistry::new(),
            resources: RoundResources::new(),
            own_offers: BTreeMap::new(),
            takers: BTreeMap::new(),
            makers: HashMap::new(),
            next_round: 1,
            event_tx: event_tx.clone(),
        };
        for channel in &mut state.channels {
            channel.start(transport_tx.clone())?;
        }
        drop(transport_tx);

        let task = tokio::spawn(state.run(transport_rx, request_rx, shutdown_rx));
        Ok((
            DaemonHandle {
                requests: request_tx,
                shutdown_tx,
                event_tx,
            },
            task,
        ))
    }
}

struct DaemonState {
    config: DaemonConfig,
    wallet: Arc<dyn Wallet>,
    chain: Arc<dyn ChainSource>,
    tx_cache: Option<Arc<TransactionCache>>,
    channels: Vec<MessageChannel>,
    registry: IdentityRegistry,
    resources: RoundResources,
    own_offers: BTreeMap<u32, OfferTerms>,
    takers: BTreeMap<RoundId, TakerRound>,
    /// Keyed by taker nick; one live round per taker.
    makers: HashMap<String, MakerRound>,
    next_round: u64,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl DaemonState {
    async fn run(
        mut self,
        mut transport_rx: mpsc::Receiver<(ChannelId, TransportEvent)>,
        mut request_rx: mpsc::Receiver<Request>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!(channels = self.channels.len(), "daemon running");
        loop {
            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("daemon shutting down");
                    break;
                }
                Some((channel, event)) = transport_rx.recv() => {
                    self.on_transport_event(channel, event);
                }
                request = request_rx.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => {
                        debug!("all handles dropped");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake) => {
                    self.on_tick(Instant::now());
                }
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        let ids: Vec<RoundId> = self.takers.keys().copied().collect();
        for id in ids {
            if let Some(round) = self.takers.get_mut(&id) {
                let mut ctx = self
                    .resources
                    .context(self.wallet.as_ref(), self.chain.as_ref());
                let out = round.abort(&mut ctx, "daemon shutting down");
                self.dispatch(out);
            }
        }
        let nicks: Vec<String> = self.makers.keys().cloned().collect();
        for nick in nicks {
            if let Some(round) = self.makers.get_mut(&nick) {
                let mut ctx = self
                    .resources
                    .context(self.wallet.as_ref(), self.chain.as_ref());
                let out = round.abort(&mut ctx, "daemon shutting down");
                self.dispatch(out);
            }
        }
        self.reap();
        for channel in &mut self.channels {
            channel.stop();
        }
    }

    fn emit(&self, event: DaemonEvent) {
        let _ = self.event_tx.send(event);
    }

    fn next_round_id(&mut self) -> RoundId {
        let id = RoundId(self.next_round);
        self.next_round += 1;
        id
    }

    fn next_deadline(&self) -> Option<Instant> {
        let channels = self.channels.iter().filter_map(MessageChannel::next_deadline);
        let takers = self.takers.values().filter_map(TakerRound::deadline);
        let makers = self.makers.values().filter_map(MakerRound::deadline);
        let offers = self
            .resources
            .orderbook
            .next_expiry(self.config.offer_max_age);
        channels.chain(takers).chain(makers).chain(offers).min()
    }

    fn on_tick(&mut self, now: Instant) {
        for channel in &mut self.channels {
            channel.purge(now);
        }
        for (nick, offer_id) in self
            .resources
            .orderbook
            .expire(self.config.offer_max_age, now)
        {
            debug!(nick = %nick, offer_id, "offer expired");
            self.emit(DaemonEvent::OfferCancelled {
                counterparty: nick,
                offer_id,
            });
        }

        let mut out = Vec::new();
        for round in self.takers.values_mut() {
            let mut ctx = self
                .resources
                .context(self.wallet.as_ref(), self.chain.as_ref());
            out.extend(round.on_deadline(&mut ctx, now));
        }
        for round in self.makers.values_mut() {
            let mut ctx = self
                .resources
                .context(self.wallet.as_ref(), self.chain.as_ref());
            out.extend(round.on_deadline(&mut ctx, now));
        }
        self.dispatch(out);
        self.reap();
    }

    fn on_transport_event(&mut self, channel: ChannelId, event: TransportEvent) {
        let now = Instant::now();
        let Some(ch) = self.channels.get_mut(channel.0 as usize) else {
            debug!(%channel, "event for unknown channel");
            return;
        };
        let events = ch.handle_transport_event(event, now, &self.registry);
        for event in events {
            self.on_channel_event(channel, event, now);
        }
    }

    fn on_channel_event(&mut self, channel: ChannelId, event: ChannelEvent, now: Instant) {
        match event {
            ChannelEvent::StateChanged(ChannelState::Joined) => {
                let nick = self.channels[channel.0 as usize].nick().to_string();
                self.emit(DaemonEvent::ChannelReady { channel, nick });
                self.announce_offers(channel);
            }
            ChannelEvent::StateChanged(state) => {
                debug!(%channel, state = ?state, "channel state changed");
            }
            ChannelEvent::PeerJoined(nick) => {
                debug!(%channel, nick = %nick, "peer joined");
            }
            ChannelEvent::PeerLeft(nick) => self.on_peer_left(channel, nick, now),
            ChannelEvent::Fatal(error) => {
                warn!(%channel, error = %error, "channel failed");
                self.emit(DaemonEvent::ChannelFatal { channel, error });
            }
            ChannelEvent::CommandReceived {
                sender,
                pubkey,
                command,
                private,
                ..
            } => {
                if let Err(e) = self.registry.bind(&sender, pubkey, channel) {
                    warn!(%channel, nick = %sender, error = %e, "identity conflict across channels");
                    return;
                }
                self.on_command(channel, &sender, command, private, now);
            }
        }
    }

    fn on_peer_left(&mut self, channel: ChannelId, nick: String, now: Instant) {
        self.registry.release(&nick, channel);
        if self.channels.iter().any(|c| c.is_present(&nick)) {
            return;
        }
        for offer in self.resources.orderbook.remove_counterparty(&nick) {
            self.emit(DaemonEvent::OfferCancelled {
                counterparty: offer.counterparty,
                offer_id: offer.terms.offer_id,
            });
        }

        let mut out = Vec::new();
        for round in self.takers.values_mut() {
            let mut ctx = self
                .resources
                .context(self.wallet.as_ref(), self.chain.as_ref());
            out.extend(round.on_peer_left(&nick, &mut ctx, now));
        }
        if let Some(round) = self.makers.get_mut(&nick) {
            let mut ctx = self
                .resources
                .context(self.wallet.as_ref(), self.chain.as_ref());
            round.on_peer_left(&mut ctx);
        }
        self.resources.sessions.remove(&nick);
        self.dispatch(out);
        self.reap();
        self.emit(DaemonEvent::PeerLeft { nick });
    }

    fn on_command(
        &mut self,
        channel: ChannelId,
        sender: &str,
        command: Command,
        private: bool,
        now: Instant,
    ) {
        let command = if is_sensitive(&command.name) {
            if !private {
                debug!(%channel, nick = sender, command = %command.name, "sealed command sent to room");
                return;
            }
            let Some(session) = self.resources.sessions.get(sender) else {
                debug!(%channel, nick = sender, command = %command.name, "sealed command without session");
                return;
            };
            match open_command(session, &command) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(%channel, nick = sender, error = %e, "cannot open sealed command");
                    return;
                }
            }
        } else {
            self.emit(DaemonEvent::CommandReceived {
                channel,
                sender: sender.to_string(),
                command: command.clone(),
            });
            command
        };

        let message = match Message::from_command(&command) {
            Ok(message) => message,
            Err(e) => {
                debug!(%channel, nick = sender, error = %e, "not a negotiation command");
                return;
            }
        };
        if !private && !message.is_public() {
            debug!(%channel, nick = sender, command = message.name(), "private command sent to room");
            return;
        }

        match message {
            Message::Orderbook => self.answer_orderbook(sender),
            Message::Offer(terms) => {
                let offer = Offer::new(sender, channel, terms);
                if self.resources.orderbook.record_offer(offer.clone()) {
                    self.emit(DaemonEvent::OfferSeen(offer));
                }
            }
            Message::Cancel { offer_id } => {
                if self.resources.orderbook.cancel(sender, offer_id).is_some() {
                    self.emit(DaemonEvent::OfferCancelled {
                        counterparty: sender.to_string(),
                        offer_id,
                    });
                }
            }
            Message::Fill(fill) => self.on_fill(sender, fill, now),
            Message::Pubkey { .. } | Message::IoAuth(_) | Message::Sig { .. } => {
                self.route_to_taker(sender, message, now);
            }
            Message::Auth(_) | Message::Tx { .. } | Message::Push { .. } => {
                self.route_to_maker(sender, message, now);
            }
            Message::Error { ref reason } => {
                info!(nick = sender, reason = %reason, "counterparty reported error");
                self.route_to_taker(sender, message.clone(), now);
                self.route_to_maker(sender, message, now);
            }
        }
    }

    fn answer_orderbook(&mut self, requester: &str) {
        let offers: Vec<Message> = self
            .own_offers
            .values()
            .cloned()
            .map(Message::Offer)
            .collect();
        for offer in offers {
            if let Err(e) = self.send_direct(requester, &offer) {
                debug!(nick = requester, error = %e, "could not answer orderbook request");
                return;
            }
        }
    }

    fn announce_offers(&mut self, channel: ChannelId) {
        let commands: Vec<Command> = self
            .own_offers
            .values()
            .filter_map(|terms| Message::Offer(terms.clone()).to_command().ok())
            .collect();
        let Some(ch) = self.channels.get_mut(channel.0 as usize) else {
            return;
        };
        for command in &commands {
            if let Err(e) = ch.broadcast(command) {
                warn!(%channel, error = %e, "offer announcement failed");
            }
        }
    }

    fn on_fill(&mut self, taker: &str, fill: FillPayload, now: Instant) {
        if self.makers.get(taker).is_some_and(|r| !r.is_terminal()) {
            let _ = self.send_direct(taker, &Message::error("round already in progress"));
            return;
        }
        let Some(terms) = self.own_offers.get(&fill.offer_id).cloned() else {
            let _ = self.send_direct(taker, &Message::error("unknown offer"));
            return;
        };

        let id = self.next_round_id();
        let mut ctx = self
            .resources
            .context(self.wallet.as_ref(), self.chain.as_ref());
        match MakerRound::accept_fill(
            id,
            taker,
            &fill,
            &terms,
            self.config.maker.clone(),
            &mut ctx,
            now,
        ) {
            Ok((round, out)) => {
                self.makers.insert(taker.to_string(), round);
                self.emit(DaemonEvent::RoundStarted {
                    round: id,
                    role: Role::Maker,
                });
                self.dispatch(out);
            }
            Err(e) => {
                warn!(nick = taker, error = %e, "fill rejected");
                let _ = self.send_direct(taker, &Message::error(&e.to_string()));
            }
        }
    }

    fn route_to_taker(&mut self, sender: &str, message: Message, now: Instant) {
        let Some(round) = self
            .takers
            .values_mut()
            .find(|r| !r.is_terminal() && r.is_participant(sender))
        else {
            debug!(nick = sender, command = message.name(), "no taker round for sender");
            return;
        };
        let mut ctx = self
            .resources
            .context(self.wallet.as_ref(), self.chain.as_ref());
        let out = round.handle_message(sender, message, &mut ctx, now);
        self.dispatch(out);
        self.reap();
    }

    fn route_to_maker(&mut self, sender: &str, message: Message, now: Instant) {
        let Some(round) = self.makers.get_mut(sender).filter(|r| !r.is_terminal()) else {
            debug!(nick = sender, command = message.name(), "no maker round for sender");
            return;
        };
        let mut ctx = self
            .resources
            .context(self.wallet.as_ref(), self.chain.as_ref());
        let out = round.handle_message(message, &mut ctx, now);
        self.dispatch(out);
        self.reap();
    }

    fn dispatch(&mut self, out: Vec<Outbound>) {
        for outbound in out {
            match outbound {
                Outbound::Broadcast(message) => match message.to_command() {
                    Ok(command) => {
                        self.broadcast(&command);
                    }
                    Err(e) => warn!(error = %e, "cannot encode broadcast"),
                },
                Outbound::Direct { to, message } => {
                    if let Err(e) = self.send_direct(&to, &message) {
                        warn!(nick = %to, command = message.name(), error = %e, "send failed");
                    }
                }
            }
        }
    }

    fn send_direct(&mut self, nick: &str, message: &Message) -> Result<()> {
        let mut command = message.to_command()?;
        if message.is_sensitive() {
            let session = self
                .resources
                .sessions
                .get(nick)
                .ok_or_else(|| NetError::Session(format!("no session with {nick}")))?;
            command = seal_command(session, &command)?;
        }
        self.send_command(nick, &command)
    }

    fn send_command(&mut self, nick: &str, command: &Command) -> Result<()> {
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.state() == ChannelState::Joined && c.is_present(nick))
            .ok_or_else(|| NetError::Transport(format!("{nick} is not on any joined channel")))?;
        channel.direct_message(nick, command)
    }

    fn broadcast(&mut self, command: &Command) -> usize {
        let mut sent = 0;
        for channel in &mut self.channels {
            if channel.state() != ChannelState::Joined {
                continue;
            }
            match channel.broadcast(command) {
                Ok(()) => sent += 1,
                Err(e) => warn!(channel = %channel.id(), error = %e, "broadcast failed"),
            }
        }
        sent
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::SubmitOffer { terms, reply } => {
                let result = terms.validate().and_then(|()| {
                    let command = Message::Offer(terms.clone()).to_command()?;
                    info!(offer_id = terms.offer_id, "offer submitted");
                    self.own_offers.insert(terms.offer_id, terms);
                    self.broadcast(&command);
                    Ok(())
                });
                let _ = reply.send(result);
            }
            Request::CancelOffer { offer_id, reply } => {
                let result = match self.own_offers.remove(&offer_id) {
                    Some(_) => Message::Cancel { offer_id }.to_command().map(|command| {
                        self.broadcast(&command);
                    }),
                    None => Err(NetError::ProtocolViolation(format!(
                        "no offer with id {offer_id}"
                    ))),
                };
                let _ = reply.send(result);
            }
            Request::Broadcast { command, reply } => {
                let _ = reply.send(Ok(self.broadcast(&command)));
            }
            Request::Direct {
                nick,
                command,
                reply,
            } => {
                let _ = reply.send(self.send_command(&nick, &command));
            }
            Request::RequestOrderbook { reply } => {
                let result = Message::Orderbook
                    .to_command()
                    .map(|command| self.broadcast(&command));
                let _ = reply.send(result);
            }
            Request::StartCoinjoin {
                amount,
                maker_count,
                reply,
            } => {
                let id = self.next_round_id();
                let result = TakerRound::start(
                    id,
                    amount,
                    maker_count,
                    self.config.taker.clone(),
                    Instant::now(),
                );
                match result {
                    Ok((round, out)) => {
                        self.takers.insert(id, round);
                        self.emit(DaemonEvent::RoundStarted {
                            round: id,
                            role: Role::Taker,
                        });
                        self.dispatch(out);
                        let _ = reply.send(Ok(id));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Request::AbortRound {
                round,
                reason,
                reply,
            } => {
                let _ = reply.send(self.abort_round(round, &reason));
            }
            Request::OrderbookSnapshot { reply } => {
                let _ = reply.send(self.resources.orderbook.snapshot());
            }
        }
    }

    fn abort_round(&mut self, id: RoundId, reason: &str) -> Result<()> {
        let mut ctx = self
            .resources
            .context(self.wallet.as_ref(), self.chain.as_ref());
        let out = if let Some(round) = self.takers.get_mut(&id) {
            round.abort(&mut ctx, reason)
        } else if let Some(round) = self.makers.values_mut().find(|r| r.id() == id) {
            round.abort(&mut ctx, reason)
        } else {
            return Err(NetError::Session(format!("no live round {id}")));
        };
        self.dispatch(out);
        self.reap();
        Ok(())
    }

    /// Reports and drops finished rounds.
    fn reap(&mut self) {
        let finished: Vec<RoundId> = self
            .takers
            .iter()
            .filter(|(_, r)| r.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            let Some(round) = self.takers.remove(&id) else {
                continue;
            };
            for nick in round.makers() {
                self.resources.sessions.remove(nick);
            }
            match (round.phase(), round.transaction()) {
                (TakerPhase::Completed, Some(tx)) => {
                    self.record_our_inputs(tx.transaction(), round.own_utxos());
                    self.emit(DaemonEvent::RoundCompleted {
                        round: id,
                        role: Role::Taker,
                        txid: tx.txid(),
                    });
                }
                _ => self.emit(DaemonEvent::RoundFailed {
                    round: id,
                    role: Role::Taker,
                    reason: round.failure().unwrap_or("unknown").to_string(),
                }),
            }
        }

        let finished: Vec<String> = self
            .makers
            .iter()
            .filter(|(_, r)| r.is_terminal())
            .map(|(nick, _)| nick.clone())
            .collect();
        for nick in finished {
            let Some(round) = self.makers.remove(&nick) else {
                continue;
            };
            match (round.phase(), round.final_transaction()) {
                (MakerPhase::Completed, Some(tx)) => {
                    self.record_our_inputs(tx, round.utxos());
                    self.emit(DaemonEvent::RoundCompleted {
                        round: round.id(),
                        role: Role::Maker,
                        txid: tx.compute_txid(),
                    });
                }
                _ => self.emit(DaemonEvent::RoundFailed {
                    round: round.id(),
                    role: Role::Maker,
                    reason: round.failure().unwrap_or("unknown").to_string(),
                }),
            }
        }
    }

    fn record_our_inputs(&self, tx: &Transaction, utxos: &[Utxo]) {
        let Some(cache) = &self.tx_cache else {
            return;
        };
        let inputs: Vec<OurInput> = utxos
            .iter()
            .map(|u| OurInput {
                script: u.script_pubkey.clone(),
                value: u.value,
            })
            .collect();
        let txid = tx.compute_txid();
        if let Err(e) = cache.add_tx_our_inputs(self.wallet.wallet_id(), &txid, &inputs) {
            warn!(%txid, error = %e, "failed to record our inputs");
        }
    }
}
