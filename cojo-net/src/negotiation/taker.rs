// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use cojo_bitcoin::bitcoin::secp256k1::PublicKey;
use cojo_bitcoin::bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};
use cojo_bitcoin::{
    estimate_vsize, p2wpkh_script, verify_digest, BitcoinError, CoinjoinTx, Utxo, DUST_THRESHOLD,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::selection::{select_offers, FeeLimits};
use super::{Outbound, RoundContext, RoundId};
use crate::commitment::{commitment_hash, ioauth_digest, ownership_digest};
use crate::error::{NetError, Result};
use crate::orderbook::{Offer, OfferKey};
use crate::protocol::{AuthPayload, FillPayload, InputSignature, IoAuthPayload, Message};

#[derive(Clone, Debug)]
pub struct TakerPolicy {
    pub minimum_makers: usize,
    pub fee_limits: FeeLimits,
    pub fee_target_blocks: u16,
    /// How long to collect offers after asking for the orderbook.
    pub orderbook_wait: Duration,
    pub phase_timeout: Duration,
}

impl Default for TakerPolicy {
    fn default() -> Self {
        Self {
            minimum_makers: 2,
            fee_limits: FeeLimits::default(),
            fee_target_blocks: 3,
            orderbook_wait: Duration::from_secs(10),
            phase_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TakerPhase {
    Requesting,
    PubkeyExchange,
    UtxoCommitment,
    TxProposed,
    CollectingSignatures,
    Completed,
    Aborted,
    TimedOut,
}

impl TakerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TakerPhase::Completed | TakerPhase::Aborted | TakerPhase::TimedOut
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SlotProgress {
    FillSent,
    AuthSent,
    InputsVerified,
    Signed,
}

struct MakerInputs {
    prevouts: Vec<(OutPoint, TxOut)>,
    cj_script: ScriptBuf,
    change_script: ScriptBuf,
    total: Amount,
}

struct MakerSlot {
    offer: Offer,
    progress: SlotProgress,
    session_pubkey: Option<PublicKey>,
    inputs: Option<MakerInputs>,
}

impl MakerSlot {
    fn nick(&self) -> &str {
        &self.offer.counterparty
    }

    fn cjfee(&self, amount: Amount) -> Amount {
        self.offer.terms.cjfee.fee_for(amount)
    }
}

struct TakerCommitment {
    utxo: Utxo,
    nonce: u8,
    hash: [u8; 32],
}

pub struct TakerRound {
    id: RoundId,
    amount: Amount,
    maker_count: usize,
    policy: TakerPolicy,
    phase: TakerPhase,
    deadline: Instant,
    failure: Option<String>,
    slots: Vec<MakerSlot>,
    excluded: HashSet<String>,
    own: Vec<Utxo>,
    cj_script: Option<ScriptBuf>,
    change_script: Option<ScriptBuf>,
    commitment: Option<TakerCommitment>,
    tx: Option<CoinjoinTx>,
}

impl TakerRound {
    /// Opens a round and asks every channel for offers.
    pub fn start(
        id: RoundId,
        amount: Amount,
        maker_count: usize,
        policy: TakerPolicy,
        now: Instant,
    ) -> Result<(Self, Vec<Outbound>)> {
        if amount < DUST_THRESHOLD {
            return Err(NetError::ProtocolViolation(format!(
                "coinjoin amount {amount} is dust"
            )));
        }
        if maker_count == 0 || maker_count < policy.minimum_makers {
            return Err(NetError::ProtocolViolation(format!(
                "{maker_count} makers requested, minimum is {}",
                policy.minimum_makers.max(1)
            )));
        }
        info!(round = %id, %amount, maker_count, "starting taker round");
        let round = Self {
            id,
            amount,
            maker_count,
            deadline: now + policy.orderbook_wait,
            policy,
            phase: TakerPhase::Requesting,
            failure: None,
            slots: Vec::new(),
            excluded: HashSet::new(),
            own: Vec::new(),
            cj_script: None,
            change_script: None,
            commitment: None,
            tx: None,
        };
        Ok((round, vec![Outbound::Broadcast(Message::Orderbook)]))
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn phase(&self) -> TakerPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        (!self.is_terminal()).then_some(self.deadline)
    }

    pub fn makers(&self) -> Vec<&str> {
        self.slots.iter().map(MakerSlot::nick).collect()
    }

    pub fn is_participant(&self, nick: &str) -> bool {
        self.slots.iter().any(|s| s.nick() == nick)
    }

    pub fn own_utxos(&self) -> &[Utxo] {
        &self.own
    }

    /// The current transaction. Fully signed once the round completed.
    pub fn transaction(&self) -> Option<&CoinjoinTx> {
        self.tx.as_ref()
    }

    fn is_proposed(&self, txid: &Txid) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.txid() == *txid)
    }

    pub fn on_deadline(&mut self, ctx: &mut RoundContext<'_>, now: Instant) -> Vec<Outbound> {
        if self.is_terminal() || now < self.deadline {
            return Vec::new();
        }
        let required = match self.phase {
            TakerPhase::Requesting => {
                return match self.send_fills(ctx, now) {
                    Ok(out) => out,
                    Err(e) => self.fail(ctx, TakerPhase::Aborted, e.to_string()),
                };
            }
            TakerPhase::PubkeyExchange => SlotProgress::AuthSent,
            TakerPhase::UtxoCommitment => SlotProgress::InputsVerified,
            TakerPhase::TxProposed | TakerPhase::CollectingSignatures => SlotProgress::Signed,
            _ => return Vec::new(),
        };

        let slow: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.progress < required)
            .map(|(i, _)| i)
            .collect();
        let remaining = self.slots.len() - slow.len();
        if remaining < self.policy.minimum_makers.max(1) {
            let reason = format!(
                "{} of {} makers answered in time while {:?}",
                remaining,
                self.slots.len(),
                self.phase
            );
            return self.fail(ctx, TakerPhase::TimedOut, reason);
        }

        let mut out = Vec::new();
        for index in slow.into_iter().rev() {
            out.extend(self.exclude(index, ctx, "timed out", true));
        }
        self.deadline = now + self.policy.phase_timeout;
        if matches!(
            self.phase,
            TakerPhase::TxProposed | TakerPhase::CollectingSignatures
        ) {
            out.extend(self.propose(ctx, now));
        } else {
            if self.phase == TakerPhase::PubkeyExchange {
                self.phase = TakerPhase::UtxoCommitment;
            }
            out.extend(self.advance(ctx, now));
        }
        out
    }

    fn send_fills(&mut self, ctx: &mut RoundContext<'_>, now: Instant) -> Result<Vec<Outbound>> {
        let available = ctx.orderbook.available();
        let chosen = select_offers(
            &available,
            self.amount,
            self.maker_count,
            &self.policy.fee_limits,
            &self.excluded,
        )?;

        let total_cjfee: Amount = chosen
            .iter()
            .map(|o| o.terms.cjfee.fee_for(self.amount))
            .sum();
        let fee_rate = ctx.chain.current_fee_estimate(self.policy.fee_target_blocks)?;
        let parties = chosen.len() + 1;
        let fee_estimate = Amount::from_sat(fee_rate * estimate_vsize(2 * parties, 2 * parties));
        let own = ctx
            .wallet
            .select_utxos(self.amount + total_cjfee + fee_estimate, ctx.reserved_utxos)?;

        let cj_script = ctx.wallet.fresh_script()?;
        let change_script = ctx.wallet.fresh_script()?;

        let mut commitment = None;
        for utxo in &own {
            if let Some(nonce) = ctx.nonces.next_nonce(&utxo.outpoint) {
                commitment = Some(TakerCommitment {
                    utxo: utxo.clone(),
                    nonce,
                    hash: commitment_hash(&utxo.outpoint, &utxo.pubkey, nonce),
                });
                break;
            }
        }
        let commitment = commitment.ok_or_else(|| {
            NetError::ProtocolViolation("every selected coin has used up its commitments".into())
        })?;

        // Nothing below may fail once coins and offers are reserved.
        let keys: Vec<OfferKey> = chosen.iter().map(Offer::key).collect();
        ctx.orderbook.reserve(&keys, self.id)?;
        ctx.reserved_utxos.extend(own.iter().map(|u| u.outpoint));
        self.own = own;
        self.cj_script = Some(cj_script);
        self.change_script = Some(change_script);

        let mut out = Vec::with_capacity(chosen.len());
        for offer in chosen {
            let session_pubkey = ctx.sessions.initiate(&offer.counterparty);
            out.push(Outbound::direct(
                &offer.counterparty,
                Message::Fill(FillPayload {
                    offer_id: offer.terms.offer_id,
                    amount: self.amount,
                    session_pubkey,
                    commitment: commitment.hash,
                }),
            ));
            self.slots.push(MakerSlot {
                offer,
                progress: SlotProgress::FillSent,
                session_pubkey: None,
                inputs: None,
            });
        }
        info!(round = %self.id, makers = ?self.makers(), "fills sent");

        self.commitment = Some(commitment);
        self.phase = TakerPhase::PubkeyExchange;
        self.deadline = now + self.policy.phase_timeout;
        Ok(out)
    }

    pub fn handle_message(
        &mut self,
        from: &str,
        message: Message,
        ctx: &mut RoundContext<'_>,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        let Some(index) = self.slots.iter().position(|s| s.nick() == from) else {
            debug!(round = %self.id, from, command = message.name(), "message from non-participant");
            return Vec::new();
        };
        let progress = self.slots[index].progress;
        let collecting = matches!(
            self.phase,
            TakerPhase::TxProposed | TakerPhase::CollectingSignatures
        );

        let result = match message {
            Message::Pubkey { session_pubkey } if progress == SlotProgress::FillSent => {
                self.on_pubkey(index, &session_pubkey, ctx)
            }
            Message::IoAuth(payload) if progress == SlotProgress::AuthSent => {
                self.on_ioauth(index, &payload, ctx)
            }
            Message::Sig { txid, .. } if collecting && !self.is_proposed(&txid) => {
                // Signed an earlier proposal; the re-sign of the current one follows.
                debug!(round = %self.id, from, %txid, "signature for a superseded transaction");
                return Vec::new();
            }
            Message::Sig { inputs, .. } if progress == SlotProgress::InputsVerified && collecting => {
                self.on_sig(index, &inputs)
            }
            Message::Error { reason } => {
                let mut out = self.exclude(index, ctx, &format!("maker gave up: {reason}"), false);
                out.extend(self.after_exclusion(ctx, now));
                return out;
            }
            other => Err(NetError::ProtocolViolation(format!(
                "unexpected {} from {from} while {:?}",
                other.name(),
                self.phase
            ))),
        };

        match result {
            Ok(mut out) => {
                out.extend(self.advance(ctx, now));
                out
            }
            Err(e) => {
                let mut out = self.exclude(index, ctx, &e.to_string(), true);
                out.extend(self.after_exclusion(ctx, now));
                out
            }
        }
    }

    fn on_pubkey(
        &mut self,
        index: usize,
        maker_pubkey: &PublicKey,
        ctx: &mut RoundContext<'_>,
    ) -> Result<Vec<Outbound>> {
        let commitment = self
            .commitment
            .as_ref()
            .ok_or_else(|| NetError::Session("no commitment for this round".into()))?;
        let slot = &mut self.slots[index];
        ctx.sessions.complete(&slot.offer.counterparty, maker_pubkey)?;
        let ownership_sig = ctx
            .wallet
            .sign_with_utxo_key(&commitment.utxo, &ownership_digest(&commitment.hash))?;

        slot.session_pubkey = Some(*maker_pubkey);
        slot.progress = SlotProgress::AuthSent;
        Ok(vec![Outbound::direct(
            slot.nick(),
            Message::Auth(AuthPayload {
                outpoint: commitment.utxo.outpoint,
                utxo_pubkey: commitment.utxo.pubkey,
                nonce: commitment.nonce,
                ownership_sig,
            }),
        )])
    }

    fn on_ioauth(
        &mut self,
        index: usize,
        payload: &IoAuthPayload,
        ctx: &mut RoundContext<'_>,
    ) -> Result<Vec<Outbound>> {
        let maker_session = self.slots[index]
            .session_pubkey
            .ok_or_else(|| NetError::Session("ioauth before session".into()))?;
        if !verify_digest(
            &payload.auth_pubkey,
            &ioauth_digest(&maker_session),
            &payload.auth_sig,
        ) {
            return Err(NetError::AuthenticationFailure("ioauth signature invalid".into()));
        }

        let mut taken: HashSet<OutPoint> = self.own.iter().map(|u| u.outpoint).collect();
        for slot in &self.slots {
            if let Some(inputs) = &slot.inputs {
                taken.extend(inputs.prevouts.iter().map(|(op, _)| *op));
            }
        }

        let mut prevouts = Vec::with_capacity(payload.utxos.len());
        for outpoint in &payload.utxos {
            if !taken.insert(*outpoint) {
                return Err(NetError::ProtocolViolation(format!(
                    "input {outpoint} offered twice"
                )));
            }
            let info = ctx.chain.lookup_utxo(outpoint)?.ok_or_else(|| {
                NetError::ProtocolViolation(format!("maker input {outpoint} not found"))
            })?;
            prevouts.push((
                *outpoint,
                TxOut {
                    value: info.value,
                    script_pubkey: info.script_pubkey,
                },
            ));
        }
        let auth_script = p2wpkh_script(&payload.auth_pubkey);
        if prevouts.first().map(|(_, txout)| &txout.script_pubkey) != Some(&auth_script) {
            return Err(NetError::AuthenticationFailure(
                "auth key does not control the first maker input".into(),
            ));
        }

        let slot = &mut self.slots[index];
        let total: Amount = prevouts.iter().map(|(_, txout)| txout.value).sum();
        if total + slot.cjfee(self.amount) < self.amount + slot.offer.terms.txfee {
            return Err(NetError::ProtocolViolation(format!(
                "maker inputs worth {total} cannot cover the amount"
            )));
        }

        debug!(round = %self.id, maker = %slot.nick(), inputs = prevouts.len(), "maker inputs verified");
        slot.inputs = Some(MakerInputs {
            prevouts,
            cj_script: payload.cj_script.clone(),
            change_script: payload.change_script.clone(),
            total,
        });
        slot.progress = SlotProgress::InputsVerified;
        Ok(Vec::new())
    }

    fn on_sig(&mut self, index: usize, signatures: &[InputSignature]) -> Result<Vec<Outbound>> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| NetError::Session("signature before transaction".into()))?;
        let slot = &self.slots[index];
        let expected: HashSet<OutPoint> = slot
            .inputs
            .as_ref()
            .map(|i| i.prevouts.iter().map(|(op, _)| *op).collect())
            .unwrap_or_default();
        let given: HashSet<OutPoint> = signatures.iter().map(|s| s.outpoint).collect();
        if given != expected || given.len() != signatures.len() {
            return Err(NetError::ProtocolViolation(
                "signatures do not match the maker's inputs".into(),
            ));
        }

        let mut candidate = tx.clone();
        for sig in signatures {
            candidate
                .apply_signature(&sig.outpoint, &sig.pubkey, &sig.signature)
                .map_err(|e| NetError::ProtocolViolation(format!("bad signature: {e}")))?;
        }
        debug!(round = %self.id, maker = %slot.nick(), "signatures accepted");
        self.tx = Some(candidate);
        self.slots[index].progress = SlotProgress::Signed;
        self.phase = TakerPhase::CollectingSignatures;
        Ok(Vec::new())
    }

    /// Moves the round forward once every remaining maker has caught up.
    fn advance(&mut self, ctx: &mut RoundContext<'_>, now: Instant) -> Vec<Outbound> {
        let Some(least) = self.slots.iter().map(|s| s.progress).min() else {
            return Vec::new();
        };
        match (self.phase, least) {
            (
                TakerPhase::PubkeyExchange | TakerPhase::UtxoCommitment,
                SlotProgress::InputsVerified,
            ) => self.propose(ctx, now),
            (TakerPhase::PubkeyExchange, SlotProgress::AuthSent) => {
                self.phase = TakerPhase::UtxoCommitment;
                self.deadline = now + self.policy.phase_timeout;
                Vec::new()
            }
            (TakerPhase::TxProposed | TakerPhase::CollectingSignatures, SlotProgress::Signed) => {
                self.complete(ctx)
            }
            _ => Vec::new(),
        }
    }

    fn build_tx(&self, ctx: &RoundContext<'_>) -> Result<CoinjoinTx> {
        let (Some(cj_script), Some(change_script)) = (&self.cj_script, &self.change_script) else {
            return Err(NetError::Session("taker scripts missing".into()));
        };
        let mut inputs: Vec<(OutPoint, TxOut)> =
            self.own.iter().map(|u| (u.outpoint, u.txout())).collect();
        let mut outputs = vec![TxOut {
            value: self.amount,
            script_pubkey: cj_script.clone(),
        }];

        let mut total_cjfee = Amount::ZERO;
        let mut total_txfee = Amount::ZERO;
        for slot in &self.slots {
            let maker = slot
                .inputs
                .as_ref()
                .ok_or_else(|| NetError::Session(format!("no inputs from {}", slot.nick())))?;
            let cjfee = slot.cjfee(self.amount);
            let txfee = slot.offer.terms.txfee;
            inputs.extend(maker.prevouts.iter().cloned());
            outputs.push(TxOut {
                value: self.amount,
                script_pubkey: maker.cj_script.clone(),
            });
            let change = (maker.total + cjfee)
                .checked_sub(self.amount + txfee)
                .ok_or_else(|| {
                    NetError::ProtocolViolation(format!("{} cannot cover the amount", slot.nick()))
                })?;
            if change >= DUST_THRESHOLD {
                outputs.push(TxOut {
                    value: change,
                    script_pubkey: maker.change_script.clone(),
                });
            }
            total_cjfee += cjfee;
            total_txfee += txfee;
        }

        let fee_rate = ctx.chain.current_fee_estimate(self.policy.fee_target_blocks)?;
        let network_fee =
            Amount::from_sat(fee_rate * estimate_vsize(inputs.len(), outputs.len() + 1));
        let own_total: Amount = self.own.iter().map(|u| u.value).sum();
        let spend = self.amount + total_cjfee + network_fee;
        let change = (own_total + total_txfee).checked_sub(spend).ok_or_else(|| {
            NetError::Bitcoin(BitcoinError::InsufficientFunds {
                needed: spend.to_sat(),
                available: (own_total + total_txfee).to_sat(),
            })
        })?;
        if change >= DUST_THRESHOLD {
            outputs.push(TxOut {
                value: change,
                script_pubkey: change_script.clone(),
            });
        }
        Ok(CoinjoinTx::build(inputs, outputs)?)
    }

    fn sign_own(&self, tx: &mut CoinjoinTx, ctx: &RoundContext<'_>) -> Result<()> {
        for utxo in &self.own {
            let index = tx
                .input_index(&utxo.outpoint)
                .ok_or_else(|| NetError::Session(format!("own input {} missing", utxo.outpoint)))?;
            let signature = ctx.wallet.sign_input(tx.transaction(), index, utxo)?;
            tx.apply_signature(&utxo.outpoint, &utxo.pubkey, &signature)?;
        }
        Ok(())
    }

    /// Builds the transaction from the current makers and sends it out.
    fn propose(&mut self, ctx: &mut RoundContext<'_>, now: Instant) -> Vec<Outbound> {
        let built = self.build_tx(ctx).and_then(|mut tx| {
            self.sign_own(&mut tx, ctx)?;
            Ok(tx)
        });
        let tx = match built {
            Ok(tx) => tx,
            Err(e) => return self.fail(ctx, TakerPhase::Aborted, e.to_string()),
        };

        let tx_hex = tx.unsigned_hex();
        info!(round = %self.id, txid = %tx.txid(), makers = self.slots.len(), "proposing transaction");
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            slot.progress = SlotProgress::InputsVerified;
            out.push(Outbound::direct(
                slot.nick(),
                Message::Tx {
                    tx_hex: tx_hex.clone(),
                },
            ));
        }
        self.tx = Some(tx);
        self.phase = TakerPhase::TxProposed;
        self.deadline = now + self.policy.phase_timeout;
        out
    }

    fn complete(&mut self, ctx: &mut RoundContext<'_>) -> Vec<Outbound> {
        if !self.tx.as_ref().is_some_and(CoinjoinTx::is_fully_signed) {
            return self.fail(ctx, TakerPhase::Aborted, "unsigned inputs remain".into());
        }
        let Some(tx) = self.tx.as_ref() else {
            return Vec::new();
        };
        let signed = tx.signed_hex();
        info!(round = %self.id, txid = %tx.txid(), "coinjoin fully signed");
        let out = self
            .slots
            .iter()
            .map(|slot| {
                Outbound::direct(
                    slot.nick(),
                    Message::Push {
                        tx_hex: signed.clone(),
                    },
                )
            })
            .collect();
        self.phase = TakerPhase::Completed;
        // Sessions stay open until the sealed pushes have gone out.
        self.release(ctx);
        out
    }

    fn exclude(
        &mut self,
        index: usize,
        ctx: &mut RoundContext<'_>,
        reason: &str,
        notify: bool,
    ) -> Vec<Outbound> {
        let slot = self.slots.remove(index);
        let nick = slot.nick().to_string();
        warn!(round = %self.id, maker = %nick, reason, "maker excluded");
        ctx.orderbook.release_key(&slot.offer.key(), self.id);
        ctx.sessions.remove(&nick);
        self.excluded.insert(nick.clone());
        if notify {
            vec![Outbound::direct(&nick, Message::error(reason))]
        } else {
            Vec::new()
        }
    }

    fn after_exclusion(&mut self, ctx: &mut RoundContext<'_>, now: Instant) -> Vec<Outbound> {
        if self.slots.len() < self.policy.minimum_makers.max(1) {
            let reason = format!(
                "{} makers left, need {}",
                self.slots.len(),
                self.policy.minimum_makers.max(1)
            );
            return self.fail(ctx, TakerPhase::Aborted, reason);
        }
        if matches!(
            self.phase,
            TakerPhase::TxProposed | TakerPhase::CollectingSignatures
        ) {
            return self.propose(ctx, now);
        }
        self.advance(ctx, now)
    }

    /// A participant left every channel.
    pub fn on_peer_left(
        &mut self,
        nick: &str,
        ctx: &mut RoundContext<'_>,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        match self.slots.iter().position(|s| s.nick() == nick) {
            Some(index) => {
                let mut out = self.exclude(index, ctx, "left", false);
                out.extend(self.after_exclusion(ctx, now));
                out
            }
            None => Vec::new(),
        }
    }

    pub fn abort(&mut self, ctx: &mut RoundContext<'_>, reason: &str) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.fail(ctx, TakerPhase::Aborted, reason.to_string())
    }

    fn fail(&mut self, ctx: &mut RoundContext<'_>, phase: TakerPhase, reason: String) -> Vec<Outbound> {
        warn!(round = %self.id, phase = ?phase, reason = %reason, "taker round failed");
        let out = self
            .slots
            .iter()
            .map(|slot| Outbound::direct(slot.nick(), Message::error(&reason)))
            .collect();
        self.phase = phase;
        self.failure = Some(reason);
        self.release(ctx);
        for slot in &self.slots {
            ctx.sessions.remove(slot.nick());
        }
        out
    }

    fn release(&mut self, ctx: &mut RoundContext<'_>) {
        ctx.orderbook.release(self.id);
        for utxo in &self.own {
            ctx.reserved_utxos.remove(&utxo.outpoint);
        }
    }
}
