// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use cojo_bitcoin::bitcoin::secp256k1::PublicKey;
use cojo_bitcoin::bitcoin::{Amount, ScriptBuf, Transaction, Txid};
use cojo_bitcoin::{p2wpkh_script, verify_digest, CoinjoinTx, Utxo, DUST_THRESHOLD};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Outbound, RoundContext, RoundId};
use crate::commitment::{commitment_hash, ioauth_digest, ownership_digest, MAX_COMMITMENT_NONCE};
use crate::error::{NetError, Result};
use crate::protocol::{AuthPayload, FillPayload, InputSignature, IoAuthPayload, Message, OfferTerms};

#[derive(Clone, Debug)]
pub struct MakerPolicy {
    pub min_confirmations: u32,
    /// The taker's committed coin must be worth at least this share of
    /// the coinjoin amount.
    pub taker_utxo_amount_percent: u64,
    pub phase_timeout: Duration,
}

impl Default for MakerPolicy {
    fn default() -> Self {
        Self {
            min_confirmations: 1,
            taker_utxo_amount_percent: 20,
            phase_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MakerPhase {
    PubkeySent,
    IoAuthSent,
    Signed,
    Completed,
    Aborted,
    TimedOut,
}

impl MakerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MakerPhase::Completed | MakerPhase::Aborted | MakerPhase::TimedOut
        )
    }
}

/// Our side of one taker's round. A maker runs at most one of these per
/// taker nick.
pub struct MakerRound {
    id: RoundId,
    taker: String,
    terms: OfferTerms,
    amount: Amount,
    commitment: [u8; 32],
    policy: MakerPolicy,
    phase: MakerPhase,
    deadline: Instant,
    failure: Option<String>,
    session_pubkey: PublicKey,
    utxos: Vec<Utxo>,
    cj_script: Option<ScriptBuf>,
    change_script: Option<ScriptBuf>,
    agreed_txid: Option<Txid>,
    final_tx: Option<Transaction>,
}

impl MakerRound {
    /// Answers a `fill` against one of our offers with our session key.
    pub fn accept_fill(
        id: RoundId,
        taker: &str,
        fill: &FillPayload,
        terms: &OfferTerms,
        policy: MakerPolicy,
        ctx: &mut RoundContext<'_>,
        now: Instant,
    ) -> Result<(Self, Vec<Outbound>)> {
        if fill.offer_id != terms.offer_id {
            return Err(NetError::ProtocolViolation(format!(
                "fill names offer {} but terms are for {}",
                fill.offer_id, terms.offer_id
            )));
        }
        if !terms.accepts(fill.amount) {
            return Err(NetError::ProtocolViolation(format!(
                "amount {} outside offer {} bounds",
                fill.amount, terms.offer_id
            )));
        }
        if ctx.blacklist.contains(&fill.commitment) {
            return Err(NetError::ProtocolViolation("commitment already used".into()));
        }

        let (session_pubkey, _) = ctx.sessions.respond(taker, &fill.session_pubkey)?;
        info!(round = %id, taker, amount = %fill.amount, offer_id = terms.offer_id, "fill accepted");

        let round = Self {
            id,
            taker: taker.to_string(),
            terms: terms.clone(),
            amount: fill.amount,
            commitment: fill.commitment,
            deadline: now + policy.phase_timeout,
            policy,
            phase: MakerPhase::PubkeySent,
            failure: None,
            session_pubkey,
            utxos: Vec::new(),
            cj_script: None,
            change_script: None,
            agreed_txid: None,
            final_tx: None,
        };
        Ok((round, vec![Outbound::direct(taker, Message::Pubkey { session_pubkey })]))
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn taker(&self) -> &str {
        &self.taker
    }

    pub fn phase(&self) -> MakerPhase {
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

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    /// The transaction the taker pushed, once completed.
    pub fn final_transaction(&self) -> Option<&Transaction> {
        self.final_tx.as_ref()
    }

    pub fn handle_message(
        &mut self,
        message: Message,
        ctx: &mut RoundContext<'_>,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        let result = match (self.phase, message) {
            (MakerPhase::PubkeySent, Message::Auth(auth)) => self.on_auth(&auth, ctx, now),
            (MakerPhase::IoAuthSent | MakerPhase::Signed, Message::Tx { tx_hex }) => {
                self.on_tx(&tx_hex, ctx, now)
            }
            (MakerPhase::Signed, Message::Push { tx_hex }) => self.on_push(&tx_hex, ctx),
            (_, Message::Error { reason }) => {
                self.finish(ctx, MakerPhase::Aborted, format!("taker gave up: {reason}"));
                return Vec::new();
            }
            (phase, other) => Err(NetError::ProtocolViolation(format!(
                "unexpected {} while {phase:?}",
                other.name()
            ))),
        };
        match result {
            Ok(out) => out,
            Err(e) => self.abort(ctx, &e.to_string()),
        }
    }

    fn on_auth(
        &mut self,
        auth: &AuthPayload,
        ctx: &mut RoundContext<'_>,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        if auth.nonce >= MAX_COMMITMENT_NONCE {
            return Err(NetError::ProtocolViolation(format!(
                "commitment nonce {} out of range",
                auth.nonce
            )));
        }
        if commitment_hash(&auth.outpoint, &auth.utxo_pubkey, auth.nonce) != self.commitment {
            return Err(NetError::AuthenticationFailure(
                "auth does not open the fill commitment".into(),
            ));
        }
        if ctx.blacklist.contains(&self.commitment) {
            return Err(NetError::ProtocolViolation("commitment already used".into()));
        }

        let info = ctx.chain.lookup_utxo(&auth.outpoint)?.ok_or_else(|| {
            NetError::ProtocolViolation(format!("committed coin {} not found", auth.outpoint))
        })?;
        if info.script_pubkey != p2wpkh_script(&auth.utxo_pubkey) {
            return Err(NetError::AuthenticationFailure(format!(
                "{} is not controlled by the revealed key",
                auth.outpoint
            )));
        }
        if info.confirmations < self.policy.min_confirmations {
            return Err(NetError::ProtocolViolation(format!(
                "committed coin has {} confirmations, need {}",
                info.confirmations, self.policy.min_confirmations
            )));
        }
        let min_value =
            self.amount.to_sat() as u128 * self.policy.taker_utxo_amount_percent as u128 / 100;
        if (info.value.to_sat() as u128) < min_value {
            return Err(NetError::ProtocolViolation(format!(
                "committed coin worth {} is below {}% of the amount",
                info.value, self.policy.taker_utxo_amount_percent
            )));
        }
        if !verify_digest(
            &auth.utxo_pubkey,
            &ownership_digest(&self.commitment),
            &auth.ownership_sig,
        ) {
            return Err(NetError::AuthenticationFailure(
                "ownership signature invalid".into(),
            ));
        }
        ctx.blacklist.check_and_insert(&self.commitment);

        let needed = self.amount + self.terms.txfee;
        let utxos = ctx.wallet.select_utxos(needed, ctx.reserved_utxos)?;
        let first = utxos
            .first()
            .ok_or_else(|| NetError::Session("wallet selected no coins".into()))?;
        let cj_script = ctx.wallet.fresh_script()?;
        let change_script = ctx.wallet.fresh_script()?;
        let auth_sig = ctx
            .wallet
            .sign_with_utxo_key(first, &ioauth_digest(&self.session_pubkey))?;
        let auth_pubkey = first.pubkey;

        ctx.reserved_utxos
            .extend(utxos.iter().map(|u| u.outpoint));
        let payload = IoAuthPayload {
            utxos: utxos.iter().map(|u| u.outpoint).collect(),
            auth_pubkey,
            cj_script: cj_script.clone(),
            change_script: change_script.clone(),
            auth_sig,
        };
        debug!(round = %self.id, taker = %self.taker, inputs = utxos.len(), "sending ioauth");

        self.utxos = utxos;
        self.cj_script = Some(cj_script);
        self.change_script = Some(change_script);
        self.phase = MakerPhase::IoAuthSent;
        self.deadline = now + self.policy.phase_timeout;
        Ok(vec![Outbound::direct(&self.taker, Message::IoAuth(payload))])
    }

    fn expected_change(&self) -> Amount {
        let total: Amount = self.utxos.iter().map(|u| u.value).sum();
        (total + self.terms.cjfee.fee_for(self.amount))
            .checked_sub(self.amount + self.terms.txfee)
            .unwrap_or(Amount::ZERO)
    }

    fn on_tx(
        &mut self,
        tx_hex: &str,
        ctx: &mut RoundContext<'_>,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let (Some(cj_script), Some(change_script)) = (&self.cj_script, &self.change_script) else {
            return Err(NetError::Session("tx before ioauth".into()));
        };
        let mut tx = CoinjoinTx::from_hex(tx_hex)?;
        for utxo in &self.utxos {
            tx.add_prevout(utxo.outpoint, utxo.txout())?;
        }

        let has_cj_output = tx
            .transaction()
            .output
            .iter()
            .any(|o| &o.script_pubkey == cj_script && o.value == self.amount);
        if !has_cj_output {
            return Err(NetError::ProtocolViolation(
                "no coinjoin output of the agreed amount".into(),
            ));
        }

        let change = self.expected_change();
        let expected = if change >= DUST_THRESHOLD {
            self.amount + change
        } else {
            self.amount
        };
        let mut received = tx.value_paid_to(cj_script);
        if change_script != cj_script {
            received += tx.value_paid_to(change_script);
        }
        if received != expected {
            return Err(NetError::ProtocolViolation(format!(
                "transaction pays us {received}, expected {expected}"
            )));
        }

        let mut inputs = Vec::with_capacity(self.utxos.len());
        for utxo in &self.utxos {
            let index = tx.input_index(&utxo.outpoint).ok_or_else(|| {
                NetError::ProtocolViolation(format!("our input {} missing", utxo.outpoint))
            })?;
            let signature = ctx.wallet.sign_input(tx.transaction(), index, utxo)?;
            inputs.push(InputSignature {
                outpoint: utxo.outpoint,
                signature,
                pubkey: utxo.pubkey,
            });
        }

        let txid = tx.txid();
        if self.agreed_txid.is_some() {
            info!(round = %self.id, taker = %self.taker, %txid, "re-signing revised transaction");
        }
        self.agreed_txid = Some(txid);
        self.phase = MakerPhase::Signed;
        self.deadline = now + self.policy.phase_timeout;
        Ok(vec![Outbound::direct(
            &self.taker,
            Message::Sig { txid, inputs },
        )])
    }

    fn on_push(&mut self, tx_hex: &str, ctx: &mut RoundContext<'_>) -> Result<Vec<Outbound>> {
        let tx = CoinjoinTx::from_hex(tx_hex)?;
        if Some(tx.txid()) != self.agreed_txid {
            return Err(NetError::ProtocolViolation(
                "pushed transaction differs from the one we signed".into(),
            ));
        }
        info!(round = %self.id, taker = %self.taker, txid = %tx.txid(), "coinjoin completed");
        self.final_tx = Some(tx.transaction().clone());
        self.finish(ctx, MakerPhase::Completed, String::new());
        Ok(Vec::new())
    }

    pub fn on_deadline(&mut self, ctx: &mut RoundContext<'_>, now: Instant) -> Vec<Outbound> {
        if self.is_terminal() || now < self.deadline {
            return Vec::new();
        }
        let reason = format!("timed out while {:?}", self.phase);
        self.finish(ctx, MakerPhase::TimedOut, reason.clone());
        vec![Outbound::direct(&self.taker, Message::error(&reason))]
    }

    pub fn abort(&mut self, ctx: &mut RoundContext<'_>, reason: &str) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.finish(ctx, MakerPhase::Aborted, reason.to_string());
        vec![Outbound::direct(&self.taker, Message::error(reason))]
    }

    /// The taker left every channel.
    pub fn on_peer_left(&mut self, ctx: &mut RoundContext<'_>) {
        if !self.is_terminal() {
            self.finish(ctx, MakerPhase::Aborted, "taker left".into());
        }
    }

    fn finish(&mut self, ctx: &mut RoundContext<'_>, phase: MakerPhase, reason: String) {
        if phase != MakerPhase::Completed {
            warn!(round = %self.id, taker = %self.taker, phase = ?phase, reason = %reason, "maker round ended");
            self.failure = Some(reason);
        }
        self.phase = phase;
        for utxo in &self.utxos {
            ctx.reserved_utxos.remove(&utxo.outpoint);
        }
        ctx.sessions.remove(&self.taker);
    }
}
