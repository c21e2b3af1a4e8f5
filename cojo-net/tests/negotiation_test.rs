// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use cojo_bitcoin::bitcoin::hashes::Hash;
use cojo_bitcoin::bitcoin::secp256k1::ecdsa::Signature;
use cojo_bitcoin::bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, Txid};
use cojo_bitcoin::{BitcoinError, MemoryChain, SoftwareWallet, Utxo, UtxoInfo, Wallet};
use cojo_net::{
    ChannelId, CjFee, FeeLimits, MakerPhase, MakerPolicy, MakerRound, Message, Offer, OfferTerms,
    Outbound, RoundId, RoundResources, TakerPhase, TakerPolicy, TakerRound,
};
use tokio::time::Instant;

const TAKER: &str = "taker";
const MAKER: &str = "maker";
const SECOND_MAKER: &str = "maker-two";

struct Party {
    wallet: SoftwareWallet,
    resources: RoundResources,
}

impl Party {
    fn funded(id: &str, seed: u8, coin: u8, value: u64, chain: &MemoryChain) -> Self {
        let wallet = SoftwareWallet::new(id, &[seed; 32]).unwrap();
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([coin; 32]),
            vout: 0,
        };
        let utxo = wallet.add_utxo(outpoint, Amount::from_sat(value));
        chain.insert(
            outpoint,
            UtxoInfo {
                value: utxo.value,
                script_pubkey: utxo.script_pubkey,
                confirmations: 6,
            },
        );
        Self {
            wallet,
            resources: RoundResources::new(),
        }
    }
}

fn terms() -> OfferTerms {
    OfferTerms::new(
        0,
        Amount::from_sat(100_000),
        Amount::from_sat(10_000_000),
        CjFee::Absolute(Amount::from_sat(1_000)),
    )
    .with_txfee(Amount::from_sat(500))
}

fn taker_policy() -> TakerPolicy {
    TakerPolicy {
        minimum_makers: 1,
        // Each test offer charges 1000 sat on a 1_000_000 sat coinjoin.
        fee_limits: FeeLimits {
            max_abs: Amount::from_sat(5_000),
            max_rel_ppb: 300_000,
        },
        ..TakerPolicy::default()
    }
}

fn only_direct(out: Vec<Outbound>, to: &str) -> Message {
    assert_eq!(out.len(), 1, "expected one message, got {out:?}");
    match out.into_iter().next() {
        Some(Outbound::Direct { to: got, message }) => {
            assert_eq!(got, to);
            message
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// Collects direct messages by recipient, one each.
fn by_recipient(out: Vec<Outbound>) -> HashMap<String, Message> {
    let mut messages = HashMap::new();
    for outbound in out {
        let Outbound::Direct { to, message } = outbound else {
            panic!("unexpected {outbound:?}");
        };
        assert!(messages.insert(to, message).is_none());
    }
    messages
}

/// Opens a round with one offer per maker and waits out the orderbook
/// window. Returns whatever the deadline produced.
fn open_round(
    resources: &mut RoundResources,
    wallet: &dyn Wallet,
    chain: &MemoryChain,
    makers: &[&str],
    now: Instant,
) -> (TakerRound, Vec<Outbound>) {
    for maker in makers {
        resources
            .orderbook
            .record_offer(Offer::new(maker, ChannelId(0), terms()));
    }
    let (mut round, out) = TakerRound::start(
        RoundId(1),
        Amount::from_sat(1_000_000),
        makers.len(),
        taker_policy(),
        now,
    )
    .unwrap();
    assert_eq!(out, vec![Outbound::Broadcast(Message::Orderbook)]);

    let mut ctx = resources.context(wallet, chain);
    assert!(round.on_deadline(&mut ctx, now).is_empty());
    let out = round.on_deadline(&mut ctx, now + Duration::from_secs(10));
    (round, out)
}

/// Runs a taker round up to the point where fills went out.
fn start_round(taker: &mut Party, chain: &MemoryChain, now: Instant) -> (TakerRound, Message) {
    let (round, out) = open_round(&mut taker.resources, &taker.wallet, chain, &[MAKER], now);
    let fill = only_direct(out, MAKER);
    assert_eq!(round.phase(), TakerPhase::PubkeyExchange);
    (round, fill)
}

#[test]
fn test_taker_and_maker_complete() {
    let chain = MemoryChain::new(2);
    let mut taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let mut maker = Party::funded("maker-wallet", 2, 0x22, 3_000_000, &chain);
    let now = Instant::now();

    let (mut round, fill) = start_round(&mut taker, &chain, now);
    let Message::Fill(fill) = fill else {
        panic!("expected fill, got {fill:?}");
    };
    assert!(taker.resources.orderbook.available().is_empty());

    let mut mctx = maker.resources.context(&maker.wallet, &chain);
    let (mut maker_round, out) = MakerRound::accept_fill(
        RoundId(7),
        TAKER,
        &fill,
        &terms(),
        MakerPolicy::default(),
        &mut mctx,
        now,
    )
    .unwrap();
    let pubkey = only_direct(out, TAKER);

    let mut tctx = taker.resources.context(&taker.wallet, &chain);
    let auth = only_direct(round.handle_message(MAKER, pubkey, &mut tctx, now), MAKER);
    assert!(matches!(auth, Message::Auth(_)));

    let ioauth = only_direct(maker_round.handle_message(auth, &mut mctx, now), TAKER);
    assert_eq!(maker_round.phase(), MakerPhase::IoAuthSent);
    assert_eq!(mctx.reserved_utxos.len(), 1);

    let tx = only_direct(round.handle_message(MAKER, ioauth, &mut tctx, now), MAKER);
    assert_eq!(round.phase(), TakerPhase::TxProposed);
    assert!(matches!(tx, Message::Tx { .. }));

    let sig = only_direct(maker_round.handle_message(tx, &mut mctx, now), TAKER);
    assert_eq!(maker_round.phase(), MakerPhase::Signed);

    let push = only_direct(round.handle_message(MAKER, sig, &mut tctx, now), MAKER);
    assert_eq!(round.phase(), TakerPhase::Completed);
    let signed = round.transaction().unwrap();
    assert!(signed.is_fully_signed());
    assert_eq!(signed.transaction().input.len(), 2);

    assert!(maker_round
        .handle_message(push, &mut mctx, now)
        .is_empty());
    assert_eq!(maker_round.phase(), MakerPhase::Completed);
    assert_eq!(
        maker_round.final_transaction().unwrap().compute_txid(),
        signed.txid()
    );
    assert!(mctx.reserved_utxos.is_empty());
    assert!(mctx.sessions.get(TAKER).is_none());
    assert!(mctx.blacklist.contains(&fill.commitment));

    // The coinjoin pays the maker its amount plus change including the fee.
    let maker_script = maker.wallet.script_pubkey();
    assert_eq!(
        signed.value_paid_to(&maker_script),
        Amount::from_sat(3_000_000 + 1_000 - 500)
    );
    assert_eq!(tctx.orderbook.available().len(), 1);
    assert!(tctx.reserved_utxos.is_empty());
}

#[test]
fn test_reused_commitment_refused() {
    let chain = MemoryChain::new(2);
    let mut taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let mut maker = Party::funded("maker-wallet", 2, 0x22, 3_000_000, &chain);
    let now = Instant::now();

    let (mut round, fill) = start_round(&mut taker, &chain, now);
    let Message::Fill(fill) = fill else {
        panic!("expected fill");
    };
    let mut mctx = maker.resources.context(&maker.wallet, &chain);
    let (mut maker_round, out) = MakerRound::accept_fill(
        RoundId(1),
        TAKER,
        &fill,
        &terms(),
        MakerPolicy::default(),
        &mut mctx,
        now,
    )
    .unwrap();
    let mut tctx = taker.resources.context(&taker.wallet, &chain);
    let auth = only_direct(
        round.handle_message(MAKER, only_direct(out, TAKER), &mut tctx, now),
        MAKER,
    );
    only_direct(maker_round.handle_message(auth, &mut mctx, now), TAKER);

    let replay = MakerRound::accept_fill(
        RoundId(2),
        "other-taker",
        &fill,
        &terms(),
        MakerPolicy::default(),
        &mut mctx,
        now,
    );
    assert!(replay.is_err());
}

#[test]
fn test_maker_rejects_tx_without_our_output() {
    let chain = MemoryChain::new(2);
    let mut taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let mut maker = Party::funded("maker-wallet", 2, 0x22, 3_000_000, &chain);
    let now = Instant::now();

    let (mut round, fill) = start_round(&mut taker, &chain, now);
    let Message::Fill(fill) = fill else {
        panic!("expected fill");
    };
    let mut mctx = maker.resources.context(&maker.wallet, &chain);
    let (mut maker_round, out) = MakerRound::accept_fill(
        RoundId(1),
        TAKER,
        &fill,
        &terms(),
        MakerPolicy::default(),
        &mut mctx,
        now,
    )
    .unwrap();
    let mut tctx = taker.resources.context(&taker.wallet, &chain);
    let auth = only_direct(
        round.handle_message(MAKER, only_direct(out, TAKER), &mut tctx, now),
        MAKER,
    );
    only_direct(maker_round.handle_message(auth, &mut mctx, now), TAKER);

    // A transaction spending the maker's coin to nobody it knows.
    let bogus = cojo_bitcoin::CoinjoinTx::build(
        vec![(
            maker.wallet.utxos()[0].outpoint,
            maker.wallet.utxos()[0].txout(),
        )],
        vec![cojo_bitcoin::bitcoin::TxOut {
            value: Amount::from_sat(1_000_000),
            script_pubkey: taker.wallet.script_pubkey(),
        }],
    )
    .unwrap();
    let reply = only_direct(
        maker_round.handle_message(
            Message::Tx {
                tx_hex: bogus.unsigned_hex(),
            },
            &mut mctx,
            now,
        ),
        TAKER,
    );
    assert!(matches!(reply, Message::Error { .. }));
    assert_eq!(maker_round.phase(), MakerPhase::Aborted);
    assert!(mctx.reserved_utxos.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_maker_times_out_and_offer_returns() {
    let chain = MemoryChain::new(2);
    let mut taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let start = Instant::now();

    let (mut round, _fill) = start_round(&mut taker, &chain, start);
    let deadline = round.deadline().unwrap();
    assert_eq!(deadline, start + Duration::from_secs(70));

    tokio::time::sleep_until(deadline).await;
    let mut ctx = taker.resources.context(&taker.wallet, &chain);
    round.on_deadline(&mut ctx, Instant::now());

    assert_eq!(round.phase(), TakerPhase::TimedOut);
    assert!(round.failure().unwrap().contains("in time"));
    assert!(round.deadline().is_none());
    assert_eq!(ctx.orderbook.available().len(), 1);
    assert!(ctx.reserved_utxos.is_empty());
    assert!(ctx.sessions.get(MAKER).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_maker_times_out_waiting_for_auth() {
    let chain = MemoryChain::new(2);
    let mut taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let mut maker = Party::funded("maker-wallet", 2, 0x22, 3_000_000, &chain);

    let (_round, fill) = start_round(&mut taker, &chain, Instant::now());
    let Message::Fill(fill) = fill else {
        panic!("expected fill");
    };
    let mut ctx = maker.resources.context(&maker.wallet, &chain);
    let (mut maker_round, _) = MakerRound::accept_fill(
        RoundId(3),
        TAKER,
        &fill,
        &terms(),
        MakerPolicy::default(),
        &mut ctx,
        Instant::now(),
    )
    .unwrap();
    assert!(ctx.sessions.get(TAKER).is_some());

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(maker_round.on_deadline(&mut ctx, Instant::now()).is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let reply = only_direct(maker_round.on_deadline(&mut ctx, Instant::now()), TAKER);
    assert!(matches!(reply, Message::Error { .. }));
    assert_eq!(maker_round.phase(), MakerPhase::TimedOut);
    assert!(ctx.sessions.get(TAKER).is_none());
}

fn accept(party: &mut Party, chain: &MemoryChain, fill: Message, now: Instant) -> (MakerRound, Message) {
    let Message::Fill(fill) = fill else {
        panic!("expected fill");
    };
    let mut ctx = party.resources.context(&party.wallet, chain);
    let (round, out) = MakerRound::accept_fill(
        RoundId(7),
        TAKER,
        &fill,
        &terms(),
        MakerPolicy::default(),
        &mut ctx,
        now,
    )
    .unwrap();
    (round, only_direct(out, TAKER))
}

fn maker_step(
    party: &mut Party,
    chain: &MemoryChain,
    round: &mut MakerRound,
    message: Message,
    now: Instant,
) -> Message {
    let mut ctx = party.resources.context(&party.wallet, chain);
    only_direct(round.handle_message(message, &mut ctx, now), TAKER)
}

fn taker_step(
    taker: &mut Party,
    chain: &MemoryChain,
    round: &mut TakerRound,
    from: &str,
    message: Message,
    now: Instant,
) -> Vec<Outbound> {
    let mut ctx = taker.resources.context(&taker.wallet, chain);
    round.handle_message(from, message, &mut ctx, now)
}

/// A taker and two makers after the first proposal, holding both makers'
/// signatures before the taker has seen them.
struct TwoMakers {
    chain: MemoryChain,
    taker: Party,
    first: Party,
    round: TakerRound,
    first_round: MakerRound,
    first_sig: Message,
    second_sig: Message,
}

fn negotiate_two_makers(now: Instant) -> TwoMakers {
    let chain = MemoryChain::new(2);
    let mut taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let mut first = Party::funded("maker-wallet", 2, 0x22, 3_000_000, &chain);
    let mut second = Party::funded("second-wallet", 3, 0x33, 3_000_000, &chain);

    let (mut round, out) = open_round(
        &mut taker.resources,
        &taker.wallet,
        &chain,
        &[MAKER, SECOND_MAKER],
        now,
    );
    let mut fills = by_recipient(out);
    assert_eq!(round.phase(), TakerPhase::PubkeyExchange);

    let (mut first_round, first_pubkey) =
        accept(&mut first, &chain, fills.remove(MAKER).unwrap(), now);
    let (mut second_round, second_pubkey) =
        accept(&mut second, &chain, fills.remove(SECOND_MAKER).unwrap(), now);

    let first_auth = only_direct(
        taker_step(&mut taker, &chain, &mut round, MAKER, first_pubkey, now),
        MAKER,
    );
    let second_auth = only_direct(
        taker_step(&mut taker, &chain, &mut round, SECOND_MAKER, second_pubkey, now),
        SECOND_MAKER,
    );
    assert_eq!(round.phase(), TakerPhase::UtxoCommitment);

    let first_ioauth = maker_step(&mut first, &chain, &mut first_round, first_auth, now);
    let second_ioauth = maker_step(&mut second, &chain, &mut second_round, second_auth, now);
    assert!(taker_step(&mut taker, &chain, &mut round, MAKER, first_ioauth, now).is_empty());
    let mut txs = by_recipient(taker_step(
        &mut taker,
        &chain,
        &mut round,
        SECOND_MAKER,
        second_ioauth,
        now,
    ));
    assert_eq!(round.phase(), TakerPhase::TxProposed);

    let first_sig = maker_step(&mut first, &chain, &mut first_round, txs.remove(MAKER).unwrap(), now);
    let second_sig = maker_step(
        &mut second,
        &chain,
        &mut second_round,
        txs.remove(SECOND_MAKER).unwrap(),
        now,
    );
    TwoMakers {
        chain,
        taker,
        first,
        round,
        first_round,
        first_sig,
        second_sig,
    }
}

/// Swaps the signature on `sig` for one made by another key.
fn forge(sig: Message, donor: &Message) -> Message {
    let Message::Sig { txid, mut inputs } = sig else {
        panic!("expected sig");
    };
    let Message::Sig { inputs: donated, .. } = donor else {
        panic!("expected sig");
    };
    inputs[0].signature = donated[0].signature;
    Message::Sig { txid, inputs }
}

fn sig_txid(sig: &Message) -> Txid {
    match sig {
        Message::Sig { txid, .. } => *txid,
        other => panic!("expected sig, got {other:?}"),
    }
}

/// Finishes a round whose only remaining maker is `MAKER` and checks the
/// result spends just the taker's and that maker's coins.
fn finish_with_first_maker(state: TwoMakers, tx: Message, now: Instant) {
    let TwoMakers {
        chain,
        mut taker,
        mut first,
        mut round,
        mut first_round,
        ..
    } = state;
    let sig = maker_step(&mut first, &chain, &mut first_round, tx, now);
    let push = only_direct(
        taker_step(&mut taker, &chain, &mut round, MAKER, sig, now),
        MAKER,
    );
    assert_eq!(round.phase(), TakerPhase::Completed);
    let signed = round.transaction().unwrap();
    assert!(signed.is_fully_signed());
    assert_eq!(signed.transaction().input.len(), 2);

    let mut ctx = first.resources.context(&first.wallet, &chain);
    assert!(first_round.handle_message(push, &mut ctx, now).is_empty());
    assert_eq!(first_round.phase(), MakerPhase::Completed);
    assert_eq!(
        first_round.final_transaction().unwrap().compute_txid(),
        signed.txid()
    );
}

#[test]
fn test_bad_signature_rebuilds_without_maker() {
    let now = Instant::now();
    let mut state = negotiate_two_makers(now);
    let first_txid = sig_txid(&state.first_sig);

    let first_sig = state.first_sig.clone();
    let out = taker_step(
        &mut state.taker,
        &state.chain,
        &mut state.round,
        MAKER,
        first_sig,
        now,
    );
    assert!(out.is_empty());
    assert_eq!(state.round.phase(), TakerPhase::CollectingSignatures);

    let forged = forge(state.second_sig.clone(), &state.first_sig);
    let mut out = by_recipient(taker_step(
        &mut state.taker,
        &state.chain,
        &mut state.round,
        SECOND_MAKER,
        forged,
        now,
    ));
    let Some(Message::Error { reason }) = out.remove(SECOND_MAKER) else {
        panic!("excluded maker was not told");
    };
    assert!(reason.contains("bad signature"), "{reason}");
    assert_eq!(state.round.phase(), TakerPhase::TxProposed);
    assert_eq!(state.round.makers(), vec![MAKER]);
    assert!(state
        .taker
        .resources
        .orderbook
        .available()
        .iter()
        .any(|o| o.counterparty == SECOND_MAKER));

    // The rebuilt transaction no longer spends the excluded maker's coin.
    let tx = out.remove(MAKER).unwrap();
    assert!(out.is_empty());
    assert_ne!(state.round.transaction().unwrap().txid(), first_txid);
    assert_eq!(state.round.transaction().unwrap().transaction().input.len(), 2);

    finish_with_first_maker(state, tx, now);
}

#[test]
fn test_signature_for_superseded_tx_ignored() {
    let now = Instant::now();
    let mut state = negotiate_two_makers(now);
    let first_txid = sig_txid(&state.first_sig);

    // The second maker's bad signature lands before the first maker's
    // good one, which then refers to a transaction no longer proposed.
    let forged = forge(state.second_sig.clone(), &state.first_sig);
    let mut out = by_recipient(taker_step(
        &mut state.taker,
        &state.chain,
        &mut state.round,
        SECOND_MAKER,
        forged,
        now,
    ));
    assert!(matches!(out.remove(SECOND_MAKER), Some(Message::Error { .. })));
    let tx = out.remove(MAKER).unwrap();

    let stale = state.first_sig.clone();
    let out = taker_step(
        &mut state.taker,
        &state.chain,
        &mut state.round,
        MAKER,
        stale,
        now,
    );
    assert!(out.is_empty(), "stale signature answered with {out:?}");
    assert_eq!(state.round.phase(), TakerPhase::TxProposed);
    assert!(state.round.is_participant(MAKER));
    assert_ne!(state.round.transaction().unwrap().txid(), first_txid);

    finish_with_first_maker(state, tx, now);
}

#[test]
fn test_bad_signature_below_minimum_fails_round() {
    let now = Instant::now();
    let mut state = negotiate_two_makers(now);
    let mut ctx = state.taker.resources.context(&state.taker.wallet, &state.chain);

    let out = state
        .round
        .handle_message(MAKER, Message::error("out of coins"), &mut ctx, now);
    assert!(matches!(only_direct(out, SECOND_MAKER), Message::Tx { .. }));
    assert!(!state.round.is_terminal());

    // A bad signature over the rebuilt transaction leaves nobody.
    let Message::Sig { inputs, .. } = forge(state.second_sig.clone(), &state.first_sig) else {
        panic!("expected sig");
    };
    let txid = state.round.transaction().unwrap().txid();
    let forged = Message::Sig { txid, inputs };
    let out = state.round.handle_message(SECOND_MAKER, forged, &mut ctx, now);
    assert_eq!(state.round.phase(), TakerPhase::Aborted);
    assert!(state.round.failure().unwrap().contains("0 makers left"));
    assert!(matches!(
        only_direct(out, SECOND_MAKER),
        Message::Error { reason } if reason.contains("bad signature")
    ));
    assert!(ctx.reserved_utxos.is_empty());
    assert_eq!(ctx.orderbook.available().len(), 2);
}

/// Funds rounds but has no destination scripts to give out.
struct NoScriptWallet(SoftwareWallet);

impl Wallet for NoScriptWallet {
    fn wallet_id(&self) -> &str {
        self.0.wallet_id()
    }

    fn select_utxos(
        &self,
        amount: Amount,
        exclude: &HashSet<OutPoint>,
    ) -> cojo_bitcoin::Result<Vec<Utxo>> {
        self.0.select_utxos(amount, exclude)
    }

    fn fresh_script(&self) -> cojo_bitcoin::Result<ScriptBuf> {
        Err(BitcoinError::Signing("no addresses left".into()))
    }

    fn sign_input(
        &self,
        tx: &Transaction,
        index: usize,
        utxo: &Utxo,
    ) -> cojo_bitcoin::Result<Signature> {
        self.0.sign_input(tx, index, utxo)
    }

    fn sign_with_utxo_key(&self, utxo: &Utxo, digest: &[u8; 32]) -> cojo_bitcoin::Result<Signature> {
        self.0.sign_with_utxo_key(utxo, digest)
    }
}

#[test]
fn test_failed_fill_leaves_coins_and_offers_free() {
    let chain = MemoryChain::new(2);
    let taker = Party::funded("taker-wallet", 1, 0x11, 2_000_000, &chain);
    let wallet = NoScriptWallet(taker.wallet);
    let mut resources = taker.resources;

    let (round, out) = open_round(&mut resources, &wallet, &chain, &[MAKER], Instant::now());
    assert!(out.is_empty());
    assert_eq!(round.phase(), TakerPhase::Aborted);
    assert!(round.failure().unwrap().contains("no addresses left"));
    assert!(round.own_utxos().is_empty());
    assert!(resources.reserved_utxos.is_empty());
    assert_eq!(resources.orderbook.available().len(), 1);

    // No commitment nonce was spent on the failed attempt.
    let coin = wallet.0.utxos()[0].outpoint;
    assert_eq!(resources.nonces.next_nonce(&coin), Some(0));
}
