// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::str::FromStr;

use cojo_bitcoin::bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use cojo_bitcoin::bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use cojo_bitcoin::{parse_public_key, parse_signature};

use crate::codec::{decode_body, encode_body, Command};
use crate::error::{NetError, Result};
use crate::session::Session;

pub const CMD_ORDERBOOK: &str = "orderbook";
pub const CMD_RELOFFER: &str = "reloffer";
pub const CMD_ABSOFFER: &str = "absoffer";
pub const CMD_CANCEL: &str = "cancel";
pub const CMD_ERROR: &str = "error";
pub const CMD_FILL: &str = "fill";
pub const CMD_PUBKEY: &str = "pubkey";
pub const CMD_AUTH: &str = "auth";
pub const CMD_IOAUTH: &str = "ioauth";
pub const CMD_TX: &str = "tx";
pub const CMD_SIG: &str = "sig";
pub const CMD_PUSH: &str = "push";

pub const SENSITIVE_COMMANDS: [&str; 5] = [CMD_AUTH, CMD_IOAUTH, CMD_TX, CMD_SIG, CMD_PUSH];

pub const MAX_ERROR_REASON_LEN: usize = 256;
pub const MAX_IOAUTH_UTXOS: usize = 64;
const PPB: u64 = 1_000_000_000;
const RELATIVE_FEE_DECIMALS: usize = 9;

pub fn is_sensitive(name: &str) -> bool {
    SENSITIVE_COMMANDS.contains(&name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OfferKind {
    Relative,
    Absolute,
}

impl OfferKind {
    pub fn command_name(self) -> &'static str {
        match self {
            OfferKind::Relative => CMD_RELOFFER,
            OfferKind::Absolute => CMD_ABSOFFER,
        }
    }
}

/// Coinjoin fee a maker charges. Relative fees are held in parts per
/// billion of the coinjoin amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CjFee {
    Relative(u64),
    Absolute(Amount),
}

impl CjFee {
    pub fn kind(&self) -> OfferKind {
        match self {
            CjFee::Relative(_) => OfferKind::Relative,
            CjFee::Absolute(_) => OfferKind::Absolute,
        }
    }

    pub fn fee_for(&self, amount: Amount) -> Amount {
        match self {
            CjFee::Absolute(fee) => *fee,
            CjFee::Relative(ppb) => {
                let fee = (amount.to_sat() as u128 * *ppb as u128) / PPB as u128;
                Amount::from_sat(u64::try_from(fee).unwrap_or(u64::MAX))
            }
        }
    }

    fn parse(kind: OfferKind, s: &str) -> Result<Self> {
        match kind {
            OfferKind::Absolute => Ok(CjFee::Absolute(parse_sats(s)?)),
            OfferKind::Relative => Ok(CjFee::Relative(parse_relative_fee(s)?)),
        }
    }

    fn to_field(self) -> String {
        match self {
            CjFee::Absolute(fee) => fee.to_sat().to_string(),
            CjFee::Relative(ppb) => format_relative_fee(ppb),
        }
    }
}

/// Parses a decimal fraction such as `0.0002` into parts per billion.
pub fn parse_relative_fee(s: &str) -> Result<u64> {
    let bad = || NetError::MalformedMessage(format!("bad relative fee: {s}"));
    let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));
    if int_part.is_empty()
        || frac_part.len() > RELATIVE_FEE_DECIMALS
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(bad());
    }
    let int: u64 = int_part.parse().map_err(|_| bad())?;
    let frac: u64 = if frac_part.is_empty() {
        0
    } else {
        let padded = format!("{frac_part:0<width$}", width = RELATIVE_FEE_DECIMALS);
        padded.parse().map_err(|_| bad())?
    };
    int.checked_mul(PPB)
        .and_then(|v| v.checked_add(frac))
        .ok_or_else(bad)
}

pub fn format_relative_fee(ppb: u64) -> String {
    let int = ppb / PPB;
    let frac = ppb % PPB;
    if frac == 0 {
        return int.to_string();
    }
    let digits = format!("{frac:09}");
    format!("{int}.{}", digits.trim_end_matches('0'))
}

fn parse_sats(s: &str) -> Result<Amount> {
    s.parse::<u64>()
        .map(Amount::from_sat)
        .map_err(|_| NetError::MalformedMessage(format!("bad amount: {s}")))
}

fn parse_u32(s: &str, what: &str) -> Result<u32> {
    s.parse::<u32>()
        .map_err(|_| NetError::MalformedMessage(format!("bad {what}: {s}")))
}

fn parse_outpoint(s: &str) -> Result<OutPoint> {
    OutPoint::from_str(s).map_err(|e| NetError::MalformedMessage(format!("bad outpoint {s}: {e}")))
}

fn parse_script(s: &str) -> Result<ScriptBuf> {
    hex::decode(s)
        .map(ScriptBuf::from_bytes)
        .map_err(|e| NetError::MalformedMessage(format!("bad script: {e}")))
}

fn parse_hash32(s: &str) -> Result<[u8; 32]> {
    hex::decode(s)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| NetError::MalformedMessage(format!("bad 32-byte hash: {s}")))
}

fn pubkey_field(s: &str) -> Result<PublicKey> {
    parse_public_key(s).map_err(|e| NetError::MalformedMessage(e.to_string()))
}

fn signature_field(s: &str) -> Result<Signature> {
    parse_signature(s).map_err(|e| NetError::MalformedMessage(e.to_string()))
}

fn sig_hex(sig: &Signature) -> String {
    hex::encode(sig.serialize_compact())
}

fn key_hex(key: &PublicKey) -> String {
    hex::encode(key.serialize())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferTerms {
    pub offer_id: u32,
    pub min_size: Amount,
    pub max_size: Amount,
    pub txfee: Amount,
    pub cjfee: CjFee,
}

impl OfferTerms {
    pub fn new(offer_id: u32, min_size: Amount, max_size: Amount, cjfee: CjFee) -> Self {
        Self {
            offer_id,
            min_size,
            max_size,
            txfee: Amount::ZERO,
            cjfee,
        }
    }

    pub fn with_txfee(mut self, txfee: Amount) -> Self {
        self.txfee = txfee;
        self
    }

    pub fn kind(&self) -> OfferKind {
        self.cjfee.kind()
    }

    pub fn accepts(&self, amount: Amount) -> bool {
        amount >= self.min_size && amount <= self.max_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_size > self.max_size {
            return Err(NetError::MalformedMessage(format!(
                "offer {} has min_size above max_size",
                self.offer_id
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FillPayload {
    pub offer_id: u32,
    pub amount: Amount,
    pub session_pubkey: PublicKey,
    pub commitment: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthPayload {
    pub outpoint: OutPoint,
    pub utxo_pubkey: PublicKey,
    pub nonce: u8,
    pub ownership_sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoAuthPayload {
    pub utxos: Vec<OutPoint>,
    pub auth_pubkey: PublicKey,
    pub cj_script: ScriptBuf,
    pub change_script: ScriptBuf,
    pub auth_sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSignature {
    pub outpoint: OutPoint,
    pub signature: Signature,
    pub pubkey: PublicKey,
}

impl InputSignature {
    fn to_field(&self) -> String {
        format!(
            "{}|{}|{}",
            self.outpoint,
            sig_hex(&self.signature),
            key_hex(&self.pubkey)
        )
    }

    fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('|');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(outpoint), Some(sig), Some(pubkey), None) => Ok(Self {
                outpoint: parse_outpoint(outpoint)?,
                signature: signature_field(sig)?,
                pubkey: pubkey_field(pubkey)?,
            }),
            _ => Err(NetError::MalformedMessage(format!(
                "bad input signature: {s}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Orderbook,
    Offer(OfferTerms),
    Cancel { offer_id: u32 },
    Error { reason: String },
    Fill(FillPayload),
    Pubkey { session_pubkey: PublicKey },
    Auth(AuthPayload),
    IoAuth(IoAuthPayload),
    Tx { tx_hex: String },
    /// Signatures for our inputs of the transaction with `txid`.
    Sig {
        txid: Txid,
        inputs: Vec<InputSignature>,
    },
    Push { tx_hex: String },
}

impl Message {
    pub fn error(reason: &str) -> Self {
        let mut reason = reason.to_string();
        if reason.len() > MAX_ERROR_REASON_LEN {
            let mut cut = MAX_ERROR_REASON_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Message::Error { reason }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Orderbook => CMD_ORDERBOOK,
            Message::Offer(terms) => terms.kind().command_name(),
            Message::Cancel { .. } => CMD_CANCEL,
            Message::Error { .. } => CMD_ERROR,
            Message::Fill(_) => CMD_FILL,
            Message::Pubkey { .. } => CMD_PUBKEY,
            Message::Auth(_) => CMD_AUTH,
            Message::IoAuth(_) => CMD_IOAUTH,
            Message::Tx { .. } => CMD_TX,
            Message::Sig { .. } => CMD_SIG,
            Message::Push { .. } => CMD_PUSH,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        is_sensitive(self.name())
    }

    /// Public discovery traffic, the only messages accepted from the room.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Message::Orderbook | Message::Offer(_) | Message::Cancel { .. }
        )
    }

    pub fn to_command(&self) -> Result<Command> {
        let fields = match self {
            Message::Orderbook => Vec::new(),
            Message::Offer(t) => vec![
                t.offer_id.to_string(),
                t.min_size.to_sat().to_string(),
                t.max_size.to_sat().to_string(),
                t.txfee.to_sat().to_string(),
                t.cjfee.to_field(),
            ],
            Message::Cancel { offer_id } => vec![offer_id.to_string()],
            Message::Error { reason } => vec![reason.clone()],
            Message::Fill(p) => vec![
                p.offer_id.to_string(),
                p.amount.to_sat().to_string(),
                key_hex(&p.session_pubkey),
                hex::encode(p.commitment),
            ],
            Message::Pubkey { session_pubkey } => vec![key_hex(session_pubkey)],
            Message::Auth(p) => vec![
                p.outpoint.to_string(),
                key_hex(&p.utxo_pubkey),
                p.nonce.to_string(),
                sig_hex(&p.ownership_sig),
            ],
            Message::IoAuth(p) => vec![
                serde_json::to_string(&p.utxos)?,
                key_hex(&p.auth_pubkey),
                hex::encode(p.cj_script.as_bytes()),
                hex::encode(p.change_script.as_bytes()),
                sig_hex(&p.auth_sig),
            ],
            Message::Tx { tx_hex } | Message::Push { tx_hex } => vec![tx_hex.clone()],
            Message::Sig { txid, inputs } => std::iter::once(txid.to_string())
                .chain(inputs.iter().map(InputSignature::to_field))
                .collect(),
        };
        Ok(Command::new(self.name(), fields))
    }

    pub fn from_command(command: &Command) -> Result<Self> {
        let f = &command.fields;
        let arity = |n: usize| -> Result<()> {
            if f.len() != n {
                return Err(NetError::MalformedMessage(format!(
                    "{} expects {n} fields, got {}",
                    command.name,
                    f.len()
                )));
            }
            Ok(())
        };

        match command.name.as_str() {
            CMD_ORDERBOOK => {
                arity(0)?;
                Ok(Message::Orderbook)
            }
            CMD_RELOFFER | CMD_ABSOFFER => {
                arity(5)?;
                let kind = if command.name == CMD_RELOFFER {
                    OfferKind::Relative
                } else {
                    OfferKind::Absolute
                };
                let terms = OfferTerms {
                    offer_id: parse_u32(&f[0], "offer id")?,
                    min_size: parse_sats(&f[1])?,
                    max_size: parse_sats(&f[2])?,
                    txfee: parse_sats(&f[3])?,
                    cjfee: CjFee::parse(kind, &f[4])?,
                };
                terms.validate()?;
                Ok(Message::Offer(terms))
            }
            CMD_CANCEL => {
                arity(1)?;
                Ok(Message::Cancel {
                    offer_id: parse_u32(&f[0], "offer id")?,
                })
            }
            CMD_ERROR => {
                arity(1)?;
                Ok(Message::error(&f[0]))
            }
            CMD_FILL => {
                arity(4)?;
                Ok(Message::Fill(FillPayload {
                    offer_id: parse_u32(&f[0], "offer id")?,
                    amount: parse_sats(&f[1])?,
                    session_pubkey: pubkey_field(&f[2])?,
                    commitment: parse_hash32(&f[3])?,
                }))
            }
            CMD_PUBKEY => {
                arity(1)?;
                Ok(Message::Pubkey {
                    session_pubkey: pubkey_field(&f[0])?,
                })
            }
            CMD_AUTH => {
                arity(4)?;
                Ok(Message::Auth(AuthPayload {
                    outpoint: parse_outpoint(&f[0])?,
                    utxo_pubkey: pubkey_field(&f[1])?,
                    nonce: f[2].parse::<u8>().map_err(|_| {
                        NetError::MalformedMessage(format!("bad commitment nonce: {}", f[2]))
                    })?,
                    ownership_sig: signature_field(&f[3])?,
                }))
            }
            CMD_IOAUTH => {
                arity(5)?;
                let utxos: Vec<OutPoint> = serde_json::from_str(&f[0])?;
                if utxos.is_empty() || utxos.len() > MAX_IOAUTH_UTXOS {
                    return Err(NetError::MalformedMessage(format!(
                        "ioauth carries {} utxos",
                        utxos.len()
                    )));
                }
                Ok(Message::IoAuth(IoAuthPayload {
                    utxos,
                    auth_pubkey: pubkey_field(&f[1])?,
                    cj_script: parse_script(&f[2])?,
                    change_script: parse_script(&f[3])?,
                    auth_sig: signature_field(&f[4])?,
                }))
            }
            CMD_TX => {
                arity(1)?;
                Ok(Message::Tx {
                    tx_hex: f[0].clone(),
                })
            }
            CMD_PUSH => {
                arity(1)?;
                Ok(Message::Push {
                    tx_hex: f[0].clone(),
                })
            }
            CMD_SIG => {
                let Some((txid, rest)) = f.split_first().filter(|(_, rest)| !rest.is_empty())
                else {
                    return Err(NetError::MalformedMessage("sig without inputs".into()));
                };
                let txid = Txid::from_str(txid)
                    .map_err(|_| NetError::MalformedMessage(format!("bad txid: {txid}")))?;
                let inputs = rest
                    .iter()
                    .map(|s| InputSignature::parse(s))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Message::Sig { txid, inputs })
            }
            other => Err(NetError::MalformedMessage(format!("unknown command {other}"))),
        }
    }
}

/// Replaces the fields of a sensitive command with one encrypted field.
pub fn seal_command(session: &Session, command: &Command) -> Result<Command> {
    let sealed = session.encrypt(encode_body(&command.fields).as_bytes())?;
    Ok(Command::new(&command.name, vec![sealed]))
}

pub fn open_command(session: &Session, command: &Command) -> Result<Command> {
    if command.fields.len() != 1 {
        return Err(NetError::MalformedMessage(format!(
            "sealed {} must carry one field",
            command.name
        )));
    }
    let plaintext = session.decrypt(&command.fields[0])?;
    let body = String::from_utf8(plaintext)
        .map_err(|_| NetError::MalformedMessage("sealed body is not utf-8".into()))?;
    Ok(Command::new(&command.name, decode_body(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use cojo_bitcoin::bitcoin::hashes::Hash;
    use cojo_bitcoin::bitcoin::Txid;
    use cojo_bitcoin::{IdentityKey, KeySource};

    fn roundtrip(msg: Message) {
        let cmd = msg.to_command().unwrap();
        assert_eq!(Message::from_command(&cmd).unwrap(), msg);
    }

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([n; 32]), n as u32)
    }

    #[test]
    fn test_relative_fee_parsing() {
        assert_eq!(parse_relative_fee("0.0002").unwrap(), 200_000);
        assert_eq!(parse_relative_fee("1").unwrap(), PPB);
        assert_eq!(parse_relative_fee("0.000000001").unwrap(), 1);
        assert!(parse_relative_fee("0.0000000001").is_err());
        assert!(parse_relative_fee("-0.1").is_err());
        assert!(parse_relative_fee(".5").is_err());
        assert_eq!(format_relative_fee(200_000), "0.0002");
        assert_eq!(format_relative_fee(2 * PPB), "2");
    }

    #[test]
    fn test_fee_for_amount() {
        let amount = Amount::from_sat(10_000_000);
        assert_eq!(CjFee::Relative(200_000).fee_for(amount), Amount::from_sat(2_000));
        assert_eq!(
            CjFee::Absolute(Amount::from_sat(500)).fee_for(amount),
            Amount::from_sat(500)
        );
    }

    #[test]
    fn test_offer_messages() {
        roundtrip(Message::Offer(
            OfferTerms::new(
                0,
                Amount::from_sat(100_000),
                Amount::from_sat(5_000_000),
                CjFee::Relative(250),
            )
            .with_txfee(Amount::from_sat(1_000)),
        ));
        roundtrip(Message::Offer(OfferTerms::new(
            7,
            Amount::from_sat(1),
            Amount::from_sat(2),
            CjFee::Absolute(Amount::from_sat(30)),
        )));
        assert_eq!(
            Message::Offer(OfferTerms::new(1, Amount::ONE_SAT, Amount::ONE_SAT, CjFee::Relative(1)))
                .name(),
            CMD_RELOFFER
        );
    }

    #[test]
    fn test_inverted_offer_rejected() {
        let cmd = Command::new(
            CMD_ABSOFFER,
            vec!["1".into(), "500".into(), "100".into(), "0".into(), "10".into()],
        );
        assert!(Message::from_command(&cmd).is_err());
    }

    #[test]
    fn test_negotiation_messages() {
        let key = IdentityKey::generate();
        let digest = [9u8; 32];
        let sig = key.sign(&digest).unwrap();

        roundtrip(Message::Fill(FillPayload {
            offer_id: 3,
            amount: Amount::from_sat(1_000_000),
            session_pubkey: key.public_key(),
            commitment: [4u8; 32],
        }));
        roundtrip(Message::Auth(AuthPayload {
            outpoint: outpoint(1),
            utxo_pubkey: key.public_key(),
            nonce: 2,
            ownership_sig: sig,
        }));
        roundtrip(Message::IoAuth(IoAuthPayload {
            utxos: vec![outpoint(1), outpoint(2)],
            auth_pubkey: key.public_key(),
            cj_script: ScriptBuf::from_bytes(vec![0x00, 0x14, 1, 2, 3]),
            change_script: ScriptBuf::from_bytes(vec![0x00, 0x14, 4, 5, 6]),
            auth_sig: sig,
        }));
        roundtrip(Message::Sig {
            txid: Txid::from_byte_array([4; 32]),
            inputs: vec![
                InputSignature {
                    outpoint: outpoint(1),
                    signature: sig,
                    pubkey: key.public_key(),
                },
                InputSignature {
                    outpoint: outpoint(2),
                    signature: sig,
                    pubkey: key.public_key(),
                },
            ],
        });
        roundtrip(Message::Orderbook);
        roundtrip(Message::Cancel { offer_id: 9 });
    }

    #[test]
    fn test_unknown_and_wrong_arity() {
        assert!(Message::from_command(&Command::new("bogus", vec![])).is_err());
        assert!(Message::from_command(&Command::new(CMD_FILL, vec!["1".into()])).is_err());
        assert!(Message::from_command(&Command::new(CMD_SIG, vec![])).is_err());
        assert!(Message::from_command(&Command::new(
            CMD_SIG,
            vec![Txid::from_byte_array([4; 32]).to_string()]
        ))
        .is_err());
    }

    #[test]
    fn test_error_reason_truncated() {
        let long = "x".repeat(MAX_ERROR_REASON_LEN * 2);
        match Message::error(&long) {
            Message::Error { reason } => assert_eq!(reason.len(), MAX_ERROR_REASON_LEN),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sensitive_split() {
        assert!(Message::Tx { tx_hex: "00".into() }.is_sensitive());
        assert!(!Message::Orderbook.is_sensitive());
        assert!(Message::Orderbook.is_public());
        assert!(!Message::Push { tx_hex: "00".into() }.is_public());
    }

    #[test]
    fn test_seal_and_open() {
        let mut a = SessionManager::new();
        let mut b = SessionManager::new();
        let pa = a.initiate("b");
        let (pb, _) = b.respond("a", &pa).unwrap();
        a.complete("b", &pb).unwrap();

        let cmd = Command::new(CMD_TX, vec!["deadbeef".into()]);
        let sealed = seal_command(a.get("b").unwrap(), &cmd).unwrap();
        assert_eq!(sealed.name, CMD_TX);
        assert_ne!(sealed.fields, cmd.fields);
        let opened = open_command(b.get("a").unwrap(), &sealed).unwrap();
        assert_eq!(opened, cmd);
    }
}
