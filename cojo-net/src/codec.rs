// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command framing on top of length-limited text lines.
//!
//! A line looks like
//! `<nick> !<name> <instance> <index>/<count> <chunk>[ <pubkey> <sig>]`.
//! Chunks of the escaped body are spread over as few lines as the limit
//! allows; the last line carries the sender's key and a signature over
//! `(nick, channel tag, name, fields)`.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use cojo_bitcoin::bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use cojo_bitcoin::{message_digest, parse_public_key, parse_signature, verify_digest, KeySource};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{NetError, Result};
use crate::transport::SendError;

pub const COMMAND_PREFIX: char = '!';
pub const MAX_FRAGMENTS: usize = 100;
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_OPEN_PER_SENDER: usize = 8;

const INSTANCE_HEX_LEN: usize = 8;
const PUBKEY_HEX_LEN: usize = 66;
const SIG_HEX_LEN: usize = 128;
const SIGNATURE_SUFFIX_LEN: usize = 1 + PUBKEY_HEX_LEN + 1 + SIG_HEX_LEN;
/// Separators in `<nick> !<name> <instance> <i>/<c> `: four spaces, `!`
/// and `/`.
const HEADER_PUNCTUATION: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub fields: Vec<String>,
}

impl Command {
    pub fn new(name: &str, fields: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"._~:/+=-".contains(&b)
}

pub(crate) fn is_valid_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_graphic() && b != b'!')
}

pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for b in field.bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn unescape_field(escaped: &str) -> Result<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex_pair = escaped
                    .get(i + 1..i + 3)
                    .ok_or_else(|| NetError::MalformedMessage("truncated escape".into()))?;
                let b = u8::from_str_radix(hex_pair, 16)
                    .map_err(|_| NetError::MalformedMessage(format!("bad escape %{hex_pair}")))?;
                out.push(b);
                i += 3;
            }
            b if is_unreserved(b) => {
                out.push(b);
                i += 1;
            }
            b => {
                return Err(NetError::MalformedMessage(format!(
                    "unescaped byte 0x{b:02x} in field"
                )))
            }
        }
    }
    String::from_utf8(out).map_err(|_| NetError::MalformedMessage("field is not UTF-8".into()))
}

pub fn encode_body(fields: &[String]) -> String {
    let mut body = fields.len().to_string();
    for field in fields {
        body.push(',');
        body.push_str(&escape_field(field));
    }
    body
}

pub fn decode_body(body: &str) -> Result<Vec<String>> {
    let mut parts = body.split(',');
    let count: usize = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| NetError::MalformedMessage("missing field count".into()))?;
    let fields = parts.map(unescape_field).collect::<Result<Vec<_>>>()?;
    if fields.len() != count {
        return Err(NetError::MalformedMessage(format!(
            "expected {count} fields, found {}",
            fields.len()
        )));
    }
    Ok(fields)
}

/// Canonical bytes covered by a command signature. Every part is length
/// prefixed so no two tuples share an encoding.
pub fn signing_payload(nick: &str, channel_tag: &str, name: &str, fields: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut put = |part: &[u8]| {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    };
    put(nick.as_bytes());
    put(channel_tag.as_bytes());
    put(name.as_bytes());
    for field in fields {
        put(field.as_bytes());
    }
    out
}

fn digits(n: usize) -> usize {
    n.to_string().len()
}

fn header_len(nick: &str, name: &str, count: usize) -> usize {
    nick.len() + name.len() + INSTANCE_HEX_LEN + 2 * digits(count) + HEADER_PUNCTUATION
}

/// Smallest line limit under which any command from `nick` named `name`
/// can still be framed.
pub fn min_line_len(nick: &str, name: &str) -> usize {
    header_len(nick, name, MAX_FRAGMENTS) + SIGNATURE_SUFFIX_LEN + 1
}

pub fn encode(
    key: &dyn KeySource,
    nick: &str,
    channel_tag: &str,
    command: &Command,
    instance: u32,
    max_line_len: usize,
) -> Result<Vec<String>> {
    if !is_valid_token(nick) || !is_valid_token(&command.name) {
        return Err(NetError::MalformedMessage(format!(
            "invalid nick or command name: {nick} {}",
            command.name
        )));
    }

    let body = encode_body(&command.fields);
    let (count, cap_mid, cap_last) = fragment_layout(nick, &command.name, body.len(), max_line_len)?;

    let digest = message_digest(&signing_payload(
        nick,
        channel_tag,
        &command.name,
        &command.fields,
    ));
    let signature = key.sign(&digest)?;
    let suffix = format!(
        " {} {}",
        hex::encode(key.public_key().serialize()),
        hex::encode(signature.serialize_compact())
    );

    let split = body.len() - body.len().min(cap_last);
    let (rest, last) = body.split_at(split);
    let mut chunks: Vec<&str> = Vec::with_capacity(count);
    let mut remaining = rest;
    while !remaining.is_empty() {
        let (chunk, tail) = remaining.split_at(remaining.len().min(cap_mid));
        chunks.push(chunk);
        remaining = tail;
    }
    chunks.push(last);
    debug_assert_eq!(chunks.len(), count);

    let lines = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = format!(
                "{nick} {COMMAND_PREFIX}{} {instance:08x} {i}/{count} {chunk}",
                command.name
            );
            if i + 1 == count {
                line.push_str(&suffix);
            }
            line
        })
        .collect();
    Ok(lines)
}

/// Returns `(count, middle capacity, last capacity)`.
fn fragment_layout(
    nick: &str,
    name: &str,
    body_len: usize,
    max_line_len: usize,
) -> Result<(usize, usize, usize)> {
    let mut count = 1usize;
    loop {
        let header = header_len(nick, name, count);
        if max_line_len < header + SIGNATURE_SUFFIX_LEN + 1 {
            return Err(NetError::Send(SendError::LineTooLong {
                len: header + SIGNATURE_SUFFIX_LEN + 1,
                max: max_line_len,
            }));
        }
        let cap_mid = max_line_len - header;
        let cap_last = cap_mid - SIGNATURE_SUFFIX_LEN;
        let needed = if body_len <= cap_last {
            1
        } else {
            1 + (body_len - cap_last).div_ceil(cap_mid)
        };
        if needed > MAX_FRAGMENTS {
            return Err(NetError::MalformedMessage(format!(
                "command needs {needed} fragments, limit is {MAX_FRAGMENTS}"
            )));
        }
        if digits(needed) <= digits(count) {
            return Ok((needed, cap_mid, cap_last));
        }
        count = needed;
    }
}

#[derive(Debug)]
pub struct Fragment {
    pub nick: String,
    pub name: String,
    pub instance: u32,
    pub index: usize,
    pub count: usize,
    pub chunk: String,
    pub signature: Option<(PublicKey, Signature)>,
}

pub fn parse_fragment(line: &str) -> Result<Fragment> {
    let malformed = |what: &str| NetError::MalformedMessage(format!("{what}: {line}"));
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() != 5 && tokens.len() != 7 {
        return Err(malformed("wrong token count"));
    }

    let name = tokens[1]
        .strip_prefix(COMMAND_PREFIX)
        .filter(|n| is_valid_token(n))
        .ok_or_else(|| malformed("missing command"))?;
    if tokens[2].len() != INSTANCE_HEX_LEN {
        return Err(malformed("bad instance"));
    }
    let instance = u32::from_str_radix(tokens[2], 16).map_err(|_| malformed("bad instance"))?;
    let (index, count) = tokens[3]
        .split_once('/')
        .and_then(|(i, c)| Some((i.parse::<usize>().ok()?, c.parse::<usize>().ok()?)))
        .ok_or_else(|| malformed("bad fragment index"))?;
    if count == 0 || count > MAX_FRAGMENTS || index >= count {
        return Err(malformed("fragment index out of range"));
    }
    if tokens[4].is_empty() {
        return Err(malformed("empty chunk"));
    }

    let is_last = index + 1 == count;
    let signature = match (tokens.len() == 7, is_last) {
        (true, true) => {
            let pubkey = parse_public_key(tokens[5]).map_err(|_| malformed("bad pubkey"))?;
            let sig = parse_signature(tokens[6]).map_err(|_| malformed("bad signature"))?;
            Some((pubkey, sig))
        }
        (false, false) => None,
        (true, false) => return Err(malformed("signature on non-final fragment")),
        (false, true) => return Err(malformed("final fragment unsigned")),
    };

    Ok(Fragment {
        nick: tokens[0].to_string(),
        name: name.to_string(),
        instance,
        index,
        count,
        chunk: tokens[4].to_string(),
        signature,
    })
}

/// A fully reassembled command with the key and signature it arrived
/// with. Nothing here has been verified yet.
#[derive(Clone, Debug)]
pub struct AssembledCommand {
    pub sender: String,
    pub command: Command,
    pub pubkey: PublicKey,
    pub signature: Signature,
}

impl AssembledCommand {
    pub fn verify_with(&self, channel_tag: &str, key: &PublicKey) -> bool {
        let digest = message_digest(&signing_payload(
            &self.sender,
            channel_tag,
            &self.command.name,
            &self.command.fields,
        ));
        verify_digest(key, &digest, &self.signature)
    }
}

#[derive(Debug)]
pub enum FragmentState {
    Collecting { received: BTreeMap<usize, String> },
    Complete,
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    Collecting { received: usize, count: usize },
    Complete,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BufferKey {
    sender: String,
    name: String,
    instance: u32,
}

struct FragmentBuffer {
    count: usize,
    state: FragmentState,
    started: Instant,
    signature: Option<(PublicKey, Signature)>,
}

pub struct Reassembler {
    buffers: HashMap<BufferKey, FragmentBuffer>,
    timeout: Duration,
    max_open_per_sender: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_open_per_sender: DEFAULT_MAX_OPEN_PER_SENDER,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_open_per_sender(mut self, max: usize) -> Self {
        self.max_open_per_sender = max;
        self
    }

    /// Feeds one received line. Returns the command once its last missing
    /// fragment arrives.
    pub fn push(&mut self, from: &str, line: &str, now: Instant) -> Result<Option<AssembledCommand>> {
        let fragment = parse_fragment(line)?;
        if fragment.nick != from {
            return Err(NetError::MalformedMessage(format!(
                "header nick {} sent by {from}",
                fragment.nick
            )));
        }

        let key = BufferKey {
            sender: fragment.nick.clone(),
            name: fragment.name.clone(),
            instance: fragment.instance,
        };

        if !self.buffers.contains_key(&key) {
            let open = self
                .buffers
                .iter()
                .filter(|(k, b)| {
                    k.sender == key.sender && matches!(b.state, FragmentState::Collecting { .. })
                })
                .count();
            if open >= self.max_open_per_sender {
                return Err(NetError::MalformedMessage(format!(
                    "{from} has too many partial messages open"
                )));
            }
            self.buffers.insert(
                key.clone(),
                FragmentBuffer {
                    count: fragment.count,
                    state: FragmentState::Collecting {
                        received: BTreeMap::new(),
                    },
                    started: now,
                    signature: None,
                },
            );
        }

        let timeout = self.timeout;
        let Some(buffer) = self.buffers.get_mut(&key) else {
            return Ok(None);
        };
        if now.saturating_duration_since(buffer.started) >= timeout {
            buffer.state = FragmentState::Expired;
        }
        let received = match &mut buffer.state {
            FragmentState::Collecting { received } => received,
            FragmentState::Complete => {
                debug!(from, name = %key.name, "fragment for completed message ignored");
                return Ok(None);
            }
            FragmentState::Expired => {
                debug!(from, name = %key.name, "fragment for expired message dropped");
                return Ok(None);
            }
        };
        if fragment.count != buffer.count {
            return Err(NetError::MalformedMessage(format!(
                "fragment count {} disagrees with {}",
                fragment.count, buffer.count
            )));
        }

        received.insert(fragment.index, fragment.chunk);
        if fragment.signature.is_some() {
            buffer.signature = fragment.signature;
        }
        if received.len() < buffer.count {
            return Ok(None);
        }

        let body: String = received.values().map(String::as_str).collect();
        buffer.state = FragmentState::Complete;
        let (pubkey, signature) = buffer
            .signature
            .ok_or_else(|| NetError::MalformedMessage("message without signature".into()))?;
        let fields = decode_body(&body)?;

        Ok(Some(AssembledCommand {
            sender: key.sender,
            command: Command {
                name: key.name,
                fields,
            },
            pubkey,
            signature,
        }))
    }

    /// Drops every buffer older than the timeout. Returns how many
    /// never-completed messages were discarded.
    pub fn purge(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut incomplete = 0;
        self.buffers.retain(|_, b| {
            let keep = now.saturating_duration_since(b.started) < timeout;
            if !keep && !matches!(b.state, FragmentState::Complete) {
                incomplete += 1;
            }
            keep
        });
        incomplete
    }

    pub fn drop_sender(&mut self, nick: &str) {
        self.buffers.retain(|k, _| k.sender != nick);
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers.values().map(|b| b.started + self.timeout).min()
    }

    pub fn status(&self, sender: &str, name: &str, instance: u32, now: Instant) -> Option<BufferStatus> {
        let key = BufferKey {
            sender: sender.to_string(),
            name: name.to_string(),
            instance,
        };
        let buffer = self.buffers.get(&key)?;
        if now.saturating_duration_since(buffer.started) >= self.timeout {
            return Some(BufferStatus::Expired);
        }
        Some(match &buffer.state {
            FragmentState::Collecting { received } => BufferStatus::Collecting {
                received: received.len(),
                count: buffer.count,
            },
            FragmentState::Complete => BufferStatus::Complete,
            FragmentState::Expired => BufferStatus::Expired,
        })
    }

    pub fn open_buffers(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojo_bitcoin::IdentityKey;

    fn sample_command() -> Command {
        Command::new(
            "fill",
            vec![
                "0".into(),
                "1500000".into(),
                "a b,c|d%e".into(),
                String::new(),
            ],
        )
    }

    #[test]
    fn test_escape_roundtrip_specials() {
        let raw = "spaces and, commas|pipes%percent\nnewline ünï";
        let escaped = escape_field(raw);
        assert!(!escaped.contains([' ', ',', '|', '\n']));
        assert_eq!(unescape_field(&escaped).unwrap(), raw);
    }

    #[test]
    fn test_body_rejects_count_mismatch() {
        assert!(decode_body("2,a").is_err());
        assert!(decode_body("x,a").is_err());
        assert_eq!(decode_body("0").unwrap(), Vec::<String>::new());
        assert_eq!(decode_body("1,").unwrap(), vec![String::new()]);
    }

    #[test]
    fn test_single_line_roundtrip() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let cmd = sample_command();
        let lines = encode(&key, &nick, "hub/#room", &cmd, 7, 400).unwrap();
        assert_eq!(lines.len(), 1);

        let mut reassembler = Reassembler::new();
        let got = reassembler
            .push(&nick, &lines[0], Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(got.command, cmd);
        assert_eq!(got.pubkey, key.public_key());
        assert!(got.verify_with("hub/#room", &key.public_key()));
        assert!(!got.verify_with("other/#room", &key.public_key()));
    }

    #[test]
    fn test_fragmented_reverse_order() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let cmd = Command::new("tx", vec!["ab".repeat(600)]);
        let limit = min_line_len(&nick, "tx") + 20;
        let lines = encode(&key, &nick, "t", &cmd, 1, limit).unwrap();
        assert!(lines.len() > 2);
        assert!(lines.iter().all(|l| l.len() <= limit));

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut result = None;
        for line in lines.iter().rev() {
            result = reassembler.push(&nick, line, now).unwrap();
        }
        assert_eq!(result.unwrap().command, cmd);
    }

    #[test]
    fn test_duplicate_fragment_idempotent() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let cmd = Command::new("sig", vec!["x".repeat(500)]);
        let lines = encode(&key, &nick, "t", &cmd, 3, 300).unwrap();
        assert!(lines.len() >= 2);

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        assert!(reassembler.push(&nick, &lines[0], now).unwrap().is_none());
        assert!(reassembler.push(&nick, &lines[0], now).unwrap().is_none());
        let mut done = None;
        for line in &lines[1..] {
            done = reassembler.push(&nick, line, now).unwrap();
        }
        assert!(done.is_some());
        // Replays of a finished message are ignored.
        assert!(reassembler.push(&nick, &lines[0], now).unwrap().is_none());
    }

    #[test]
    fn test_inconsistent_count_rejected() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let first = format!("{nick} !tx 00000001 0/3 abc");
        let bad = format!("{nick} !tx 00000001 0/2 def");
        assert!(reassembler.push(&nick, &first, now).unwrap().is_none());
        assert!(matches!(
            reassembler.push(&nick, &bad, now),
            Err(NetError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_spoofed_header_nick_rejected() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let lines = encode(&key, &nick, "t", &sample_command(), 0, 400).unwrap();
        let mut reassembler = Reassembler::new();
        assert!(reassembler
            .push("someone-else", &lines[0], Instant::now())
            .is_err());
    }

    #[test]
    fn test_open_buffer_cap() {
        let mut reassembler = Reassembler::new().with_max_open_per_sender(2);
        let now = Instant::now();
        for instance in 0..2 {
            let line = format!("CJ1x !tx {instance:08x} 0/2 abc");
            assert!(reassembler.push("CJ1x", &line, now).unwrap().is_none());
        }
        let line = format!("CJ1x !tx {:08x} 0/2 abc", 9);
        assert!(reassembler.push("CJ1x", &line, now).is_err());
        let other = format!("CJ1y !tx {:08x} 0/2 abc", 9);
        assert!(reassembler.push("CJ1y", &other, now).unwrap().is_none());
    }

    #[test]
    fn test_limit_below_minimum_rejected() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let min = min_line_len(&nick, "fill");
        assert!(matches!(
            encode(&key, &nick, "t", &sample_command(), 0, min - 200),
            Err(NetError::Send(SendError::LineTooLong { .. }))
        ));
        assert!(encode(&key, &nick, "t", &sample_command(), 0, min).is_ok());
    }

    #[test]
    fn test_lines_never_exceed_limit() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let now = Instant::now();
        for limit in [min_line_len(&nick, "auth"), 300, 400, 512] {
            for len in 0..600 {
                let cmd = Command::new("auth", vec!["a".repeat(len)]);
                let lines = encode(&key, &nick, "t", &cmd, len as u32, limit).unwrap();
                for line in &lines {
                    assert!(
                        line.len() <= limit,
                        "field of {len}: line of {} bytes over {limit}",
                        line.len()
                    );
                }

                let mut reassembler = Reassembler::new();
                let mut done = None;
                for line in &lines {
                    done = reassembler.push(&nick, line, now).unwrap();
                }
                assert_eq!(done.unwrap().command, cmd);
            }
        }
    }
}
