// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use cojo_bitcoin::{IdentityKey, KeySource};
use cojo_net::codec::{encode, min_line_len, BufferStatus};
use cojo_net::{Command, Reassembler};
use proptest::prelude::*;
use tokio::time::Instant;

fn command_strategy() -> impl Strategy<Value = Command> {
    (
        prop::sample::select(vec!["fill", "tx", "sig", "ioauth", "reloffer"]),
        prop::collection::vec("\\PC{0,200}", 0..4),
    )
        .prop_map(|(name, fields)| Command::new(name, fields))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_reassembly_roundtrip_any_order(
        seed in 1u8..=255,
        command in command_strategy(),
        slack in 0usize..400,
        instance in any::<u32>(),
        order in prop::collection::vec(any::<u64>(), 100),
    ) {
        let key = IdentityKey::from_secret_bytes(&[seed; 32]).unwrap();
        let nick = key.nick(0);
        let limit = min_line_len(&nick, &command.name) + slack;
        let lines = encode(&key, &nick, "memory/#pit", &command, instance, limit).unwrap();
        prop_assert!(lines.iter().all(|l| l.len() <= limit));

        let mut shuffled: Vec<(u64, &String)> = lines
            .iter()
            .enumerate()
            .map(|(i, l)| (order[i % order.len()], l))
            .collect();
        shuffled.sort_by_key(|(k, _)| *k);

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut done = Vec::new();
        for (_, line) in shuffled {
            if let Some(assembled) = reassembler.push(&nick, line, now).unwrap() {
                done.push(assembled);
            }
        }
        prop_assert_eq!(done.len(), 1);
        let assembled = &done[0];
        prop_assert_eq!(&assembled.command, &command);
        prop_assert_eq!(assembled.pubkey, key.public_key());
        prop_assert!(assembled.verify_with("memory/#pit", &key.public_key()));
    }

    #[test]
    fn prop_signature_bound_to_channel_tag(
        seed in 1u8..=255,
        command in command_strategy(),
    ) {
        let key = IdentityKey::from_secret_bytes(&[seed; 32]).unwrap();
        let nick = key.nick(0);
        let limit = min_line_len(&nick, &command.name) + 100;
        let lines = encode(&key, &nick, "irc/#a", &command, 0, limit).unwrap();

        let mut reassembler = Reassembler::new();
        let now = Instant::now();
        let mut assembled = None;
        for line in &lines {
            assembled = reassembler.push(&nick, line, now).unwrap();
        }
        let assembled = assembled.unwrap();
        prop_assert!(!assembled.verify_with("irc/#b", &key.public_key()));
    }
}

#[test]
fn test_incomplete_buffers_purged() {
    let key = IdentityKey::generate();
    let nick = key.nick(0);
    let command = Command::new("tx", vec!["ff".repeat(400)]);
    let lines = encode(&key, &nick, "t", &command, 5, 300).unwrap();
    assert!(lines.len() >= 3);

    let mut reassembler = Reassembler::new().with_timeout(Duration::from_secs(30));
    let start = Instant::now();
    assert!(reassembler.push(&nick, &lines[0], start).unwrap().is_none());
    assert_eq!(reassembler.open_buffers(), 1);
    assert_eq!(
        reassembler.next_deadline(),
        Some(start + Duration::from_secs(30))
    );
    assert!(matches!(
        reassembler.status(&nick, "tx", 5, start),
        Some(BufferStatus::Collecting { received: 1, .. })
    ));

    assert_eq!(reassembler.purge(start + Duration::from_secs(29)), 0);
    assert_eq!(reassembler.purge(start + Duration::from_secs(30)), 1);
    assert_eq!(reassembler.open_buffers(), 0);
    assert!(reassembler.next_deadline().is_none());

    // Late fragments start a fresh buffer that cannot complete without the rest.
    let late = start + Duration::from_secs(31);
    assert!(reassembler.push(&nick, &lines[1], late).unwrap().is_none());
    assert_eq!(reassembler.open_buffers(), 1);
}

#[test]
fn test_completed_buffer_purge_not_counted() {
    let key = IdentityKey::generate();
    let nick = key.nick(0);
    let command = Command::new("orderbook", Vec::new());
    let lines = encode(&key, &nick, "t", &command, 1, 400).unwrap();

    let mut reassembler = Reassembler::new().with_timeout(Duration::from_secs(10));
    let start = Instant::now();
    assert!(reassembler.push(&nick, &lines[0], start).unwrap().is_some());
    assert_eq!(
        reassembler.status(&nick, "orderbook", 1, start),
        Some(BufferStatus::Complete)
    );
    assert_eq!(reassembler.purge(start + Duration::from_secs(10)), 0);
    assert_eq!(reassembler.open_buffers(), 0);
}
