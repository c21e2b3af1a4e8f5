// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! UTXO commitments sent with `fill`.
//!
//! A taker commits to one of its coins before learning anything about the
//! maker, then opens the commitment in `auth`. Makers remember every
//! commitment they were shown so the same coin cannot be used to probe
//! makers indefinitely.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use cojo_bitcoin::bitcoin::secp256k1::PublicKey;
use cojo_bitcoin::bitcoin::OutPoint;
use sha2::{Digest, Sha256};

const COMMITMENT_DOMAIN: &[u8] = b"cojo-commitment/v1";
const OWNERSHIP_DOMAIN: &[u8] = b"cojo-ownership/v1";
const IOAUTH_DOMAIN: &[u8] = b"cojo-ioauth/v1";

/// Commitments per coin; after this many the coin is burned for probing.
pub const MAX_COMMITMENT_NONCE: u8 = 3;

pub fn commitment_hash(outpoint: &OutPoint, pubkey: &PublicKey, nonce: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(outpoint.to_string().as_bytes());
    hasher.update(pubkey.serialize());
    hasher.update([nonce]);
    hasher.finalize().into()
}

/// Digest the taker signs with its coin key to open a commitment.
pub fn ownership_digest(commitment: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(OWNERSHIP_DOMAIN);
    hasher.update(commitment);
    hasher.finalize().into()
}

/// Digest the maker signs with its coin key in `ioauth`, tying its inputs
/// to the session it answered.
pub fn ioauth_digest(maker_session_pubkey: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(IOAUTH_DOMAIN);
    hasher.update(maker_session_pubkey.serialize());
    hasher.finalize().into()
}

#[derive(Default)]
pub struct CommitmentBlacklist {
    used: HashSet<[u8; 32]>,
}

impl CommitmentBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the commitment was seen before.
    pub fn check_and_insert(&mut self, commitment: &[u8; 32]) -> bool {
        self.used.insert(*commitment)
    }

    pub fn contains(&self, commitment: &[u8; 32]) -> bool {
        self.used.contains(commitment)
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// Taker side: hands out the next unused nonce per coin.
#[derive(Default)]
pub struct NonceTracker {
    next: HashMap<OutPoint, u8>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_nonce(&mut self, outpoint: &OutPoint) -> Option<u8> {
        let next = self.next.entry(*outpoint).or_insert(0);
        if *next >= MAX_COMMITMENT_NONCE {
            return None;
        }
        let nonce = *next;
        *next += 1;
        Some(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojo_bitcoin::bitcoin::hashes::Hash;
    use cojo_bitcoin::bitcoin::Txid;
    use cojo_bitcoin::{IdentityKey, KeySource};

    #[test]
    fn test_commitment_binds_every_part() {
        let key = IdentityKey::generate().public_key();
        let other = IdentityKey::generate().public_key();
        let op = OutPoint::new(Txid::from_byte_array([1; 32]), 0);
        let op2 = OutPoint::new(Txid::from_byte_array([1; 32]), 1);

        let base = commitment_hash(&op, &key, 0);
        assert_eq!(base, commitment_hash(&op, &key, 0));
        assert_ne!(base, commitment_hash(&op, &key, 1));
        assert_ne!(base, commitment_hash(&op2, &key, 0));
        assert_ne!(base, commitment_hash(&op, &other, 0));
        assert_ne!(ownership_digest(&base), base);
    }

    #[test]
    fn test_blacklist() {
        let mut blacklist = CommitmentBlacklist::new();
        assert!(blacklist.check_and_insert(&[1; 32]));
        assert!(!blacklist.check_and_insert(&[1; 32]));
        assert!(blacklist.contains(&[1; 32]));
        assert_eq!(blacklist.len(), 1);
    }

    #[test]
    fn test_nonce_tracker_exhausts() {
        let mut tracker = NonceTracker::new();
        let op = OutPoint::new(Txid::from_byte_array([2; 32]), 0);
        let nonces: Vec<_> = (0..MAX_COMMITMENT_NONCE)
            .map(|_| tracker.next_nonce(&op).unwrap())
            .collect();
        assert_eq!(nonces, vec![0, 1, 2]);
        assert_eq!(tracker.next_nonce(&op), None);
    }
}
