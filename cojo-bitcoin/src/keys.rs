// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};

use crate::error::{BitcoinError, Result};

const SIGNED_MESSAGE_DOMAIN: &[u8] = b"cojo-signed-command/v1";
const NICK_DOMAIN: &[u8] = b"cojo-nick/v1";

/// Prefix shared by every nick on the network; the version digit changes
/// whenever the derivation does.
pub const NICK_PREFIX: &str = "CJ1";
pub const NICK_HASH_LEN: usize = 14;
/// Number of collision-avoidance nicks a single key may claim.
pub const MAX_NICK_ATTEMPTS: u32 = 8;

/// Source of the identity key a node signs its protocol commands with.
pub trait KeySource: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, digest: &[u8; 32]) -> Result<Signature>;
}

/// An in-memory secp256k1 identity. Nick keys are ephemeral per process,
/// so nothing here is persisted.
pub struct IdentityKey {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        let secp = Secp256k1::signing_only();
        let secret = SecretKey::new(&mut bitcoin::secp256k1::rand::thread_rng());
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secp = Secp256k1::signing_only();
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| BitcoinError::InvalidSecretKey(e.to_string()))?;
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self { secret, public })
    }

    pub fn nick(&self, attempt: u32) -> String {
        derive_nick(&self.public, attempt)
    }
}

impl KeySource for IdentityKey {
    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<Signature> {
        let secp = Secp256k1::signing_only();
        Ok(secp.sign_ecdsa(&Message::from_digest(*digest), &self.secret))
    }
}

impl Drop for IdentityKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Deterministic nick for `pubkey`. `attempt` is bumped when a channel
/// reports the previous nick as taken.
pub fn derive_nick(pubkey: &PublicKey, attempt: u32) -> String {
    let mut engine = sha256::HashEngine::default();
    engine.input(NICK_DOMAIN);
    engine.input(&pubkey.serialize());
    engine.input(&attempt.to_be_bytes());
    let hash = sha256::Hash::from_engine(engine);
    let encoded = bitcoin::base58::encode(hash.as_byte_array());
    let tail: String = encoded.chars().take(NICK_HASH_LEN).collect();
    format!("{NICK_PREFIX}{tail}")
}

pub fn nick_matches_pubkey(nick: &str, pubkey: &PublicKey) -> bool {
    (0..MAX_NICK_ATTEMPTS).any(|attempt| derive_nick(pubkey, attempt) == nick)
}

/// Domain-separated digest signed by the command codec.
pub fn message_digest(data: &[u8]) -> [u8; 32] {
    let mut engine = sha256::HashEngine::default();
    engine.input(SIGNED_MESSAGE_DOMAIN);
    engine.input(data);
    sha256::Hash::from_engine(engine).to_byte_array()
}

pub fn verify_digest(pubkey: &PublicKey, digest: &[u8; 32], signature: &Signature) -> bool {
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&Message::from_digest(*digest), signature, pubkey)
        .is_ok()
}

pub fn parse_public_key(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str).map_err(|e| BitcoinError::InvalidPublicKey(e.to_string()))?;
    PublicKey::from_slice(&bytes).map_err(|e| BitcoinError::InvalidPublicKey(e.to_string()))
}

pub fn parse_signature(hex_str: &str) -> Result<Signature> {
    let bytes = hex::decode(hex_str).map_err(|e| BitcoinError::InvalidSignature(e.to_string()))?;
    Signature::from_compact(&bytes).map_err(|e| BitcoinError::InvalidSignature(e.to_string()))
}
