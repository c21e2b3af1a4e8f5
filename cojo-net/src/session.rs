// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    XChaCha20Poly1305,
};
use cojo_bitcoin::bitcoin::secp256k1::{ecdh::SharedSecret, PublicKey, Secp256k1, SecretKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::error::{NetError, Result};

const SESSION_KDF_SALT: &[u8] = b"cojo-session/v1";
const NONCE_SIZE: usize = 24;

struct EphemeralKey(SecretKey);

impl EphemeralKey {
    fn generate() -> (Self, PublicKey) {
        let secp = Secp256k1::signing_only();
        let secret = SecretKey::new(&mut cojo_bitcoin::bitcoin::secp256k1::rand::thread_rng());
        let public = PublicKey::from_secret_key(&secp, &secret);
        (Self(secret), public)
    }
}

impl Drop for EphemeralKey {
    fn drop(&mut self) {
        self.0.non_secure_erase();
    }
}

/// Derives the symmetric key from an ECDH secret. Both ephemeral keys go
/// into the HKDF info in sorted order, so both ends get the same key.
pub fn derive_session_key(shared: &[u8; 32], a: &PublicKey, b: &PublicKey) -> Result<Zeroizing<[u8; 32]>> {
    let (first, second) = if a.serialize() <= b.serialize() {
        (a, b)
    } else {
        (b, a)
    };
    let mut info = Vec::with_capacity(66);
    info.extend_from_slice(&first.serialize());
    info.extend_from_slice(&second.serialize());

    let hk = Hkdf::<Sha256>::new(Some(SESSION_KDF_SALT), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, okm.as_mut())
        .map_err(|_| NetError::Crypto("HKDF expand failed".into()))?;
    Ok(okm)
}

pub struct Session {
    local: PublicKey,
    remote: PublicKey,
    key: Zeroizing<[u8; 32]>,
    established_at: Instant,
}

impl Session {
    fn establish(secret: &EphemeralKey, local: PublicKey, remote: PublicKey) -> Result<Self> {
        let shared = SharedSecret::new(&remote, &secret.0);
        let bytes = Zeroizing::new(shared.secret_bytes());
        let key = derive_session_key(&bytes, &local, &remote)?;
        Ok(Self {
            local,
            remote,
            key,
            established_at: Instant::now(),
        })
    }

    pub fn local_pubkey(&self) -> &PublicKey {
        &self.local
    }

    pub fn remote_pubkey(&self) -> &PublicKey {
        &self.remote
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(self.key.as_ref()));
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| NetError::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|_| NetError::Crypto("ciphertext is not base64".into()))?;
        if raw.len() < NONCE_SIZE {
            return Err(NetError::Crypto("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(self.key.as_ref()));
        cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| NetError::Crypto("decryption failed".into()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Encrypted sessions keyed by counterparty nick. A completed handshake
/// replaces whatever session existed with that nick.
#[derive(Default)]
pub struct SessionManager {
    pending: HashMap<String, (EphemeralKey, PublicKey)>,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiate(&mut self, remote: &str) -> PublicKey {
        let (secret, public) = EphemeralKey::generate();
        self.pending.insert(remote.to_string(), (secret, public));
        public
    }

    pub fn respond(&mut self, remote: &str, their_pubkey: &PublicKey) -> Result<(PublicKey, &Session)> {
        let (secret, public) = EphemeralKey::generate();
        let session = Session::establish(&secret, public, *their_pubkey)?;
        self.pending.remove(remote);
        self.sessions.insert(remote.to_string(), session);
        let session = self
            .sessions
            .get(remote)
            .ok_or_else(|| NetError::Session(format!("session with {remote} vanished")))?;
        Ok((public, session))
    }

    pub fn complete(&mut self, remote: &str, their_pubkey: &PublicKey) -> Result<&Session> {
        let (secret, public) = self
            .pending
            .remove(remote)
            .ok_or_else(|| NetError::Session(format!("no handshake pending with {remote}")))?;
        let session = Session::establish(&secret, public, *their_pubkey)?;
        self.sessions.insert(remote.to_string(), session);
        self.sessions
            .get(remote)
            .ok_or_else(|| NetError::Session(format!("session with {remote} vanished")))
    }

    pub fn get(&self, remote: &str) -> Option<&Session> {
        self.sessions.get(remote)
    }

    pub fn encrypt(&self, remote: &str, plaintext: &[u8]) -> Result<String> {
        self.sessions
            .get(remote)
            .ok_or_else(|| NetError::Session(format!("no session with {remote}")))?
            .encrypt(plaintext)
    }

    pub fn decrypt(&self, remote: &str, encoded: &str) -> Result<Vec<u8>> {
        self.sessions
            .get(remote)
            .ok_or_else(|| NetError::Session(format!("no session with {remote}")))?
            .decrypt(encoded)
    }

    pub fn remove(&mut self, remote: &str) {
        self.pending.remove(remote);
        self.sessions.remove(remote);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> (SessionManager, SessionManager) {
        let mut taker = SessionManager::new();
        let mut maker = SessionManager::new();
        let taker_pub = taker.initiate("maker");
        let (maker_pub, _) = maker.respond("taker", &taker_pub).unwrap();
        taker.complete("maker", &maker_pub).unwrap();
        (taker, maker)
    }

    #[test]
    fn test_handshake_and_roundtrip() {
        let (taker, maker) = handshake();
        let ct = taker.encrypt("maker", b"auth fields").unwrap();
        assert_eq!(maker.decrypt("taker", &ct).unwrap(), b"auth fields");

        let reply = maker.encrypt("taker", b"ioauth").unwrap();
        assert_eq!(taker.decrypt("maker", &reply).unwrap(), b"ioauth");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (taker, maker) = handshake();
        let ct = taker.encrypt("maker", b"tx").unwrap();
        let mut raw = BASE64.decode(&ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(
            maker.decrypt("taker", &tampered),
            Err(NetError::Crypto(_))
        ));
    }

    #[test]
    fn test_new_handshake_replaces_session() {
        let (mut taker, maker) = handshake();
        let old = taker.encrypt("maker", b"old").unwrap();

        let mut maker2 = SessionManager::new();
        let pk = taker.initiate("maker");
        let (maker_pub, _) = maker2.respond("taker", &pk).unwrap();
        taker.complete("maker", &maker_pub).unwrap();

        let new = taker.encrypt("maker", b"new").unwrap();
        assert!(maker.decrypt("taker", &new).is_err());
        assert_eq!(maker2.decrypt("taker", &new).unwrap(), b"new");
        assert!(maker2.decrypt("taker", &old).is_err());
    }

    #[test]
    fn test_complete_without_initiate_fails() {
        let mut sessions = SessionManager::new();
        let (_, public) = EphemeralKey::generate();
        assert!(matches!(
            sessions.complete("nobody", &public),
            Err(NetError::Session(_))
        ));
    }
}
