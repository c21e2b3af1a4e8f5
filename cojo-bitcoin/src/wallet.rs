// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashSet;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, CompressedPublicKey, OutPoint, ScriptBuf, Transaction, TxOut};
use parking_lot::RwLock;

use crate::error::{BitcoinError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub pubkey: PublicKey,
}

impl Utxo {
    pub fn txout(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Wallet collaborator: coin selection, fresh destinations and per-input
/// signing. Key management stays behind this trait.
pub trait Wallet: Send + Sync {
    fn wallet_id(&self) -> &str;

    /// Selects confirmed coins worth at least `amount`, skipping `exclude`.
    fn select_utxos(&self, amount: Amount, exclude: &HashSet<OutPoint>) -> Result<Vec<Utxo>>;

    fn fresh_script(&self) -> Result<ScriptBuf>;

    fn sign_input(&self, tx: &Transaction, index: usize, utxo: &Utxo) -> Result<Signature>;

    /// Proves control of `utxo` by signing an arbitrary digest with its key.
    fn sign_with_utxo_key(&self, utxo: &Utxo, digest: &[u8; 32]) -> Result<Signature>;
}

pub fn p2wpkh_script(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(*pubkey).wpubkey_hash())
}

/// Single-key P2WPKH wallet kept entirely in memory. Used by simulations
/// and tests; a production node plugs its own [`Wallet`] in.
pub struct SoftwareWallet {
    id: String,
    secret: SecretKey,
    pubkey: PublicKey,
    utxos: RwLock<Vec<Utxo>>,
}

impl SoftwareWallet {
    pub fn new(id: &str, secret_bytes: &[u8; 32]) -> Result<Self> {
        let secp = Secp256k1::signing_only();
        let secret = SecretKey::from_slice(secret_bytes)
            .map_err(|e| BitcoinError::InvalidSecretKey(e.to_string()))?;
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self {
            id: id.to_string(),
            secret,
            pubkey,
            utxos: RwLock::new(Vec::new()),
        })
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        p2wpkh_script(&self.pubkey)
    }

    pub fn add_utxo(&self, outpoint: OutPoint, value: Amount) -> Utxo {
        let utxo = Utxo {
            outpoint,
            value,
            script_pubkey: self.script_pubkey(),
            pubkey: self.pubkey,
        };
        self.utxos.write().push(utxo.clone());
        utxo
    }

    pub fn utxos(&self) -> Vec<Utxo> {
        self.utxos.read().clone()
    }

    pub fn balance(&self) -> Amount {
        self.utxos.read().iter().map(|u| u.value).sum()
    }

    fn owns(&self, utxo: &Utxo) -> Result<()> {
        if utxo.pubkey != self.pubkey {
            return Err(BitcoinError::Signing(format!(
                "utxo {} not controlled by wallet {}",
                utxo.outpoint, self.id
            )));
        }
        Ok(())
    }
}

impl Wallet for SoftwareWallet {
    fn wallet_id(&self) -> &str {
        &self.id
    }

    fn select_utxos(&self, amount: Amount, exclude: &HashSet<OutPoint>) -> Result<Vec<Utxo>> {
        let mut candidates: Vec<Utxo> = self
            .utxos
            .read()
            .iter()
            .filter(|u| !exclude.contains(&u.outpoint))
            .cloned()
            .collect();
        // Largest first keeps the input count low.
        candidates.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for utxo in candidates {
            if total >= amount {
                break;
            }
            total += utxo.value;
            selected.push(utxo);
        }

        if total < amount {
            return Err(BitcoinError::InsufficientFunds {
                needed: amount.to_sat(),
                available: total.to_sat(),
            });
        }
        Ok(selected)
    }

    fn fresh_script(&self) -> Result<ScriptBuf> {
        Ok(self.script_pubkey())
    }

    fn sign_input(&self, tx: &Transaction, index: usize, utxo: &Utxo) -> Result<Signature> {
        self.owns(utxo)?;
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .p2wpkh_signature_hash(index, &utxo.script_pubkey, utxo.value, EcdsaSighashType::All)
            .map_err(|e| BitcoinError::Sighash(e.to_string()))?;
        let secp = Secp256k1::signing_only();
        let msg = Message::from_digest(sighash.to_byte_array());
        Ok(secp.sign_ecdsa(&msg, &self.secret))
    }

    fn sign_with_utxo_key(&self, utxo: &Utxo, digest: &[u8; 32]) -> Result<Signature> {
        self.owns(utxo)?;
        let secp = Secp256k1::signing_only();
        Ok(secp.sign_ecdsa(&Message::from_digest(*digest), &self.secret))
    }
}

impl Drop for SoftwareWallet {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    fn outpoint(n: u8) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout: 0,
        }
    }

    #[test]
    fn test_select_utxos_largest_first() {
        let wallet = SoftwareWallet::new("w", &[3u8; 32]).unwrap();
        wallet.add_utxo(outpoint(1), Amount::from_sat(10_000));
        wallet.add_utxo(outpoint(2), Amount::from_sat(50_000));
        wallet.add_utxo(outpoint(3), Amount::from_sat(20_000));

        let selected = wallet
            .select_utxos(Amount::from_sat(60_000), &HashSet::new())
            .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].outpoint, outpoint(2));
        assert_eq!(selected[1].outpoint, outpoint(3));
    }

    #[test]
    fn test_select_utxos_respects_exclusions() {
        let wallet = SoftwareWallet::new("w", &[3u8; 32]).unwrap();
        wallet.add_utxo(outpoint(1), Amount::from_sat(10_000));
        wallet.add_utxo(outpoint(2), Amount::from_sat(50_000));

        let exclude: HashSet<OutPoint> = [outpoint(2)].into_iter().collect();
        let err = wallet
            .select_utxos(Amount::from_sat(20_000), &exclude)
            .unwrap_err();
        assert!(matches!(
            err,
            BitcoinError::InsufficientFunds {
                needed: 20_000,
                available: 10_000
            }
        ));
    }

    #[test]
    fn test_foreign_utxo_not_signed() {
        let wallet = SoftwareWallet::new("w", &[3u8; 32]).unwrap();
        let other = SoftwareWallet::new("o", &[4u8; 32]).unwrap();
        let foreign = other.add_utxo(outpoint(9), Amount::from_sat(1_000));
        assert!(wallet.sign_with_utxo_key(&foreign, &[1u8; 32]).is_err());
    }
}
