// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, OutPoint, Script, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::error::{BitcoinError, Result};
use crate::wallet::p2wpkh_script;

const TX_OVERHEAD_VBYTES: u64 = 11;
const P2WPKH_INPUT_VBYTES: u64 = 68;
const P2WPKH_OUTPUT_VBYTES: u64 = 31;

/// Outputs below this are not created; the value goes to fees instead.
pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);

pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VBYTES
        + P2WPKH_INPUT_VBYTES * inputs as u64
        + P2WPKH_OUTPUT_VBYTES * outputs as u64
}

/// A jointly built P2WPKH transaction plus whatever prevouts this party
/// knows about. Takers know every prevout; makers only know their own.
#[derive(Clone, Debug)]
pub struct CoinjoinTx {
    tx: Transaction,
    prevouts: HashMap<OutPoint, TxOut>,
}

impl CoinjoinTx {
    /// Builds an unsigned transaction. Inputs are ordered by outpoint and
    /// outputs by (value, script) so the layout leaks nothing about who
    /// contributed what.
    pub fn build(mut inputs: Vec<(OutPoint, TxOut)>, mut outputs: Vec<TxOut>) -> Result<Self> {
        if inputs.is_empty() {
            return Err(BitcoinError::InvalidTransaction("no inputs".into()));
        }
        if outputs.is_empty() {
            return Err(BitcoinError::InvalidTransaction("no outputs".into()));
        }

        let mut seen = HashSet::new();
        for (outpoint, _) in &inputs {
            if !seen.insert(*outpoint) {
                return Err(BitcoinError::InvalidTransaction(format!(
                    "duplicate input {outpoint}"
                )));
            }
        }

        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        outputs.sort_by(|a, b| {
            a.value
                .cmp(&b.value)
                .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
        });

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|(outpoint, _)| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs,
        };

        Ok(Self {
            tx,
            prevouts: inputs.into_iter().collect(),
        })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let tx: Transaction = deserialize_hex(hex_str)
            .map_err(|e| BitcoinError::InvalidTransaction(e.to_string()))?;
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err(BitcoinError::InvalidTransaction(
                "transaction has no inputs or outputs".into(),
            ));
        }
        Ok(Self {
            tx,
            prevouts: HashMap::new(),
        })
    }

    pub fn add_prevout(&mut self, outpoint: OutPoint, txout: TxOut) -> Result<()> {
        if self.input_index(&outpoint).is_none() {
            return Err(BitcoinError::MissingInput(outpoint.to_string()));
        }
        self.prevouts.insert(outpoint, txout);
        Ok(())
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn unsigned_hex(&self) -> String {
        let mut stripped = self.tx.clone();
        for input in &mut stripped.input {
            input.witness = Witness::default();
        }
        serialize_hex(&stripped)
    }

    pub fn signed_hex(&self) -> String {
        serialize_hex(&self.tx)
    }

    pub fn input_index(&self, outpoint: &OutPoint) -> Option<usize> {
        self.tx
            .input
            .iter()
            .position(|input| &input.previous_output == outpoint)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &OutPoint> {
        self.tx.input.iter().map(|input| &input.previous_output)
    }

    pub fn value_paid_to(&self, script: &Script) -> Amount {
        self.tx
            .output
            .iter()
            .filter(|o| o.script_pubkey.as_script() == script)
            .map(|o| o.value)
            .sum()
    }

    pub fn output_count_to(&self, script: &Script) -> usize {
        self.tx
            .output
            .iter()
            .filter(|o| o.script_pubkey.as_script() == script)
            .count()
    }

    pub fn total_output_value(&self) -> Amount {
        self.tx.output.iter().map(|o| o.value).sum()
    }

    /// Sum of known prevouts; `None` unless every input's prevout is known.
    pub fn total_input_value(&self) -> Option<Amount> {
        self.inputs()
            .map(|op| self.prevouts.get(op).map(|txout| txout.value))
            .sum()
    }

    pub fn sighash(&self, outpoint: &OutPoint) -> Result<[u8; 32]> {
        let index = self
            .input_index(outpoint)
            .ok_or_else(|| BitcoinError::MissingInput(outpoint.to_string()))?;
        let prevout = self
            .prevouts
            .get(outpoint)
            .ok_or_else(|| BitcoinError::MissingPrevout(outpoint.to_string()))?;

        let mut cache = SighashCache::new(&self.tx);
        let sighash = cache
            .p2wpkh_signature_hash(
                index,
                &prevout.script_pubkey,
                prevout.value,
                EcdsaSighashType::All,
            )
            .map_err(|e| BitcoinError::Sighash(e.to_string()))?;
        Ok(sighash.to_byte_array())
    }

    /// Checks `signature` over the input spending `outpoint` and that
    /// `pubkey` is the key the prevout pays to.
    pub fn verify_input_signature(
        &self,
        outpoint: &OutPoint,
        pubkey: &PublicKey,
        signature: &Signature,
    ) -> Result<()> {
        let prevout = self
            .prevouts
            .get(outpoint)
            .ok_or_else(|| BitcoinError::MissingPrevout(outpoint.to_string()))?;
        if prevout.script_pubkey != p2wpkh_script(pubkey) {
            return Err(BitcoinError::InvalidSignature(format!(
                "pubkey does not control {outpoint}"
            )));
        }

        let digest = self.sighash(outpoint)?;
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&Message::from_digest(digest), signature, pubkey)
            .map_err(|e| BitcoinError::InvalidSignature(format!("{outpoint}: {e}")))
    }

    pub fn apply_signature(
        &mut self,
        outpoint: &OutPoint,
        pubkey: &PublicKey,
        signature: &Signature,
    ) -> Result<()> {
        self.verify_input_signature(outpoint, pubkey, signature)?;
        let index = self
            .input_index(outpoint)
            .ok_or_else(|| BitcoinError::MissingInput(outpoint.to_string()))?;
        let sig = bitcoin::ecdsa::Signature {
            signature: *signature,
            sighash_type: EcdsaSighashType::All,
        };
        self.tx.input[index].witness = Witness::p2wpkh(&sig, pubkey);
        Ok(())
    }

    pub fn is_signed(&self, outpoint: &OutPoint) -> bool {
        self.input_index(outpoint)
            .map(|i| !self.tx.input[i].witness.is_empty())
            .unwrap_or(false)
    }

    pub fn is_fully_signed(&self) -> bool {
        self.tx.input.iter().all(|input| !input.witness.is_empty())
    }
}
