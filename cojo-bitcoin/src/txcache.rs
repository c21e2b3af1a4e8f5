// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local cache of historical transactions and of which inputs in them
//! belonged to which wallet. Nothing in negotiation depends on it.

#![forbid(unsafe_code)]

use std::path::Path;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, ScriptBuf, Transaction, Txid};
use redb::{
    backends::InMemoryBackend, Database, ReadableDatabase, ReadableTable, TableDefinition,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BitcoinError, Result};

const TRANSACTIONS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("transactions");
const OUR_INPUTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tx_our_inputs");

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub txid: Txid,
    pub blockheight: u32,
    pub blockhash: BlockHash,
    pub blocktime: u64,
    pub tx: Transaction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OurInput {
    pub script: ScriptBuf,
    pub value: Amount,
}

#[derive(Serialize, Deserialize)]
struct StoredTransaction {
    blockheight: u32,
    blockhash: [u8; 32],
    blocktime: u64,
    raw: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredInput {
    script: Vec<u8>,
    value: u64,
}

pub struct TransactionCache {
    db: Database,
}

impl TransactionCache {
    /// Opens (or creates) the cache file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let wtxn = db.begin_write()?;
        wtxn.open_table(TRANSACTIONS_TABLE)?;
        wtxn.open_table(OUR_INPUTS_TABLE)?;
        wtxn.commit()?;
        Ok(Self { db })
    }

    pub fn get_transaction(&self, txid: &Txid) -> Result<Option<TransactionRecord>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(TRANSACTIONS_TABLE)?;
        let Some(value) = table.get(txid.as_byte_array().as_slice())? else {
            return Ok(None);
        };
        let stored: StoredTransaction = bincode::deserialize(value.value())?;
        let tx: Transaction = deserialize(&stored.raw)
            .map_err(|e| BitcoinError::InvalidTransaction(e.to_string()))?;
        Ok(Some(TransactionRecord {
            txid: *txid,
            blockheight: stored.blockheight,
            blockhash: BlockHash::from_byte_array(stored.blockhash),
            blocktime: stored.blocktime,
            tx,
        }))
    }

    /// Stores `record` unless its txid is already cached. Returns whether
    /// the record was written.
    pub fn add_transaction(&self, record: &TransactionRecord) -> Result<bool> {
        if record.tx.compute_txid() != record.txid {
            return Err(BitcoinError::InvalidTransaction(format!(
                "txid {} does not match transaction",
                record.txid
            )));
        }
        let stored = StoredTransaction {
            blockheight: record.blockheight,
            blockhash: record.blockhash.to_byte_array(),
            blocktime: record.blocktime,
            raw: serialize(&record.tx),
        };
        let bytes = bincode::serialize(&stored)?;
        let key = record.txid.to_byte_array();

        let wtxn = self.db.begin_write()?;
        let inserted = {
            let mut table = wtxn.open_table(TRANSACTIONS_TABLE)?;
            if table.get(key.as_slice())?.is_some() {
                false
            } else {
                table.insert(key.as_slice(), bytes.as_slice())?;
                true
            }
        };
        wtxn.commit()?;
        debug!(txid = %record.txid, inserted, "cached transaction");
        Ok(inserted)
    }

    pub fn get_tx_our_inputs(&self, wallet_id: &str, txid: &Txid) -> Result<Vec<OurInput>> {
        let rtxn = self.db.begin_read()?;
        let table = rtxn.open_table(OUR_INPUTS_TABLE)?;
        let key = our_inputs_key(wallet_id, txid);
        let Some(value) = table.get(key.as_slice())? else {
            return Ok(Vec::new());
        };
        let stored: Vec<StoredInput> = bincode::deserialize(value.value())?;
        Ok(stored
            .into_iter()
            .map(|s| OurInput {
                script: ScriptBuf::from_bytes(s.script),
                value: Amount::from_sat(s.value),
            })
            .collect())
    }

    /// Replaces the recorded inputs of `wallet_id` in `txid`.
    pub fn add_tx_our_inputs(&self, wallet_id: &str, txid: &Txid, inputs: &[OurInput]) -> Result<()> {
        let stored: Vec<StoredInput> = inputs
            .iter()
            .map(|i| StoredInput {
                script: i.script.to_bytes(),
                value: i.value.to_sat(),
            })
            .collect();
        let bytes = bincode::serialize(&stored)?;
        let key = our_inputs_key(wallet_id, txid);

        let wtxn = self.db.begin_write()?;
        wtxn.open_table(OUR_INPUTS_TABLE)?
            .insert(key.as_slice(), bytes.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }
}

// Wallet ids are free text, so the txid goes first to keep keys unambiguous.
fn our_inputs_key(wallet_id: &str, txid: &Txid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + wallet_id.len());
    key.extend_from_slice(txid.as_byte_array());
    key.extend_from_slice(wallet_id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{absolute::LockTime, transaction::Version, OutPoint, TxIn, TxOut};

    fn sample_tx(n: u8) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([n; 32]),
                    vout: 0,
                },
                ..Default::default()
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000 * n as u64),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn record(n: u8) -> TransactionRecord {
        let tx = sample_tx(n);
        TransactionRecord {
            txid: tx.compute_txid(),
            blockheight: 800_000 + n as u32,
            blockhash: BlockHash::from_byte_array([n; 32]),
            blocktime: 1_700_000_000,
            tx,
        }
    }

    #[test]
    fn test_add_and_get_transaction() {
        let cache = TransactionCache::in_memory().unwrap();
        let rec = record(1);
        assert!(cache.get_transaction(&rec.txid).unwrap().is_none());
        assert!(cache.add_transaction(&rec).unwrap());
        assert!(!cache.add_transaction(&rec).unwrap());
        assert_eq!(cache.get_transaction(&rec.txid).unwrap(), Some(rec));
    }

    #[test]
    fn test_mismatched_txid_rejected() {
        let cache = TransactionCache::in_memory().unwrap();
        let mut rec = record(1);
        rec.txid = record(2).txid;
        assert!(cache.add_transaction(&rec).is_err());
    }

    #[test]
    fn test_our_inputs_replace_per_wallet() {
        let cache = TransactionCache::in_memory().unwrap();
        let txid = record(3).txid;
        let first = vec![OurInput {
            script: ScriptBuf::from_bytes(vec![0x00, 0x14]),
            value: Amount::from_sat(5),
        }];
        let second = vec![
            OurInput {
                script: ScriptBuf::from_bytes(vec![0x51]),
                value: Amount::from_sat(6),
            },
            OurInput {
                script: ScriptBuf::from_bytes(vec![0x52]),
                value: Amount::from_sat(7),
            },
        ];

        cache.add_tx_our_inputs("alice", &txid, &first).unwrap();
        cache.add_tx_our_inputs("alice", &txid, &second).unwrap();
        cache.add_tx_our_inputs("bob", &txid, &first).unwrap();

        assert_eq!(cache.get_tx_our_inputs("alice", &txid).unwrap(), second);
        assert_eq!(cache.get_tx_our_inputs("bob", &txid).unwrap(), first);
        assert!(cache.get_tx_our_inputs("carol", &txid).unwrap().is_empty());
    }
}
