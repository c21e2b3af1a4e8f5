// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashMap;

use bitcoin::{Amount, OutPoint, ScriptBuf};
use parking_lot::RwLock;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoInfo {
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub confirmations: u32,
}

/// Read-only view of chain state needed during negotiation.
pub trait ChainSource: Send + Sync {
    /// Returns `None` when the outpoint is unknown or already spent.
    fn lookup_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoInfo>>;

    /// Fee rate in sat/vB for confirmation within `target_blocks`.
    fn current_fee_estimate(&self, target_blocks: u16) -> Result<u64>;
}

/// Chain state held in memory, for tests and simulations.
pub struct MemoryChain {
    utxos: RwLock<HashMap<OutPoint, UtxoInfo>>,
    fee_rate: RwLock<u64>,
}

impl MemoryChain {
    pub fn new(fee_rate: u64) -> Self {
        Self {
            utxos: RwLock::new(HashMap::new()),
            fee_rate: RwLock::new(fee_rate),
        }
    }

    pub fn insert(&self, outpoint: OutPoint, info: UtxoInfo) {
        self.utxos.write().insert(outpoint, info);
    }

    pub fn spend(&self, outpoint: &OutPoint) -> bool {
        self.utxos.write().remove(outpoint).is_some()
    }

    pub fn set_fee_rate(&self, fee_rate: u64) {
        *self.fee_rate.write() = fee_rate;
    }
}

impl ChainSource for MemoryChain {
    fn lookup_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoInfo>> {
        Ok(self.utxos.read().get(outpoint).cloned())
    }

    fn current_fee_estimate(&self, _target_blocks: u16) -> Result<u64> {
        Ok(*self.fee_rate.read())
    }
}
