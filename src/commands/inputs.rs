// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use cojo_bitcoin::bitcoin::Txid;
use cojo_bitcoin::TransactionCache;

use crate::config::Config;
use crate::error::{CliError, Result};
use crate::output::Output;

pub fn cmd_inputs(out: &Output, cfg: &Config, txid: &str, wallet: &str) -> Result<()> {
    let txid: Txid = txid
        .parse()
        .map_err(|e| CliError::InvalidInput(format!("txid: {e}")))?;
    let path = cfg
        .tx_cache
        .as_ref()
        .ok_or_else(|| CliError::Config("tx_cache is not set".into()))?;
    let cache = TransactionCache::open(path)?;
    let inputs = cache.get_tx_our_inputs(wallet, &txid)?;

    out.header(&format!("Inputs of {txid}"));
    if inputs.is_empty() {
        out.warn(&format!("Nothing recorded for wallet {wallet}"));
        return Ok(());
    }
    out.table_header(&[("Value (sat)", 14), ("Script", 68)]);
    for input in &inputs {
        out.table_row(&[
            (&input.value.to_sat().to_string(), 14),
            (&input.script.to_hex_string(), 68),
        ]);
    }
    if let Some(record) = cache.get_transaction(&txid)? {
        out.newline();
        out.field("Block height", &record.blockheight.to_string());
    }
    Ok(())
}
