// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::path::Path;

use cojo_net::protocol::format_relative_fee;

use crate::config::Config;
use crate::error::Result;
use crate::output::Output;

pub fn cmd_check_config(out: &Output, path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => Config::default_path()?,
    };
    let cfg = Config::load(Some(path.as_path()))?;
    let daemon = cfg.daemon_config();

    out.header("Configuration");
    if path.exists() {
        out.field("File", &path.display().to_string());
    } else {
        out.warn(&format!("{} not found, using defaults", path.display()));
    }
    out.field("Log level", &cfg.log_level.to_string());
    match &cfg.tx_cache {
        Some(p) => out.field("Transaction cache", &p.display().to_string()),
        None => out.field("Transaction cache", "disabled"),
    }

    out.header("Channels");
    if cfg.channels.is_empty() {
        out.warn("No channels configured");
    }
    for channel in &cfg.channels {
        let tls = if channel.tls { "tls" } else { "plain" };
        out.field(&channel.label(), tls);
    }

    out.header("Negotiation");
    out.field(
        "Reassembly timeout",
        &format!("{}s", daemon.reassembly_timeout.as_secs()),
    );
    out.field(
        "Partial messages per sender",
        &daemon.max_open_per_sender.to_string(),
    );
    out.field(
        "Offer max age",
        &format!("{}s", daemon.offer_max_age.as_secs()),
    );
    out.field(
        "Phase timeout",
        &format!("{}s", daemon.taker.phase_timeout.as_secs()),
    );
    out.field("Minimum makers", &daemon.taker.minimum_makers.to_string());
    out.field(
        "Max coinjoin fee",
        &format!(
            "{} sat or {}",
            daemon.taker.fee_limits.max_abs.to_sat(),
            format_relative_fee(daemon.taker.fee_limits.max_rel_ppb)
        ),
    );
    out.field(
        "Taker coin minimum",
        &format!("{}% of amount", daemon.maker.taker_utxo_amount_percent),
    );
    out.field(
        "Minimum confirmations",
        &daemon.maker.min_confirmations.to_string(),
    );

    out.newline();
    out.success("Configuration is valid");
    Ok(())
}
