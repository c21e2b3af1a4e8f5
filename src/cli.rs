// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cojo")]
#[command(about = "Coinjoin counterparty discovery and negotiation")]
#[command(version)]
pub(crate) struct Cli {
    #[arg(short, long, global = true, help = "Path to config.toml")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Join the configured channels and print the offers seen there.
    Orderbook {
        #[arg(long, default_value = "15", help = "Seconds to collect offers")]
        wait: u64,
        #[arg(long, help = "Keep printing offer updates until interrupted")]
        follow: bool,
    },
    /// Parse and validate the configuration file.
    CheckConfig,
    /// Show the inputs recorded for a completed coinjoin.
    Inputs {
        txid: String,
        #[arg(short, long)]
        wallet: String,
    },
}
