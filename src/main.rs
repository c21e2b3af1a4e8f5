// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod cli;
mod commands;
mod config;
mod error;
mod output;

use std::path::Path;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{Config, LogLevel};
use crate::error::Result;
use crate::output::Output;

fn init_logging(level: LogLevel) {
    let use_json = std::env::var("COJO_LOG_JSON").is_ok();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let out = Output::new();

    if let Err(e) = run(&out) {
        out.error(&e.to_string());
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let cfg = Config::load(path)?;
    init_logging(cfg.log_level);
    debug!(channels = cfg.channels.len(), "configuration loaded");
    Ok(cfg)
}

fn run(out: &Output) -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Orderbook { wait, follow } => {
            let cfg = load_config(config_path)?;
            cojo_net::install_default_crypto_provider();
            commands::orderbook::cmd_orderbook(out, &cfg, wait, follow)
        }
        Commands::CheckConfig => {
            init_logging(LogLevel::default());
            commands::config::cmd_check_config(out, config_path)
        }
        Commands::Inputs { txid, wallet } => {
            let cfg = load_config(config_path)?;
            commands::inputs::cmd_inputs(out, &cfg, &txid, &wallet)
        }
    }
}
