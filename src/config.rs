// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use cojo_bitcoin::bitcoin::Amount;
use cojo_net::negotiation::{FeeLimits, MakerPolicy, TakerPolicy};
use cojo_net::protocol::parse_relative_fee;
use cojo_net::{DaemonConfig, IrcConfig};
use serde::{Deserialize, Deserializer};

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

fn deserialize_path<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
        .map(|opt| opt.map(|s| PathBuf::from(shellexpand::tilde(&s).as_ref())))
}

fn deserialize_room<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let room = String::deserialize(deserializer)?;
    if !room.starts_with('#') || room.len() < 2 || room.contains([' ', ',']) {
        return Err(serde::de::Error::custom(format!(
            "invalid room '{room}': must start with # and contain no spaces or commas"
        )));
    }
    Ok(room)
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let port = u16::deserialize(deserializer)?;
    if port == 0 {
        return Err(serde::de::Error::custom("port must be greater than 0"));
    }
    Ok(port)
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<u64>::deserialize(deserializer)?;
    if opt == Some(0) {
        return Err(serde::de::Error::custom("timeout must be greater than 0"));
    }
    Ok(opt)
}

fn deserialize_rel_fee<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_relative_fee(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn deserialize_percent<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<u64>::deserialize(deserializer)?;
    if opt.is_some_and(|p| p > 100) {
        return Err(serde::de::Error::custom("percentage must be at most 100"));
    }
    Ok(opt)
}

fn default_tls() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default = "default_tls")]
    pub tls: bool,
    #[serde(deserialize_with = "deserialize_room")]
    pub room: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl ChannelConfig {
    pub fn irc_config(&self) -> IrcConfig {
        IrcConfig::new(&self.host, self.port)
            .with_tls(self.tls)
            .with_password(self.password.clone())
    }

    pub fn label(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.room)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NegotiationConfig {
    #[serde(default, deserialize_with = "deserialize_secs")]
    pub reassembly_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_open_per_sender: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_secs")]
    pub offer_max_age_secs: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_secs")]
    pub phase_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TakerConfig {
    #[serde(default)]
    pub minimum_makers: Option<usize>,
    /// Absolute coinjoin fee cap in satoshis.
    #[serde(default)]
    pub max_cj_fee_abs: Option<u64>,
    /// Relative coinjoin fee cap as a decimal fraction, e.g. "0.0003".
    #[serde(default, deserialize_with = "deserialize_rel_fee")]
    pub max_cj_fee_rel: Option<u64>,
    #[serde(default)]
    pub fee_target_blocks: Option<u16>,
    #[serde(default, deserialize_with = "deserialize_secs")]
    pub orderbook_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MakerConfig {
    #[serde(default)]
    pub min_confirmations: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_percent")]
    pub taker_utxo_amount_percent: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, deserialize_with = "deserialize_path")]
    pub tx_cache: Option<PathBuf>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub taker: TakerConfig,
    #[serde(default)]
    pub maker: MakerConfig,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        const MAX_CONFIG_SIZE: u64 = 1024 * 1024;
        let metadata = std::fs::metadata(path).map_err(|e| {
            CliError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(CliError::Config("config file too large".into()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| CliError::Config(format!("invalid config: {e}")))?;
        if config.taker.minimum_makers == Some(0) {
            return Err(CliError::Config("taker.minimum_makers must be at least 1".into()));
        }
        if config.negotiation.max_open_per_sender == Some(0) {
            return Err(CliError::Config(
                "negotiation.max_open_per_sender must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("cojo").join("config.toml"))
            .ok_or(CliError::HomeNotFound)
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        let defaults = DaemonConfig::default();
        let neg = &self.negotiation;

        let default_taker = TakerPolicy::default();
        let phase_timeout = neg
            .phase_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_taker.phase_timeout);
        let taker = TakerPolicy {
            minimum_makers: self.taker.minimum_makers.unwrap_or(default_taker.minimum_makers),
            fee_limits: FeeLimits {
                max_abs: self
                    .taker
                    .max_cj_fee_abs
                    .map(Amount::from_sat)
                    .unwrap_or(default_taker.fee_limits.max_abs),
                max_rel_ppb: self
                    .taker
                    .max_cj_fee_rel
                    .unwrap_or(default_taker.fee_limits.max_rel_ppb),
            },
            fee_target_blocks: self
                .taker
                .fee_target_blocks
                .unwrap_or(default_taker.fee_target_blocks),
            orderbook_wait: self
                .taker
                .orderbook_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(default_taker.orderbook_wait),
            phase_timeout,
        };

        let default_maker = MakerPolicy::default();
        let maker = MakerPolicy {
            min_confirmations: self
                .maker
                .min_confirmations
                .unwrap_or(default_maker.min_confirmations),
            taker_utxo_amount_percent: self
                .maker
                .taker_utxo_amount_percent
                .unwrap_or(default_maker.taker_utxo_amount_percent),
            phase_timeout,
        };

        DaemonConfig {
            reassembly_timeout: neg
                .reassembly_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.reassembly_timeout),
            max_open_per_sender: neg
                .max_open_per_sender
                .unwrap_or(defaults.max_open_per_sender),
            offer_max_age: neg
                .offer_max_age_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.offer_max_age),
            taker,
            maker,
            ..defaults
        }
    }
}
