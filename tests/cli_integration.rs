// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;
use std::process::{Command, Output};

use cojo_bitcoin::bitcoin::hashes::Hash;
use cojo_bitcoin::bitcoin::{Amount, ScriptBuf, Txid};
use cojo_bitcoin::{OurInput, TransactionCache};
use tempfile::TempDir;

struct CojoCmd {
    cmd: Command,
}

impl CojoCmd {
    fn new() -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cojo"));
        cmd.env_remove("RUST_LOG");
        cmd.env_remove("COJO_LOG_JSON");
        Self { cmd }
    }

    fn config(mut self, path: &Path) -> Self {
        self.cmd.arg("--config").arg(path);
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.cmd.args(args);
        self
    }

    fn run(mut self) -> Output {
        self.cmd.output().expect("failed to run cojo")
    }
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_check_config_valid() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r##"
[[channels]]
host = "irc.example.org"
port = 6697
room = "#coinjoin"

[taker]
max_cj_fee_rel = "0.0003"
"##,
    );

    let out = CojoCmd::new().config(&path).args(["check-config"]).run();
    let err = stderr(&out);
    assert!(out.status.success(), "stderr: {err}");
    assert!(err.contains("irc.example.org:6697/#coinjoin"));
    assert!(err.contains("0.0003"));
    assert!(err.contains("Configuration is valid"));
}

#[test]
fn test_check_config_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");

    let out = CojoCmd::new().config(&path).args(["check-config"]).run();
    let err = stderr(&out);
    assert!(out.status.success(), "stderr: {err}");
    assert!(err.contains("using defaults"));
    assert!(err.contains("No channels configured"));
}

#[test]
fn test_check_config_rejects_bad_room() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[[channels]]
host = "irc.example.org"
port = 6697
room = "coinjoin"
"#,
    );

    let out = CojoCmd::new().config(&path).args(["check-config"]).run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("invalid room"));
}

#[test]
fn test_orderbook_without_channels_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "log_level = \"warn\"\n");

    let out = CojoCmd::new()
        .config(&path)
        .args(["orderbook", "--wait", "1"])
        .run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("no channels configured"));
}

#[test]
fn test_inputs_requires_cache() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");
    let txid = Txid::from_byte_array([7; 32]).to_string();

    let out = CojoCmd::new()
        .config(&path)
        .args(["inputs", &txid, "--wallet", "main"])
        .run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("tx_cache"));
}

#[test]
fn test_inputs_rejects_bad_txid() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    let out = CojoCmd::new()
        .config(&path)
        .args(["inputs", "not-a-txid", "--wallet", "main"])
        .run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("txid"));
}

#[test]
fn test_inputs_lists_recorded_inputs() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("txcache.redb");
    let txid = Txid::from_byte_array([9; 32]);
    {
        let cache = TransactionCache::open(&cache_path).unwrap();
        cache
            .add_tx_our_inputs(
                "main",
                &txid,
                &[OurInput {
                    script: ScriptBuf::from_bytes(vec![0x00, 0x14, 0xab]),
                    value: Amount::from_sat(1_234_567),
                }],
            )
            .unwrap();
    }
    let path = write_config(
        &dir,
        &format!("tx_cache = \"{}\"\n", cache_path.display()),
    );

    let out = CojoCmd::new()
        .config(&path)
        .args(["inputs", &txid.to_string(), "--wallet", "main"])
        .run();
    let err = stderr(&out);
    assert!(out.status.success(), "stderr: {err}");
    assert!(err.contains("1234567"));
    assert!(err.contains("0014ab"));

    let out = CojoCmd::new()
        .config(&path)
        .args(["inputs", &txid.to_string(), "--wallet", "other"])
        .run();
    assert!(out.status.success());
    assert!(stderr(&out).contains("Nothing recorded"));
}
