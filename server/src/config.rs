//! Server configuration: `server.ini` file, CLI overrides, and first-run
//! bootstrap of the operator secret and encryption key.
//!
//! The file is a flat `key=value` list (`#`/`;` start comments). Values
//! from the file are applied first, CLI overrides second; the merged
//! result is re-saved so a first run leaves a complete, working config
//! behind.

use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "server.ini";

/// The placeholder secret shipped in a fresh config; replaced with random
/// bytes on first bootstrap.
const PLACEHOLDER_SECRET: &str = "changeme";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Operator secret: feeds the per-message integrity tag.
    pub secret: String,
    pub history_on_join: usize,
    pub enc_enabled: bool,
    /// 32-byte at-rest encryption key, hex-encoded (64 chars).
    pub enc_key_hex: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5555,
            data_dir: PathBuf::from("data"),
            secret: PLACEHOLDER_SECRET.to_string(),
            history_on_join: 20,
            enc_enabled: false,
            enc_key_hex: String::new(),
        }
    }
}

/// CLI-provided values; `None` means "keep whatever the file said".
#[derive(Debug, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub data: Option<PathBuf>,
    pub secret: Option<String>,
    pub hist: Option<usize>,
    pub enc_key_hex: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("encryption key override must be 64 hex chars (32 bytes)")]
    InvalidKeyOverride,
}

/// The fixed config location; `--data` relocates the logs, not this file.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("data").join(CONFIG_FILE)
}

/// Applies `path` onto `cfg`. Returns `false` when the file is missing or
/// unreadable (defaults stay in effect). Unknown keys and malformed
/// numeric values are ignored.
pub fn load_file(path: &Path, cfg: &mut Config) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "bind" => cfg.bind_addr = value.to_string(),
            "port" => {
                if let Ok(port) = value.parse() {
                    cfg.port = port;
                }
            }
            "data" => cfg.data_dir = PathBuf::from(value),
            "secret" => cfg.secret = value.to_string(),
            "hist" => {
                if let Ok(hist) = value.parse() {
                    cfg.history_on_join = hist;
                }
            }
            "enc_key_hex" => {
                cfg.enc_key_hex = value.to_string();
                cfg.enc_enabled = value.len() == 64;
            }
            _ => {}
        }
    }
    true
}

/// Writes the full config, creating parent directories as needed. Key
/// material is only persisted when it is well-formed.
pub fn save_file(path: &Path, cfg: &Config) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let key_line = if cfg.enc_enabled && cfg.enc_key_hex.len() == 64 {
        cfg.enc_key_hex.as_str()
    } else {
        ""
    };
    let content = format!(
        "# LAN chat server config\n\
         bind={}\n\
         port={}\n\
         data={}\n\
         secret={}\n\
         hist={}\n\
         enc_key_hex={}\n",
        cfg.bind_addr,
        cfg.port,
        cfg.data_dir.display(),
        cfg.secret,
        cfg.history_on_join,
        key_line
    );
    fs::write(path, content)
}

/// Load + override + first-run generation + re-save, against the default
/// config location.
pub fn bootstrap(overrides: &Overrides) -> Result<Config, ConfigError> {
    bootstrap_at(&default_config_path(), overrides)
}

pub fn bootstrap_at(path: &Path, overrides: &Overrides) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    load_file(path, &mut cfg);

    if let Some(bind) = &overrides.bind {
        cfg.bind_addr = bind.clone();
    }
    if let Some(port) = overrides.port {
        cfg.port = port;
    }
    if let Some(data) = &overrides.data {
        cfg.data_dir = data.clone();
    }
    if let Some(secret) = &overrides.secret {
        cfg.secret = secret.clone();
    }
    if let Some(hist) = overrides.hist {
        cfg.history_on_join = hist;
    }
    if let Some(key) = &overrides.enc_key_hex {
        if key.len() != 64 || hex::decode(key).is_err() {
            return Err(ConfigError::InvalidKeyOverride);
        }
        cfg.enc_key_hex = key.clone();
        cfg.enc_enabled = true;
    }

    if cfg.secret == PLACEHOLDER_SECRET {
        cfg.secret = hex::encode(random_bytes(16));
        info!("generated a fresh operator secret");
    }
    if !cfg.enc_enabled || cfg.enc_key_hex.len() != 64 {
        cfg.enc_key_hex = hex::encode(random_bytes(32));
        cfg.enc_enabled = true;
        info!("generated a fresh log-encryption key");
    }

    if let Err(e) = save_file(path, &cfg) {
        warn!("could not save config to {}: {}", path.display(), e);
    }

    info!(
        "config: bind={} port={} data={} hist={} enc={}",
        cfg.bind_addr,
        cfg.port,
        cfg.data_dir.display(),
        cfg.history_on_join,
        if cfg.enc_enabled { "on" } else { "off" }
    );
    Ok(cfg)
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
