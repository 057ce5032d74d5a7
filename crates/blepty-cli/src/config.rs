//! Bridge configuration: TOML file + CLI overrides.

use crate::ble::{LinkSettings, SERIAL_CHARACTERISTIC};
use blepty_core::{BridgeError, BridgeResult, EngineConfig, DEFAULT_READ_BUFFER};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub ble: BleSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[ble]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BleSection {
    #[serde(default)]
    pub adapter: usize,
    #[serde(default = "default_characteristic")]
    pub characteristic: String,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for BleSection {
    fn default() -> Self {
        Self {
            adapter: 0,
            characteristic: default_characteristic(),
            scan_timeout: default_scan_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default)]
    pub mtu: Option<usize>,
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub write_interval_ms: u64,
    #[serde(default = "default_true")]
    pub raw_mode: bool,
    #[serde(default = "default_true")]
    pub world_accessible: bool,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            mtu: None,
            read_buffer: default_read_buffer(),
            write_retries: default_write_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            write_interval_ms: 0,
            raw_mode: true,
            world_accessible: true,
        }
    }
}

fn default_characteristic() -> String {
    SERIAL_CHARACTERISTIC.to_string()
}
fn default_scan_timeout() -> u64 {
    2
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_buffer() -> usize {
    DEFAULT_READ_BUFFER
}
fn default_write_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    20
}
fn default_true() -> bool {
    true
}

/// Values given on the command line. `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub adapter: Option<usize>,
    pub characteristic: Option<String>,
    pub mtu: Option<usize>,
    pub write_retries: Option<u32>,
    pub scan_timeout: Option<u64>,
}

/// Resolved configuration (file parsed, CLI overrides applied, values checked).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub adapter: usize,
    pub characteristic: Uuid,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub engine: EngineConfig,
    pub raw_mode: bool,
    pub world_accessible: bool,
}

impl BridgeConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; the defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> BridgeResult<Self> {
        let file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file, overrides)
    }

    fn resolve(file: ConfigFile, overrides: &Overrides) -> BridgeResult<Self> {
        let ConfigFile { ble, bridge } = file;

        let characteristic_str = overrides
            .characteristic
            .clone()
            .unwrap_or(ble.characteristic);
        let characteristic = Uuid::parse_str(characteristic_str.trim()).map_err(|e| {
            BridgeError::Config(format!("invalid characteristic '{characteristic_str}': {e}"))
        })?;

        let mtu = overrides.mtu.or(bridge.mtu);
        if mtu == Some(0) {
            return Err(BridgeError::Config("mtu must be at least 1".into()));
        }
        if bridge.read_buffer == 0 {
            return Err(BridgeError::Config("read_buffer must be at least 1".into()));
        }

        let engine = EngineConfig {
            mtu,
            read_buffer: bridge.read_buffer,
            write_retries: overrides.write_retries.unwrap_or(bridge.write_retries),
            retry_delay: Duration::from_millis(bridge.retry_delay_ms),
            write_interval: Duration::from_millis(bridge.write_interval_ms),
            ..EngineConfig::default()
        };

        Ok(Self {
            adapter: overrides.adapter.unwrap_or(ble.adapter),
            characteristic,
            scan_timeout: Duration::from_secs(overrides.scan_timeout.unwrap_or(ble.scan_timeout)),
            connect_timeout: Duration::from_secs(ble.connect_timeout),
            engine,
            raw_mode: bridge.raw_mode,
            world_accessible: bridge.world_accessible,
        })
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            characteristic: self.characteristic,
            scan_timeout: self.scan_timeout,
            connect_timeout: self.connect_timeout,
        }
    }
}

fn parse(content: &str) -> BridgeResult<ConfigFile> {
    toml::from_str(content).map_err(|e| BridgeError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
