//! Static application configuration.
//!
//! This is the file an operator edits (or an installer writes once):
//! gateway bind address, broker endpoint + shared secret, the cloudflared
//! binary, and the provider API base. Runtime registration state lives in
//! the [`crate::store`] JSON document, not here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_GATEWAY_PORT: u16 = 8189;
pub const DEFAULT_METRICS_PORT: u16 = 20241;
pub const DEFAULT_BROKER_URL: &str = "https://broker.comfycarry.dev";
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_GATEWAY_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    /// Shared HMAC secret issued with the broker deployment.
    pub secret: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.into(),
            secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflaredConfig {
    /// Path to the cloudflared binary (resolved via PATH when bare).
    pub binary: String,
    /// Local metrics port the daemon is started with; the readiness probe
    /// hits `/ready` on this port.
    pub metrics_port: u16,
}

impl Default for CloudflaredConfig {
    fn default() -> Self {
        Self {
            binary: "cloudflared".into(),
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
    pub cloudflared: CloudflaredConfig,
    /// Provider API base URL. Only overridden in tests.
    pub api_base: String,

    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(skip)]
    pub state_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let dir = data_dir();
        Self {
            gateway: GatewayConfig::default(),
            broker: BrokerConfig::default(),
            cloudflared: CloudflaredConfig::default(),
            api_base: DEFAULT_API_BASE.into(),
            config_path: dir.join("config.toml"),
            state_path: dir.join("state.json"),
        }
    }
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("COMFYCARRY_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    directories::ProjectDirs::from("dev", "comfycarry", "comfycarry")
        .map_or_else(|| PathBuf::from(".comfycarry"), |d| d.data_dir().to_path_buf())
}

impl Config {
    /// Load the config file, creating it with defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let mut config = Self::default();
        if config.config_path.exists() {
            config = Self::load_from(&config.config_path.clone())?;
        } else {
            if let Some(parent) = config.config_path.parent() {
                fs::create_dir_all(parent).context("Failed to create data dir")?;
            }
            config.save()?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw).context("Failed to parse config.toml")?;
        config.config_path = path.to_path_buf();
        config.state_path = path
            .parent()
            .map_or_else(|| PathBuf::from("state.json"), |p| p.join("state.json"));
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("COMFYCARRY_GATEWAY_HOST") {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }
        if let Ok(port_str) = std::env::var("COMFYCARRY_GATEWAY_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }
        if let Ok(url) = std::env::var("COMFYCARRY_BROKER_URL") {
            if !url.is_empty() {
                self.broker.url = url;
            }
        }
        if let Ok(secret) = std::env::var("COMFYCARRY_BROKER_SECRET") {
            if !secret.is_empty() {
                self.broker.secret = secret;
            }
        }
        if let Ok(base) = std::env::var("COMFYCARRY_API_BASE") {
            if !base.is_empty() {
                self.api_base = base;
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}
