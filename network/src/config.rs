// SPDX-License-Identifier: MIT OR Apache-2.0

//! `punchrelay.toml` configuration
//!
//! One file holds a `[relay]`, a `[punch]` and a `[client]` table. Every field
//! has a default, so a partial file (or none at all) is valid.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::{AdmissionPolicy, IdReuse, RegistryConfig};

pub const CONFIG_FILE_NAME: &str = "punchrelay.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: ServerConfig,
    pub punch: ServerConfig,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: ServerConfig::relay(),
            punch: ServerConfig::punch(),
            client: ClientConfig::default(),
        }
    }
}

/// Listen socket and admission settings for one server process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub admission: AdmissionPolicy,
    pub id_reuse: IdReuse,
    pub key_prefix: String,
    pub max_sessions: usize,
}

impl ServerConfig {
    pub fn relay() -> Self {
        Self::from_registry(9050, RegistryConfig::relay())
    }

    pub fn punch() -> Self {
        Self::from_registry(9051, RegistryConfig::punch())
    }

    fn from_registry(port: u16, registry: RegistryConfig) -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port,
            poll_interval: Duration::from_millis(15),
            admission: registry.admission,
            id_reuse: registry.id_reuse,
            key_prefix: registry.key_prefix,
            max_sessions: registry.max_sessions,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind_address, self.port))
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            admission: self.admission,
            id_reuse: self.id_reuse,
            key_prefix: self.key_prefix.clone(),
            max_sessions: self.max_sessions,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::relay()
    }
}

/// Command-line overrides for a [`ServerConfig`]; flattened into the server
/// binaries' arguments.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ServerOverrides {
    /// Bind address
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (0 for auto)
    #[arg(long)]
    pub port: Option<u16>,

    /// Admission policy
    #[arg(long, value_enum)]
    pub admission: Option<AdmissionPolicy>,

    /// Client id reuse policy
    #[arg(long, value_enum)]
    pub id_reuse: Option<IdReuse>,

    /// Token prefix required under gated admission
    #[arg(long)]
    pub key_prefix: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Poll interval, e.g. "15ms"
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    pub poll_interval: Option<Duration>,
}

impl ServerConfig {
    /// Replace every field the command line set
    pub fn apply(&mut self, overrides: &ServerOverrides) {
        if let Some(bind) = &overrides.bind {
            self.bind_address = bind.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(admission) = overrides.admission {
            self.admission = admission;
        }
        if let Some(id_reuse) = overrides.id_reuse {
            self.id_reuse = id_reuse;
        }
        if let Some(prefix) = &overrides.key_prefix {
            self.key_prefix = prefix.clone();
        }
        if let Some(max) = overrides.max_sessions {
            self.max_sessions = max;
        }
        if let Some(interval) = overrides.poll_interval {
            self.poll_interval = interval;
        }
    }
}

/// How many times the relay is tried after a punch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayRetryPolicy {
    /// Connection attempts including the first
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RelayRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Settings for a peer running the client session machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub punch_server: SocketAddr,
    pub relay_server: SocketAddr,
    /// Key for the coordinator token and the direct connection attempt
    pub base_key: String,
    /// Key for the relay token; a gated relay expects it to match its prefix
    pub relay_key: String,
    #[serde(with = "humantime_serde")]
    pub punch_timeout: Duration,
    pub relay_retry: RelayRetryPolicy,
    /// Local transport address
    pub bind_address: SocketAddr,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            punch_server: SocketAddr::from(([127, 0, 0, 1], 9051)),
            relay_server: SocketAddr::from(([127, 0, 0, 1], 9050)),
            base_key: "game".to_string(),
            relay_key: "relay".to_string(),
            punch_timeout: Duration::from_secs(5),
            relay_retry: RelayRetryPolicy::default(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

/// `punchrelay.toml` in the platform config directory
pub fn default_config_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("io", "punchrelay", "punchrelay")
        .context("Failed to determine config directory")?;
    Ok(proj_dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Read `path`, writing the defaults there first if it does not exist
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::info!("Config file not found, creating default at: {}", path.display());
        let config = Config::default();
        save_config(path, &config)?;
        return Ok(config);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str::<Config>(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let toml_content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    tracing::debug!("Saved config to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.port, 9050);
        assert_eq!(config.relay.admission, AdmissionPolicy::Gated);
        assert_eq!(config.relay.id_reuse, IdReuse::ResetOnHostLeave);
        assert_eq!(config.relay.max_sessions, 8);
        assert_eq!(config.punch.port, 9051);
        assert_eq!(config.punch.admission, AdmissionPolicy::Open);
        assert_eq!(config.client.punch_timeout, Duration::from_secs(5));
        assert_eq!(config.client.relay_retry.max_attempts, 10);
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            port = 7000
            admission = "open"
            poll_interval = "30ms"

            [client]
            base_key = "chess"
            relay_retry = { delay = "2s" }
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.port, 7000);
        assert_eq!(config.relay.admission, AdmissionPolicy::Open);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(30));
        assert_eq!(config.relay.key_prefix, "relay|");
        assert_eq!(config.client.base_key, "chess");
        assert_eq!(config.client.relay_retry.delay, Duration::from_secs(2));
        assert_eq!(config.client.relay_retry.max_attempts, 10);
        assert_eq!(config.punch, ServerConfig::punch());
    }

    #[test]
    fn test_load_creates_default() -> Result<()> {
        let temp_dir = tempdir()?;
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let config = load_config(&path)?;
        assert!(path.exists());
        assert_eq!(config, Config::default());

        let mut changed = config.clone();
        changed.punch.id_reuse = IdReuse::ResetOnHostLeave;
        save_config(&path, &changed)?;
        assert_eq!(load_config(&path)?, changed);
        Ok(())
    }

    #[test]
    fn test_overrides() {
        let mut server = ServerConfig::relay();
        server.apply(&ServerOverrides {
            port: Some(0),
            admission: Some(AdmissionPolicy::Open),
            ..ServerOverrides::default()
        });
        assert_eq!(server.port, 0);
        assert_eq!(server.admission, AdmissionPolicy::Open);
        assert_eq!(server.id_reuse, IdReuse::ResetOnHostLeave);
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(
            ServerConfig::relay().listen_addr().unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 9050))
        );
        let bad = ServerConfig {
            bind_address: "nowhere".into(),
            ..ServerConfig::relay()
        };
        assert!(bad.listen_addr().is_err());
    }
}
