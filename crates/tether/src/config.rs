//! Configuration file loading and validation.
//!
//! Configuration errors are fatal: the process refuses to start rather
//! than run with a partial agent set. Secrets appear only as names,
//! resolved through the configured credential provider.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use tether_platform::{CredentialProvider, EnvProvider, FileProvider, Secret, VaultProvider};

/// Errors that make the configuration unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_marker() -> String {
    "/".to_string()
}

fn default_history_depth() -> u32 {
    50
}

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base URL of the collaboration platform.
    pub platform_url: String,

    #[serde(default = "default_true")]
    pub tls_verify: bool,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Prefix that turns a message into a command.
    #[serde(default = "default_marker")]
    pub command_marker: String,

    /// Channel receiving operator notices (degradation, stopped agents).
    #[serde(default)]
    pub fallback_channel: Option<FallbackChannelConfig>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// One entry per agent identity served by this bridge instance.
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Expected upstream keep-alive cadence.
    pub interval_secs: u64,
    /// No data for this long means the connection is dead.
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackChannelConfig {
    pub org: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_path")]
    pub path: PathBuf,
}

impl StoreConfig {
    fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("state.db")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

/// Which credential provider resolves secret names.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum SecretsConfig {
    #[default]
    Env,
    File {
        path: PathBuf,
    },
    Vault {
        url: String,
        #[serde(default = "SecretsConfig::default_mount")]
        mount: String,
        /// Environment variable holding the Vault token.
        token_env: String,
    },
}

impl SecretsConfig {
    fn default_mount() -> String {
        "secret".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    pub bind: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8585".parse().expect("valid default bind"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Base URL of the agent runtime's local session API.
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8790".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent identity name as known to the platform.
    pub name: String,
    /// Organization scope of the agent's credential.
    pub org: String,
    /// Secret name of the agent's bearer credential.
    pub credential: String,
    /// Connect this agent's stream at startup.
    #[serde(default = "default_true")]
    pub auto_subscribe: bool,
    /// History window fetched when priming a new session.
    #[serde(default = "default_history_depth")]
    pub history_depth: u32,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(&self.platform_url)
            .map_err(|e| ConfigError::Invalid(format!("platform_url: {e}")))?;

        if self.command_marker.is_empty() {
            return Err(ConfigError::Invalid("command_marker is empty".into()));
        }
        if self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            return Err(ConfigError::Invalid(
                "heartbeat timeout must exceed the keep-alive interval".into(),
            ));
        }
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("no agents configured".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.name.is_empty() || agent.org.is_empty() || agent.credential.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "agent entry '{}' is missing a name, org, or credential",
                    agent.name
                )));
            }
            if !seen.insert((agent.name.as_str(), agent.org.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent '{}' in org '{}'",
                    agent.name, agent.org
                )));
            }
            if agent.history_depth == 0 || agent.history_depth > 500 {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}': history_depth must be in 1..=500",
                    agent.name
                )));
            }
        }

        Ok(())
    }

    /// Build the configured credential provider.
    pub fn build_provider(&self) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
        match &self.secrets {
            SecretsConfig::Env => Ok(Arc::new(EnvProvider)),
            SecretsConfig::File { path } => Ok(Arc::new(FileProvider::new(path.clone()))),
            SecretsConfig::Vault {
                url,
                mount,
                token_env,
            } => {
                let token = std::env::var(token_env).map_err(|_| {
                    ConfigError::Invalid(format!("vault token variable '{token_env}' is not set"))
                })?;
                let provider = VaultProvider::new(url.clone(), mount.clone(), Secret::new(token))
                    .map_err(|e| ConfigError::Invalid(format!("vault provider: {e}")))?;
                Ok(Arc::new(provider))
            }
        }
    }
}
