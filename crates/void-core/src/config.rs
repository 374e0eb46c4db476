//! Daemon and CLI configuration.
//!
//! Loaded from YAML at `~/.void/config.yaml`. A missing file means
//! defaults; a file that fails to parse or validate is fatal at startup.
//! Durations use the humantime grammar (`30s`, `5m`, `2h30m`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

/// Default Unix socket the daemon listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/voidd.socket";

/// Config file location, relative to the user's home directory.
pub const DEFAULT_CONFIG_PATH: &str = ".void/config.yaml";

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const MIN_DNS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("socket path cannot be empty")]
    EmptySocketPath,

    #[error("dns_refresh_interval must be at least 1 minute")]
    RefreshIntervalTooShort,

    #[error("dns_timeout must be at least 1 second")]
    DnsTimeoutTooShort,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub socket: SocketConfig,
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub path: PathBuf,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// How often rule address sets are re-resolved against DNS.
    #[serde(with = "humantime_serde")]
    pub dns_refresh_interval: Duration,

    /// Per-query DNS timeout.
    #[serde(with = "humantime_serde")]
    pub dns_timeout: Duration,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dns_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
        }
    }
}

impl Config {
    /// Loads from the default location under the user's home directory.
    ///
    /// # Errors
    ///
    /// See [`Config::load_from`]; a missing file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Loads and validates configuration from `path`. A missing file yields
    /// the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.void/config.yaml`, falling back to the relative path when the
    /// home directory cannot be resolved.
    #[must_use]
    pub fn default_path() -> PathBuf {
        BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Checks the bounds the daemon relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket.path.as_os_str().is_empty() {
            return Err(ConfigError::EmptySocketPath);
        }
        if self.rules.dns_refresh_interval < MIN_REFRESH_INTERVAL {
            return Err(ConfigError::RefreshIntervalTooShort);
        }
        if self.rules.dns_timeout < MIN_DNS_TIMEOUT {
            return Err(ConfigError::DnsTimeoutTooShort);
        }
        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
