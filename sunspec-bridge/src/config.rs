//! Bridge configuration.
//!
//! Sources, lowest priority first: built-in defaults, the JSON file, then
//! `SUNSPEC_BRIDGE_*` environment variables (`__` separates nested keys, e.g.
//! `SUNSPEC_BRIDGE_IDENTITY__SERIAL`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::encoder::DeviceIdentity;
use crate::logging::level_directive;
use crate::meter::{Credentials, ShellySettings};
use crate::poller::PollerSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const ENV_PREFIX: &str = "SUNSPEC_BRIDGE_";
pub const DEFAULT_LOG_FILE: &str = "shelly_meter.log";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("cannot write default configuration to {}: {source}", path.display())]
    WriteDefault {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the Shelly device.
    pub url: String,
    /// Digest authentication user, empty for none.
    pub username: String,
    pub password: String,
    pub shelly_em_id: u32,
    pub modbus_port: u16,
    /// Poll interval in seconds.
    pub update_interval: f64,
    pub log_level: String,
    /// Appended log file, relative to the config file. Empty for console only.
    pub log_file: String,
    pub listen_address: IpAddr,
    /// HTTP request timeout in seconds.
    pub request_timeout: f64,
    pub failure_threshold: u32,
    /// Reconnect backoff cap in seconds.
    pub reconnect_max_delay: f64,
    /// W
    pub power_balance_tolerance: f64,
    /// Wh
    pub energy_rollover_tolerance: f64,
    pub identity: DeviceIdentity,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "http://192.168.1.100".to_string(),
            username: String::new(),
            password: String::new(),
            shelly_em_id: 0,
            modbus_port: 502,
            update_interval: 1.0,
            log_level: "INFO".to_string(),
            log_file: DEFAULT_LOG_FILE.to_string(),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            request_timeout: 5.0,
            failure_threshold: 3,
            reconnect_max_delay: 30.0,
            power_balance_tolerance: 50.0,
            energy_rollover_tolerance: 0.0,
            identity: DeviceIdentity::default(),
        }
    }
}

/// Outcome of [`BridgeConfig::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    Config(Box<BridgeConfig>),
    /// No file existed; one with the defaults was written for the operator
    /// to edit.
    DefaultWritten(PathBuf),
}

impl BridgeConfig {
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(BridgeConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: &Path) -> Result<Loaded, ConfigError> {
        if !path.exists() {
            Self::default().save(path)?;
            return Ok(Loaded::DefaultWritten(path.to_path_buf()));
        }
        let config: BridgeConfig = Self::figment(path).extract()?;
        Ok(Loaded::Config(Box::new(config.validated()?)))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteDefault {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the values and normalize the URL.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.url = self.url.trim().trim_end_matches('/').to_string();
        if self.url.is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".to_string()));
        }
        for (name, seconds) in [
            ("update_interval", self.update_interval),
            ("request_timeout", self.request_timeout),
            ("reconnect_max_delay", self.reconnect_max_delay),
        ] {
            if !(seconds > 0.0 && Duration::try_from_secs_f64(seconds).is_ok()) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a positive number of seconds, got {seconds}"
                )));
            }
        }
        for (name, tolerance) in [
            ("power_balance_tolerance", self.power_balance_tolerance),
            ("energy_rollover_tolerance", self.energy_rollover_tolerance),
        ] {
            if !(tolerance.is_finite() && tolerance >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must not be negative, got {tolerance}"
                )));
            }
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if level_directive(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        Ok(self)
    }

    /// Digest credentials, when both user and password are set.
    pub fn credentials(&self) -> Option<Credentials> {
        (!self.username.is_empty() && !self.password.is_empty()).then(|| Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    pub fn shelly_settings(&self) -> ShellySettings {
        ShellySettings {
            url: self.url.clone(),
            em_id: self.shelly_em_id,
            credentials: self.credentials(),
            timeout: Duration::from_secs_f64(self.request_timeout),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            interval: Duration::from_secs_f64(self.update_interval),
            fetch_timeout: Duration::from_secs_f64(self.request_timeout),
            failure_threshold: self.failure_threshold,
            max_backoff: Duration::from_secs_f64(self.reconnect_max_delay),
            power_balance_tolerance: self.power_balance_tolerance,
            energy_rollover_tolerance: self.energy_rollover_tolerance,
        }
    }

    pub fn modbus_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.modbus_port)
    }

    /// Log file location, resolved against the directory of `config_path`.
    pub fn log_path(&self, config_path: &Path) -> Option<PathBuf> {
        let file = self.log_file.trim();
        if file.is_empty() {
            return None;
        }
        let dir = config_path.parent().unwrap_or(Path::new(""));
        Some(dir.join(file))
    }
}
