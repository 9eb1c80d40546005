use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::game::constants::{relay, sim};
use crate::net::relay::RelayConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which half of the host this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Spawns the simulation and consumes its replication stream
    Supervisor,
    /// Headless simulation connected back to the supervisor
    Simulation,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "supervisor" => Ok(Role::Supervisor),
            "simulation" => Ok(Role::Simulation),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Writer idle time before a heartbeat frame, milliseconds
    pub heartbeat_ms: u64,
    /// Reader idle budget before the peer is dropped, seconds
    pub read_timeout_secs: u64,
    /// Longest a frame write may block before the peer is dropped, seconds
    pub write_timeout_secs: u64,
    /// Blocking read slice, milliseconds
    pub poll_ms: u64,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Default correction delay for reconciliation buffers, milliseconds
    pub correction_delay_ms: u64,
    pub role: Role,
    /// Supervisor listener address the simulation connects back to
    pub relay_address: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: relay::HEARTBEAT_INTERVAL_MS,
            read_timeout_secs: relay::READ_TIMEOUT_SECS,
            write_timeout_secs: relay::WRITE_TIMEOUT_SECS,
            poll_ms: relay::POLL_INTERVAL_MS,
            tick_rate: sim::TICK_RATE,
            correction_delay_ms: (sim::CORRECTION_DELAY * 1000.0) as u64,
            role: Role::Supervisor,
            relay_address: None,
        }
    }
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
    range_hint: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} must be {}, using default", key, range_hint);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

impl HostConfig {
    /// Defaults, then the JSON file named by `ABYSS_CONFIG`, then
    /// environment overrides
    pub fn load_or_default() -> Self {
        let mut config = match std::env::var("ABYSS_CONFIG") {
            Ok(path) => Self::from_file(&path).unwrap_or_else(|e| {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Apply overrides from `lookup`; invalid values keep the current setting
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = parse_env(&lookup, "RELAY_HEARTBEAT_MS", |v: &u64| *v > 0, "> 0") {
            self.heartbeat_ms = ms;
        }
        if let Some(secs) = parse_env(&lookup, "RELAY_READ_TIMEOUT_SECS", |v: &u64| *v > 0, "> 0") {
            self.read_timeout_secs = secs;
        }
        if let Some(secs) = parse_env(&lookup, "RELAY_WRITE_TIMEOUT_SECS", |v: &u64| *v > 0, "> 0") {
            self.write_timeout_secs = secs;
        }
        if let Some(ms) = parse_env(&lookup, "RELAY_POLL_MS", |v: &u64| (1..=5000).contains(v), "1-5000") {
            self.poll_ms = ms;
        }
        if let Some(rate) = parse_env(&lookup, "TICK_RATE", |v: &u32| (1..=1000).contains(v), "1-1000") {
            self.tick_rate = rate;
        }
        if let Some(ms) = parse_env(&lookup, "CORRECTION_DELAY_MS", |_: &u64| true, "a number") {
            self.correction_delay_ms = ms;
        }
        if let Some(raw) = lookup("RELAY_ROLE") {
            match raw.parse() {
                Ok(role) => self.role = role,
                Err(e) => tracing::warn!("Invalid RELAY_ROLE: {}, using default", e),
            }
        }
        if let Some(address) = lookup("RELAY_ADDRESS") {
            self.relay_address = Some(address);
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_ms cannot be 0".to_string()));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid("write_timeout_secs cannot be 0".to_string()));
        }
        if self.poll_ms == 0 {
            return Err(ConfigError::Invalid("poll_ms cannot be 0".to_string()));
        }
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be at least 1".to_string()));
        }
        if self.poll_ms >= self.read_timeout_secs * 1000 {
            return Err(ConfigError::Invalid(
                "poll_ms must be shorter than the read timeout".to_string(),
            ));
        }
        if self.heartbeat_ms >= self.read_timeout_secs * 1000 {
            return Err(ConfigError::Invalid(
                "heartbeat_ms must be shorter than the read timeout or idle peers time out".to_string(),
            ));
        }
        if self.role == Role::Simulation && self.relay_address.is_none() {
            return Err(ConfigError::Invalid(
                "simulation role requires RELAY_ADDRESS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn correction_delay(&self) -> f32 {
        self.correction_delay_ms as f32 / 1000.0
    }
}
