//! Cache settings: loaded once at process start from the environment or a TOML file.
//!
//! Environment variables:
//!
//! | Variable                       | Meaning                                    | Default   |
//! |--------------------------------|--------------------------------------------|-----------|
//! | `API_CACHE_ENABLED`            | master switch                              | `true`    |
//! | `API_CACHE_TIMEOUT`            | default ttl in seconds                     | `900`     |
//! | `API_CACHE_MAX_TTL`            | upper bound on any ttl in seconds          | `3600`    |
//! | `API_CACHE_MAX_ENTRIES`        | capacity as an entry count                 | unset     |
//! | `API_CACHE_MAX_BYTES`          | capacity as a byte budget                  | 64 MiB    |
//! | `API_CACHE_SWEEP_INTERVAL`     | background sweep period in seconds         | unset     |
//! | `API_CACHE_DISABLED_ENDPOINTS` | comma separated endpoints never cached     | empty     |
//!
//! `API_CACHE_MAX_ENTRIES` wins over `API_CACHE_MAX_BYTES` when both are set.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default ttl, matching the API's historical cache timeout.
pub const DEFAULT_TTL_SECS: u64 = 900;

pub const DEFAULT_MAX_TTL_SECS: u64 = 3600;

pub const DEFAULT_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;

/// Errors produced while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid settings file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: &'static str, value: String },

    #[error("cache capacity must be greater than zero")]
    ZeroCapacity,

    #[error("ttl must be greater than zero")]
    ZeroTtl,

    #[error("max ttl ({max}s) is shorter than the default ttl ({default}s)")]
    TtlOrder { default: u64, max: u64 },
}

/// How capacity is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capacity {
    /// At most this many entries.
    Entries(usize),
    /// At most this many estimated payload bytes.
    Bytes(u64),
}

impl Capacity {
    /// The capacity in its own units.
    pub fn limit(&self) -> u64 {
        match *self {
            Self::Entries(n) => n as u64,
            Self::Bytes(n) => n,
        }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::Bytes(DEFAULT_CAPACITY_BYTES)
    }
}

/// Per-endpoint overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub enabled: bool,
    pub ttl_secs: Option<u64>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: None,
        }
    }
}

/// Operator configuration for the query cache.
///
/// # Examples
///
/// ```
/// use aqcache::config::{CacheSettings, Capacity};
///
/// let settings = CacheSettings::from_toml_str(r#"
///     default_ttl_secs = 300
///     capacity = { entries = 5000 }
///
///     [endpoints."/v3/sensors/{sensors_id}/measurements"]
///     enabled = false
/// "#).unwrap();
///
/// assert_eq!(settings.capacity, Capacity::Entries(5000));
/// assert!(!settings.is_endpoint_enabled("/v3/sensors/{sensors_id}/measurements"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: Capacity,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub sweep_interval_secs: Option<u64>,
    pub endpoints: HashMap<String, EndpointSettings>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: Capacity::default(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            max_ttl_secs: DEFAULT_MAX_TTL_SECS,
            sweep_interval_secs: None,
            endpoints: HashMap::new(),
        }
    }
}

impl CacheSettings {
    /// Loads settings from `API_CACHE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidVar`] for unparsable values, or a validation error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(enabled) = parse_var::<bool, _>(&lookup, "API_CACHE_ENABLED")? {
            settings.enabled = enabled;
        }
        if let Some(ttl) = parse_var(&lookup, "API_CACHE_TIMEOUT")? {
            settings.default_ttl_secs = ttl;
        }
        if let Some(max) = parse_var(&lookup, "API_CACHE_MAX_TTL")? {
            settings.max_ttl_secs = max;
        }
        if let Some(bytes) = parse_var(&lookup, "API_CACHE_MAX_BYTES")? {
            settings.capacity = Capacity::Bytes(bytes);
        }
        if let Some(entries) = parse_var(&lookup, "API_CACHE_MAX_ENTRIES")? {
            settings.capacity = Capacity::Entries(entries);
        }
        settings.sweep_interval_secs = parse_var(&lookup, "API_CACHE_SWEEP_INTERVAL")?;

        if let Some(disabled) = lookup("API_CACHE_DISABLED_ENDPOINTS") {
            for endpoint in disabled.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                settings.endpoints.insert(
                    endpoint.to_owned(),
                    EndpointSettings {
                        enabled: false,
                        ttl_secs: None,
                    },
                );
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Parses and validates a TOML settings document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the invariants the cache relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity.limit() == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.default_ttl_secs == 0 || self.max_ttl_secs == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.max_ttl_secs < self.default_ttl_secs {
            return Err(ConfigError::TtlOrder {
                default: self.default_ttl_secs,
                max: self.max_ttl_secs,
            });
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Ttl for `endpoint`: its override if configured, otherwise the default.
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        self.endpoints
            .get(endpoint)
            .and_then(|e| e.ttl_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.default_ttl())
    }

    pub fn is_endpoint_enabled(&self, endpoint: &str) -> bool {
        self.enabled && self.endpoints.get(endpoint).is_none_or(|e| e.enabled)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .to_ascii_lowercase()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value: raw }),
    }
}
