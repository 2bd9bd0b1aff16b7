//! Registry configuration.

use crate::error::ConfigError;
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Environment variable for the eviction interval, in seconds
pub const ENV_EVICTION_INTERVAL: &str = "ARMATURE_REGISTRY_EVICTION_INTERVAL_SECS";
/// Environment variable for the staleness threshold, in seconds
pub const ENV_STALENESS: &str = "ARMATURE_REGISTRY_STALENESS_SECS";
/// Environment variable for the retention ratio
pub const ENV_RETENTION_RATIO: &str = "ARMATURE_REGISTRY_RETENTION_RATIO";
/// Environment variable toggling the eviction loop
pub const ENV_EVICTION: &str = "ARMATURE_REGISTRY_EVICTION";
/// Environment variable for the eviction RNG seed
pub const ENV_SEED: &str = "ARMATURE_REGISTRY_SEED";

/// Registry configuration.
///
/// Deserializes from `{"eviction_interval_secs": 60, "staleness_threshold_secs": 90, ...}`;
/// omitted fields take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawRegistryConfig")]
pub struct RegistryConfig {
    /// How often the eviction loop runs
    pub eviction_interval: Duration,

    /// An instance whose last heartbeat is older than this is expired
    pub staleness_threshold: Duration,

    /// Fraction of the instance population that must survive a single pass
    pub retention_ratio: f64,

    /// Whether `Registry::start` spawns the eviction loop
    pub eviction_enabled: bool,

    /// Seed for the eviction selection RNG (OS entropy when unset)
    pub rng_seed: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            eviction_interval: Duration::from_secs(60),
            staleness_threshold: Duration::from_secs(90),
            retention_ratio: 0.85,
            eviction_enabled: true,
            rng_seed: None,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from `ARMATURE_REGISTRY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_EVICTION_INTERVAL)? {
            config.eviction_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_STALENESS)? {
            config.staleness_threshold = Duration::from_secs(secs);
        }
        if let Some(ratio) = parse_var::<f64, _>(&lookup, ENV_RETENTION_RATIO)? {
            config.retention_ratio = ratio;
        }
        if let Some(value) = lookup(ENV_EVICTION) {
            config.eviction_enabled = value == "1" || value.eq_ignore_ascii_case("true");
        }
        config.rng_seed = parse_var::<u64, _>(&lookup, ENV_SEED)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the eviction interval.
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Set the staleness threshold.
    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Set the retention ratio.
    pub fn with_retention_ratio(mut self, ratio: f64) -> Self {
        self.retention_ratio = ratio;
        self
    }

    /// Enable or disable the background eviction loop.
    pub fn with_eviction(mut self, enabled: bool) -> Self {
        self.eviction_enabled = enabled;
        self
    }

    /// Seed the eviction selection RNG.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "eviction interval must be greater than zero".to_string(),
            ));
        }
        if self.staleness_threshold.is_zero() {
            return Err(ConfigError::Invalid(
                "staleness threshold must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retention_ratio) {
            return Err(ConfigError::Invalid(format!(
                "retention ratio must be within [0, 1], got {}",
                self.retention_ratio
            )));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawRegistryConfig {
    eviction_interval_secs: u64,
    staleness_threshold_secs: u64,
    retention_ratio: f64,
    eviction_enabled: bool,
    rng_seed: Option<u64>,
}

impl Default for RawRegistryConfig {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            eviction_interval_secs: defaults.eviction_interval.as_secs(),
            staleness_threshold_secs: defaults.staleness_threshold.as_secs(),
            retention_ratio: defaults.retention_ratio,
            eviction_enabled: defaults.eviction_enabled,
            rng_seed: defaults.rng_seed,
        }
    }
}

impl From<RawRegistryConfig> for RegistryConfig {
    fn from(raw: RawRegistryConfig) -> Self {
        Self {
            eviction_interval: Duration::from_secs(raw.eviction_interval_secs),
            staleness_threshold: Duration::from_secs(raw.staleness_threshold_secs),
            retention_ratio: raw.retention_ratio,
            eviction_enabled: raw.eviction_enabled,
            rng_seed: raw.rng_seed,
        }
    }
}
