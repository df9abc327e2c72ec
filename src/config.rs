//! Pipeline-wide configuration
//!
//! [`FetchConfig`] bundles the cache, circuit breaker and scheduler settings
//! with the backend base URL. It can be assembled with a builder or read
//! from `OUROBOROS_FETCH_*` environment variables (a `.env` file is honored).

use crate::cache::CacheConfig;
use crate::circuit::CircuitBreakerConfig;
use crate::error::{FetchError, Result};
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const ENV_PREFIX: &str = "OUROBOROS_FETCH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Prepended to relative endpoints
    pub base_url: String,

    pub cache: CacheConfig,

    pub circuit: CircuitBreakerConfig,

    pub scheduler: SchedulerConfig,
}

impl FetchConfig {
    pub fn builder() -> FetchConfigBuilder {
        FetchConfigBuilder::default()
    }

    /// Read configuration from the environment, loading `.env` first
    ///
    /// Recognized variables (all optional, prefixed with `OUROBOROS_FETCH_`):
    /// `BASE_URL`, `MEMORY_TTL_SECS`, `DISK_TTL_SECS`, `MEMORY_MAX_BYTES`,
    /// `DISK_MAX_BYTES`, `FAILURE_THRESHOLD`, `SUCCESS_THRESHOLD`,
    /// `RESET_TIMEOUT_MS`, `REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded .env file");
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));
        let mut config = Self::default();

        if let Some(base_url) = var("BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(secs) = parse_var::<u64>("MEMORY_TTL_SECS", var("MEMORY_TTL_SECS")) {
            config.cache.memory_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("DISK_TTL_SECS", var("DISK_TTL_SECS")) {
            config.cache.disk_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var("MEMORY_MAX_BYTES", var("MEMORY_MAX_BYTES")) {
            config.cache.memory_max_bytes = bytes;
        }
        if let Some(bytes) = parse_var("DISK_MAX_BYTES", var("DISK_MAX_BYTES")) {
            config.cache.disk_max_bytes = bytes;
        }
        if let Some(threshold) = parse_var("FAILURE_THRESHOLD", var("FAILURE_THRESHOLD")) {
            config.circuit.failure_threshold = threshold;
        }
        if let Some(threshold) = parse_var("SUCCESS_THRESHOLD", var("SUCCESS_THRESHOLD")) {
            config.circuit.success_threshold = threshold;
        }
        if let Some(ms) = parse_var::<u64>("RESET_TIMEOUT_MS", var("RESET_TIMEOUT_MS")) {
            config.circuit.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("REQUEST_TIMEOUT_MS", var("REQUEST_TIMEOUT_MS")) {
            config.scheduler.request_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate().map_err(FetchError::ConfigError)?;
        self.circuit.validate().map_err(FetchError::ConfigError)?;
        self.scheduler.validate().map_err(FetchError::ConfigError)?;
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}{}={:?}", ENV_PREFIX, name, raw);
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchConfigBuilder {
    base_url: Option<String>,
    cache: Option<CacheConfig>,
    circuit: Option<CircuitBreakerConfig>,
    scheduler: Option<SchedulerConfig>,
}

impl FetchConfigBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = Some(circuit);
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn request_timeout(self, timeout: Duration) -> Self {
        self.scheduler(SchedulerConfig::new(timeout))
    }

    pub fn build(self) -> FetchConfig {
        FetchConfig {
            base_url: self.base_url.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            circuit: self.circuit.unwrap_or_default(),
            scheduler: self.scheduler.unwrap_or_default(),
        }
    }
}
