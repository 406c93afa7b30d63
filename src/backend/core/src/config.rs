//! Configuration management.
//!
//! Every section is optional and fully defaulted. Values are layered:
//!
//! 1. built-in defaults
//! 2. an optional config file (`Config::from_file`)
//! 3. `AMOEBA__<SECTION>__<FIELD>` environment variables, after `.env` is loaded
//!
//! Durations accept humantime strings such as `"30s"` or `"15m"`.

use serde::Deserialize;
use std::path::Path;

use crate::admission::RateLimitConfig;
use crate::error::{CoreError, Result};
use crate::health::ReadinessConfig;
use crate::jobs::{DispatcherConfig, QueueConfig};
use crate::scheduler::SchedulerConfig;
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};

const ENV_PREFIX: &str = "AMOEBA";
const ENV_SEPARATOR: &str = "__";

/// Main configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service name used in logs and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; shared state is disabled when unset
    #[serde(default)]
    pub url: Option<String>,
}

fn default_service_name() -> String {
    "amoeba-core".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            readiness: ReadinessConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `.env` and the environment.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::build(None, environment())
    }

    /// Load from a specific file, with the environment layered on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::build(Some(path.as_ref()), environment())
    }

    fn build(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        let cfg: Config = builder.add_source(env).build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.concurrency == 0 {
            return Err(invalid("dispatcher.concurrency must be at least 1"));
        }
        if self.dispatcher.poll_interval.is_zero() {
            return Err(invalid("dispatcher.poll_interval must be greater than zero"));
        }
        if self.queue.retry.max_attempts == 0 {
            return Err(invalid("queue.retry.max_attempts must be at least 1"));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(invalid("scheduler.tick_interval must be greater than zero"));
        }
        if self.rate_limit.cleanup_interval.is_zero() {
            return Err(invalid("rate_limit.cleanup_interval must be greater than zero"));
        }
        if self.readiness.check_timeout.is_zero() {
            return Err(invalid("readiness.check_timeout must be greater than zero"));
        }
        if !(0.0..=100.0).contains(&self.readiness.queue_failure_rate_threshold) {
            return Err(invalid(
                "readiness.queue_failure_rate_threshold must be between 0 and 100",
            ));
        }
        Ok(())
    }

    /// Rate limit settings with the shared Redis URL applied when the
    /// section does not name its own.
    pub fn effective_rate_limit(&self) -> RateLimitConfig {
        let mut rate_limit = self.rate_limit.clone();
        if rate_limit.redis_url.is_none() {
            rate_limit.redis_url = self.redis.url.clone();
        }
        rate_limit
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.service_name.clone(),
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

fn invalid(message: &'static str) -> CoreError {
    CoreError::configuration(message)
}
