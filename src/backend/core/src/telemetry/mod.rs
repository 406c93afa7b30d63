//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing` with JSON/pretty/compact output and per-module levels
//! - **Metrics**: `metrics` facade with an optional Prometheus recorder
//!
//! # Example
//!
//! ```rust,no_run
//! use amoeba_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let handle = init_telemetry(&TelemetryConfig::default()).expect("telemetry");
//! handle.shutdown();
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{
    init_metrics, AdmissionMetrics, JobMetrics, MetricsConfig, MetricsRegistry, ScheduleMetrics,
};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "amoeba-core".to_string()
}

/// Initialize logging and metrics. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging)?;

    ::tracing::info!(
        service_name = %config.service_name,
        metrics_enabled = metrics.is_enabled(),
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics })
}

/// Handle for managing telemetry lifecycle.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::info!("Telemetry shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "amoeba-core");
        assert!(!config.metrics.enabled);
    }
}
