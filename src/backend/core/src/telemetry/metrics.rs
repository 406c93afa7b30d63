//! Prometheus metrics for the job execution core.
//!
//! Components record through the small helper types in this module rather than
//! calling the `metrics` macros directly, so metric names and label sets stay
//! consistent:
//!
//! - [`JobMetrics`]: enqueue, claim, completion, failure, retry, durations
//! - [`ScheduleMetrics`]: schedule evaluations and backfill enqueues
//! - [`AdmissionMetrics`]: rate limiter decisions
//!
//! Without an installed recorder every call is a no-op, which is what tests use.
//!
//! # Example
//!
//! ```rust,no_run
//! use amoeba_core::telemetry::metrics::{init_metrics, MetricsConfig};
//!
//! let registry = init_metrics(&MetricsConfig::default(), "amoeba-core").unwrap();
//! println!("{}", registry.render());
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

pub const JOBS_ENQUEUED_TOTAL: &str = "amoeba_jobs_enqueued_total";
pub const JOBS_CLAIMED_TOTAL: &str = "amoeba_jobs_claimed_total";
pub const JOBS_COMPLETED_TOTAL: &str = "amoeba_jobs_completed_total";
pub const JOBS_FAILED_TOTAL: &str = "amoeba_jobs_failed_total";
pub const JOBS_RETRIED_TOTAL: &str = "amoeba_jobs_retried_total";
pub const JOB_DURATION_SECONDS: &str = "amoeba_job_duration_seconds";
pub const QUEUE_DEPTH: &str = "amoeba_queue_depth";
pub const SCHEDULE_RUNS_TOTAL: &str = "amoeba_schedule_runs_total";
pub const BACKFILL_ENQUEUED_TOTAL: &str = "amoeba_backfill_enqueued_total";
pub const RATE_LIMIT_CHECKS_TOTAL: &str = "amoeba_rate_limit_checks_total";
pub const RATE_LIMIT_EVICTIONS_TOTAL: &str = "amoeba_rate_limit_evictions_total";

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether a Prometheus recorder should be installed
    #[serde(default)]
    pub enabled: bool,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
}

/// Handle to the installed Prometheus recorder (if any).
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// Returns a disabled registry when `config.enabled` is false. The recorder is
/// process-global, so this should be called once at startup.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(JOBS_ENQUEUED_TOTAL, "Jobs accepted into the queue");
    describe_counter!(JOBS_CLAIMED_TOTAL, "Jobs claimed by a worker");
    describe_counter!(JOBS_COMPLETED_TOTAL, "Jobs that reached completed");
    describe_counter!(JOBS_FAILED_TOTAL, "Jobs that reached terminal failed");
    describe_counter!(JOBS_RETRIED_TOTAL, "Failed attempts returned to pending");
    describe_histogram!(JOB_DURATION_SECONDS, "Handler execution time in seconds");
    describe_gauge!(QUEUE_DEPTH, "Jobs per status");
    describe_counter!(SCHEDULE_RUNS_TOTAL, "Schedule evaluations by outcome");
    describe_counter!(BACKFILL_ENQUEUED_TOTAL, "Jobs enqueued by backfill");
    describe_counter!(RATE_LIMIT_CHECKS_TOTAL, "Rate limiter decisions");
    describe_counter!(RATE_LIMIT_EVICTIONS_TOTAL, "Expired rate limit entries purged");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recording helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn enqueued(job_type: &str, priority: i32) {
        counter!(
            JOBS_ENQUEUED_TOTAL,
            "job_type" => job_type.to_string(),
            "priority" => priority.to_string(),
        )
        .increment(1);
    }

    pub fn claimed(job_type: &str) {
        counter!(JOBS_CLAIMED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    pub fn completed(job_type: &str, duration_secs: f64) {
        counter!(JOBS_COMPLETED_TOTAL, "job_type" => job_type.to_string()).increment(1);
        histogram!(
            JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "outcome" => "completed",
        )
        .record(duration_secs);
    }

    pub fn failed(job_type: &str, duration_secs: f64) {
        counter!(JOBS_FAILED_TOTAL, "job_type" => job_type.to_string()).increment(1);
        histogram!(
            JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "outcome" => "failed",
        )
        .record(duration_secs);
    }

    pub fn retried(job_type: &str) {
        counter!(JOBS_RETRIED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    pub fn queue_depth(status: &'static str, count: usize) {
        gauge!(QUEUE_DEPTH, "status" => status).set(count as f64);
    }
}

/// Scheduler metrics.
pub struct ScheduleMetrics;

impl ScheduleMetrics {
    /// `outcome` is one of `enqueued`, `skipped`, `error`.
    pub fn evaluated(schedule: &str, outcome: &'static str) {
        counter!(
            SCHEDULE_RUNS_TOTAL,
            "schedule" => schedule.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn backfill_enqueued(schedule: &str, count: u64) {
        counter!(BACKFILL_ENQUEUED_TOTAL, "schedule" => schedule.to_string()).increment(count);
    }
}

/// Admission-control metrics.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    pub fn checked(tier: &str, allowed: bool) {
        counter!(
            RATE_LIMIT_CHECKS_TOTAL,
            "tier" => tier.to_string(),
            "allowed" => allowed.to_string(),
        )
        .increment(1);
    }

    pub fn evicted(count: usize) {
        counter!(RATE_LIMIT_EVICTIONS_TOTAL).increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        let registry = init_metrics(&config, "test").unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        JobMetrics::enqueued("generate", 10);
        JobMetrics::completed("generate", 0.5);
        ScheduleMetrics::evaluated("daily", "skipped");
        AdmissionMetrics::checked("strict", false);
    }
}
