//! Readiness aggregation.
//!
//! Combines queue metrics, schedule health and external signals into a
//! single traffic-light status with remediation text.

mod check;
mod checker;

pub use check::*;
pub use checker::*;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;
use crate::jobs::{JobQueue, QueueMetrics};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Timeout for each individual check
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub check_timeout: Duration,

    /// Processing jobs above which the queue counts as overloaded
    #[serde(default = "default_processing_threshold")]
    pub queue_processing_threshold: usize,

    /// Failure percentage above which the queue counts as degraded
    #[serde(default = "default_failure_rate_threshold")]
    pub queue_failure_rate_threshold: f64,
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_processing_threshold() -> usize {
    50
}

fn default_failure_rate_threshold() -> f64 {
    30.0
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            check_timeout: default_check_timeout(),
            queue_processing_threshold: default_processing_threshold(),
            queue_failure_rate_threshold: default_failure_rate_threshold(),
        }
    }
}

/// Runs readiness checks and aggregates them.
pub struct ReadinessService {
    config: ReadinessConfig,
    queue: JobQueue,
    checks: Vec<Arc<dyn ReadinessCheck>>,
    started_at: Instant,
}

impl ReadinessService {
    /// A service with the queue check registered.
    pub fn new(queue: JobQueue, config: ReadinessConfig) -> Self {
        let queue_check = QueueHealthCheck::new(queue.clone())
            .with_processing_threshold(config.queue_processing_threshold)
            .with_failure_rate_threshold(config.queue_failure_rate_threshold);

        Self {
            config,
            queue,
            checks: vec![Arc::new(queue_check)],
            started_at: Instant::now(),
        }
    }

    pub fn register(&mut self, check: Arc<dyn ReadinessCheck>) {
        self.checks.push(check);
    }

    pub fn with_check(mut self, check: impl ReadinessCheck + 'static) -> Self {
        self.register(Arc::new(check));
        self
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check concurrently and aggregate.
    pub async fn get_readiness(&self) -> ReadinessReport {
        let checks = self.run(self.checks.iter()).await;
        let report = ReadinessReport::from_checks(checks);

        if report.overall.is_healthy() {
            debug!(score = report.score, "Readiness evaluated");
        } else {
            warn!(
                overall = %report.overall,
                score = report.score,
                blockers = report.blockers.len(),
                warnings = report.warnings.len(),
                "System not fully ready"
            );
        }
        report
    }

    /// Run only the core checks.
    pub async fn quick_health(&self) -> QuickHealth {
        let checks = self.run(self.checks.iter().filter(|c| c.is_core())).await;
        QuickHealth::from_checks(&checks)
    }

    /// Point-in-time queue counts.
    pub async fn get_queue_metrics(&self) -> Result<QueueMetrics> {
        self.queue.metrics().await
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    async fn run<'a>(&self, checks: impl Iterator<Item = &'a Arc<dyn ReadinessCheck>>) -> Vec<HealthCheck> {
        let timeout = self.config.check_timeout;
        let futures: Vec<_> = checks
            .map(|check| {
                let check = check.clone();
                async move {
                    match tokio::time::timeout(timeout, check.check()).await {
                        Ok(result) => result,
                        Err(_) => HealthCheck::critical(
                            check.name(),
                            format!("Check timed out after {:?}", timeout),
                        )
                        .with_latency(timeout),
                    }
                }
            })
            .collect();

        futures::future::join_all(futures).await
    }
}
