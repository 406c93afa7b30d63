//! Readiness checks for the job core and external signals.
//!
//! This module provides:
//! - **Queue**: job store reachability, load and failure rate
//! - **Schedules**: configured, active and not mostly failing
//! - **FnCheck**: any external signal (credentials, storage) as a closure
//!
//! # Example
//!
//! ```rust,ignore
//! use amoeba_core::health::{FnCheck, HealthCheck};
//!
//! let credentials = FnCheck::new("ai_credentials", || async {
//!     HealthCheck::healthy("ai_credentials", "2 credential(s) ready")
//! })
//! .core();
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::time::Instant;
use tracing::error;

use super::check::HealthCheck;
use crate::jobs::JobQueue;
use crate::scheduler::JobScheduler;

// ═══════════════════════════════════════════════════════════════════════════════
// Readiness Check Trait
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a result. Failures are expressed as a non-healthy check,
    /// never as a panic or error.
    async fn check(&self) -> HealthCheck;

    /// Core checks also run for the quick liveness view.
    fn is_core(&self) -> bool {
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Check
// ═══════════════════════════════════════════════════════════════════════════════

pub struct QueueHealthCheck {
    queue: JobQueue,
    processing_threshold: usize,
    failure_rate_threshold: f64,
}

impl QueueHealthCheck {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            processing_threshold: 50,
            failure_rate_threshold: 30.0,
        }
    }

    /// Degrade when more jobs than this are processing at once.
    pub fn with_processing_threshold(mut self, threshold: usize) -> Self {
        self.processing_threshold = threshold;
        self
    }

    /// Degrade above this failure percentage.
    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent;
        self
    }
}

#[async_trait]
impl ReadinessCheck for QueueHealthCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> HealthCheck {
        let start = Instant::now();
        let metrics = match self.queue.metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(error = %e, "Queue readiness check failed");
                return HealthCheck::critical(self.name(), format!("Queue check failed: {}", e.user_message()))
                    .with_action("Verify the job store is reachable")
                    .with_latency(start.elapsed());
            }
        };

        let failure_rate = metrics.failure_rate();
        let check = if metrics.processing > self.processing_threshold {
            HealthCheck::degraded(
                self.name(),
                format!("High queue load ({} processing)", metrics.processing),
            )
            .with_action("Add workers or reduce intake")
        } else if failure_rate > self.failure_rate_threshold {
            HealthCheck::degraded(
                self.name(),
                format!("High failure rate ({:.1}%)", failure_rate),
            )
            .with_action("Check failed jobs for their last error")
        } else {
            HealthCheck::healthy(
                self.name(),
                format!("Queue healthy ({} completed)", metrics.completed),
            )
        };

        check
            .with_detail("pending", metrics.pending)
            .with_detail("processing", metrics.processing)
            .with_detail("completed", metrics.completed)
            .with_detail("failed", metrics.failed)
            .with_detail("failure_rate", failure_rate)
            .with_latency(start.elapsed())
    }

    fn is_core(&self) -> bool {
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Check
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ScheduleHealthCheck {
    scheduler: JobScheduler,
}

impl ScheduleHealthCheck {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl ReadinessCheck for ScheduleHealthCheck {
    fn name(&self) -> &str {
        "scheduled_jobs"
    }

    async fn check(&self) -> HealthCheck {
        let summary = self.scheduler.summary().await;

        if summary.total == 0 {
            return HealthCheck::degraded(self.name(), "No scheduled jobs configured")
                .with_action("Schedule jobs for automated content generation");
        }

        if summary.active == 0 {
            return HealthCheck::degraded(self.name(), "All schedules are inactive")
                .with_detail("total", summary.total)
                .with_detail("active", 0)
                .with_action("Activate schedules to enable automation");
        }

        // More than half of the active schedules erroring
        if summary.failing * 2 > summary.active {
            return HealthCheck::degraded(
                self.name(),
                format!("{} schedule(s) failing", summary.failing),
            )
            .with_detail("total", summary.total)
            .with_detail("active", summary.active)
            .with_detail("failing", summary.failing)
            .with_action("Check schedule errors and fix the definitions or targets");
        }

        HealthCheck::healthy(self.name(), format!("{} active schedule(s)", summary.active))
            .with_detail("total", summary.total)
            .with_detail("active", summary.active)
            .with_detail("failing", summary.failing)
            .with_detail("success_rate", summary.success_rate.map(|r| r.round()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Closure Check
// ═══════════════════════════════════════════════════════════════════════════════

/// Readiness check backed by an async closure.
pub struct FnCheck<F> {
    name: String,
    func: F,
    core: bool,
}

impl<F, Fut> FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = HealthCheck> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            core: false,
        }
    }

    /// Include this check in the quick view.
    pub fn core(mut self) -> Self {
        self.core = true;
        self
    }
}

#[async_trait]
impl<F, Fut> ReadinessCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = HealthCheck> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> HealthCheck {
        let start = Instant::now();
        let mut check = (self.func)().await;
        if check.latency_ms.is_none() {
            check = check.with_latency(start.elapsed());
        }
        check
    }

    fn is_core(&self) -> bool {
        self.core
    }
}
