#![allow(clippy::result_large_err)]
//! # Amoeba Core
//!
//! Asynchronous job execution core.
//!
//! ## Architecture
//!
//! - **Jobs**: priority queue with atomic claim, retries with backoff, and a
//!   bounded worker dispatcher over a handler registry
//! - **Scheduler**: cron schedules in IANA timezones turned into queued jobs,
//!   with an idempotency oracle, startup catch-up and low-priority backfill
//! - **Admission**: keyed fixed-window rate limiting with in-memory and Redis
//!   stores
//! - **Health**: traffic-light readiness aggregated from queue, schedule and
//!   external checks
//! - **Runtime**: one explicitly constructed owner for all of the above
//! - **Telemetry**: structured logging and metrics

pub mod admission;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;

pub use config::Config;
pub use error::{CoreError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
pub use runtime::{JobRuntime, JobRuntimeBuilder};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{ClientIdentity, KeyStrategy, RateLimitRule, RateLimitTier, RateLimiter};
    pub use crate::config::Config;
    pub use crate::error::{CoreError, ErrorCode, ErrorContext, Result};
    pub use crate::health::{HealthCheck, HealthStatus, ReadinessReport, ReadinessService};
    pub use crate::jobs::{
        FnHandler, HandlerRegistry, Job, JobContext, JobDispatcher, JobError, JobHandler, JobId,
        JobPriority, JobQueue, JobResult, JobStatus, NewJob, RetryPolicy,
    };
    pub use crate::runtime::JobRuntime;
    pub use crate::scheduler::{IdempotencyOracle, JobScheduler, NewSchedule, ScheduledJob};
}
