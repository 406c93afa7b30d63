//! Job model, lifecycle transitions and retry policy.
//!
//! - **Job**: a unit of work with a type, payload, priority and lifecycle status
//! - **NewJob**: builder describing a job before it is enqueued
//! - **JobError**: handler failure, classified as retryable or fatal
//! - **RetryPolicy / BackoffStrategy**: attempt ceiling and retry delays
//! - **JobContext**: what a handler sees while it runs
//!
//! Lifecycle:
//!
//! ```text
//!            claim              complete
//! pending ──────────► processing ─────────► completed
//!    ▲                    │
//!    │  retryable and     │ fail
//!    │  attempts < max    ▼
//!    └──────────────── (backoff) ──────────► failed
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CoreError;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue (possibly until `run_at` for a retry)
    Pending,
    /// Claimed by a worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted or non-retryable error
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Terminal jobs never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Job priority. Numerically higher values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

impl JobPriority {
    /// Fresh, user-facing work.
    pub const LIVE: JobPriority = JobPriority(10);
    pub const DEFAULT: JobPriority = JobPriority(5);
    /// Bulk catch-up work that must not starve live work.
    pub const BACKFILL: JobPriority = JobPriority(1);

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<i32> for JobPriority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
    pub code: Option<String>,
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// A transient failure (dependency outage, timeout).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// A failure no retry can fix (bad payload, missing handler).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// The error recorded when no handler exists for a job type.
    pub fn no_handler(job_type: &str) -> Self {
        Self::fatal(format!("no handler registered for job type '{}'", job_type))
            .with_code("HANDLER_NOT_REGISTERED")
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<CoreError> for JobError {
    fn from(error: CoreError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `initial * multiplier^(attempts-1)`, capped at `max_delay_ms`
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Exponential with up to `jitter_factor` random spread either way
    ExponentialWithJitter {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the next attempt, given the number of finished attempts (1-based).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;

        let millis = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => capped(*initial_delay_ms, *max_delay_ms, *multiplier, exponent) as u64,
            Self::ExponentialWithJitter {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                jitter_factor,
            } => {
                let delay = capped(*initial_delay_ms, *max_delay_ms, *multiplier, exponent);
                let spread = delay * jitter_factor.clamp(0.0, 1.0);
                let jitter = (unit_noise() * 2.0 - 1.0) * spread;
                (delay + jitter).max(0.0) as u64
            }
        };

        Duration::from_millis(millis)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Exponential backoff with the given base and cap, doubling each attempt.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential {
            initial_delay_ms: base.as_millis() as u64,
            max_delay_ms: cap.as_millis() as u64,
            multiplier: 2.0,
        }
    }

    /// No delay at all between attempts.
    pub fn immediate() -> Self {
        Self::Fixed { delay_ms: 0 }
    }
}

fn capped(initial_ms: u64, max_ms: u64, multiplier: f64, exponent: i32) -> f64 {
    let delay = (initial_ms as f64) * multiplier.powi(exponent);
    if delay.is_finite() {
        delay.min(max_ms as f64)
    } else {
        max_ms as f64
    }
}

/// Cheap pseudo-random value in `[0, 1]` for jitter.
fn unit_noise() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempt ceiling plus delay strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the job fails permanently (at least 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt and no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Finished execution attempts
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// First dispatch time
    pub processed_at: Option<DateTime<Utc>>,
    /// Most recent claim; used for lease expiry
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set on `completed` or terminal `failed`
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a pending job may be claimed
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dedupe_key: Option<String>,
    /// Enqueue order, assigned by the queue backend
    pub sequence: u64,
}

/// What `fail` did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to `pending`, claimable at `run_at`
    Retrying { run_at: DateTime<Utc> },
    /// Reached terminal `failed`
    Failed,
    /// Job was already terminal; nothing changed
    Ignored,
}

impl Job {
    /// Build a pending job from a request. `sequence` is assigned by the backend.
    pub fn from_request(request: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type: request.job_type,
            priority: request.priority,
            payload: request.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts).max(1),
            created_at: now,
            processed_at: None,
            claimed_at: None,
            completed_at: None,
            run_at: request.run_at.unwrap_or(now),
            last_error: None,
            dedupe_key: request.dedupe_key,
            sequence: 0,
        }
    }

    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Attempt number of the run in progress (or the next run), 1-based.
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Time from first dispatch to terminal state.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.processed_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.claimed_at = Some(now);
        if self.processed_at.is_none() {
            self.processed_at = Some(now);
        }
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.completed_at = Some(now);
        self.claimed_at = None;
        self.last_error = None;
    }

    /// Record a failed attempt and decide between retry and terminal failure.
    pub(crate) fn mark_attempt_failed(
        &mut self,
        error: &JobError,
        backoff: &BackoffStrategy,
        now: DateTime<Utc>,
    ) -> FailOutcome {
        if self.status.is_terminal() {
            return FailOutcome::Ignored;
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_error = Some(error.message.clone());
        self.claimed_at = None;

        if error.retryable && self.attempts < self.max_attempts {
            let delay = chrono::Duration::from_std(backoff.delay_for_attempt(self.attempts))
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.status = JobStatus::Pending;
            self.run_at = now + delay;
            FailOutcome::Retrying { run_at: self.run_at }
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            FailOutcome::Failed
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// New Job Request
// ═══════════════════════════════════════════════════════════════════════════════

/// A job waiting to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    /// Overrides the queue's default attempt ceiling
    pub max_attempts: Option<u32>,
    /// At most one non-terminal job exists per key
    pub dedupe_key: Option<String>,
    /// Delay the first claim until this time
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            priority: JobPriority::default(),
            payload,
            max_attempts: None,
            dedupe_key: None,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<JobPriority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn priority(&self) -> JobPriority {
        self.job.priority
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.current_attempt()
    }

    pub fn max_attempts(&self) -> u32 {
        self.job.max_attempts
    }

    /// Whether a failure now would be final.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt() >= self.job.max_attempts
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload. A payload of the wrong shape is a fatal error.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            JobError::fatal(format!("invalid payload for '{}': {}", self.job.job_type, e))
                .with_code("INVALID_PAYLOAD")
        })
    }

    /// Read one string field from the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.job.payload.get(field).and_then(|v| v.as_str())
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.attempt(),
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.attempt(),
            message
        );
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job.id,
            job_type = %self.job.job_type,
            attempt = self.attempt(),
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
