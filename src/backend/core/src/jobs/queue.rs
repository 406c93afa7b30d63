//! Priority job queue and job state machine.
//!
//! The queue is the only component that changes job state. Workers call
//! [`JobQueue::claim_next`], then exactly one of [`JobQueue::complete`] or
//! [`JobQueue::fail`]. Ordering is strict priority (higher first), then
//! `created_at`, then enqueue sequence.
//!
//! Storage goes through [`QueueBackend`]. Backends must make `claim_next`
//! atomic and implement `compare_and_swap` as a true check-and-set on status,
//! since two workers claiming the same job is the one hazard the design cannot
//! tolerate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::job::{BackoffStrategy, FailOutcome, Job, JobError, JobId, JobPriority, JobStatus, NewJob, RetryPolicy};
use crate::error::{CoreError, ErrorCode, Result};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of non-terminal jobs (0 = unlimited)
    #[serde(default)]
    pub max_size: usize,

    /// Default attempt ceiling and backoff for new jobs
    #[serde(default)]
    pub retry: RetryPolicy,

    /// A processing job claimed longer ago than this is considered abandoned
    #[serde(default = "default_stalled_lease", with = "humantime_serde")]
    pub stalled_lease: Duration,

    /// Completed and failed jobs older than this are purged (`None` keeps them)
    #[serde(default = "default_terminal_retention", with = "humantime_serde")]
    pub terminal_retention: Option<Duration>,
}

fn default_stalled_lease() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_terminal_retention() -> Option<Duration> {
    Some(Duration::from_secs(24 * 60 * 60))
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            retry: RetryPolicy::default(),
            stalled_lease: default_stalled_lease(),
            terminal_retention: default_terminal_retention(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshots
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueMetrics {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Percentage of all known jobs that ended in `failed`.
    pub fn failure_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64 * 100.0
        }
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Processing statistics for one job type over its most recent jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub job_type: String,
    /// Jobs considered (most recent first, up to the requested limit)
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean seconds from first dispatch to completion, over completed jobs
    pub average_processing_secs: f64,
    pub last_created_at: Option<DateTime<Utc>>,
}

/// Filter for listing jobs. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn job_type(job_type: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
    }
}

/// Result of inserting a job.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Job),
    /// A non-terminal job with the same dedupe key already exists
    Existing(Job),
}

impl InsertOutcome {
    pub fn into_job(self) -> Job {
        match self {
            Self::Inserted(job) | Self::Existing(job) => job,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage seam for jobs.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new pending job, assigning its `sequence`.
    ///
    /// Must return `Existing` instead of inserting when a non-terminal job
    /// shares the dedupe key, and `QueueFull` when `max_size` non-terminal
    /// jobs already exist.
    async fn insert(&self, job: Job, max_size: usize) -> Result<InsertOutcome>;

    /// Atomically move the best claimable job to `processing`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Replace the stored job only if its current status equals `expected`.
    async fn compare_and_swap(&self, expected: JobStatus, job: Job) -> Result<bool>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn counts(&self) -> Result<QueueMetrics>;

    /// Remove terminal jobs that finished before `before`. Returns how many.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Heap entry for a pending job. Max-heap order = claim order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: JobPriority,
    created_at: DateTime<Utc>,
    sequence: u64,
    id: JobId,
}

impl ReadyEntry {
    fn of(job: &Job) -> Self {
        Self {
            priority: job.priority,
            created_at: job.created_at,
            sequence: job.sequence,
            id: job.id,
        }
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// Pending jobs whose `run_at` has passed
    ready: BinaryHeap<ReadyEntry>,
    /// Pending jobs waiting for `run_at`, earliest first
    delayed: BinaryHeap<Reverse<(DateTime<Utc>, u64, JobId)>>,
    /// Dedupe key -> non-terminal job
    dedupe: HashMap<String, JobId>,
    next_sequence: u64,
    active: usize,
}

impl QueueState {
    fn schedule(&mut self, job: &Job, now: DateTime<Utc>) {
        if job.run_at <= now {
            self.ready.push(ReadyEntry::of(job));
        } else {
            self.delayed.push(Reverse((job.run_at, job.sequence, job.id)));
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse((run_at, _, id))) = self.delayed.peek().cloned() {
            if run_at > now {
                break;
            }
            self.delayed.pop();
            if let Some(job) = self.jobs.get(&id) {
                if job.status == JobStatus::Pending && job.run_at <= now {
                    self.ready.push(ReadyEntry::of(job));
                }
            }
        }
    }
}

/// In-process backend. One mutex guards all state, which makes claim and
/// compare-and-swap atomic with respect to each other.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    state: Mutex<QueueState>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn insert(&self, mut job: Job, max_size: usize) -> Result<InsertOutcome> {
        let mut state = self.state.lock();

        if let Some(key) = job.dedupe_key.as_deref() {
            if let Some(existing) = state.dedupe.get(key).and_then(|id| state.jobs.get(id)) {
                if !existing.status.is_terminal() {
                    return Ok(InsertOutcome::Existing(existing.clone()));
                }
            }
        }

        if max_size > 0 && state.active >= max_size {
            return Err(CoreError::new(ErrorCode::QueueFull, "Job queue is full")
                .with_context("max_size", max_size));
        }

        state.next_sequence += 1;
        job.sequence = state.next_sequence;

        if let Some(key) = job.dedupe_key.clone() {
            state.dedupe.insert(key, job.id);
        }
        let now = job.created_at;
        state.schedule(&job, now);
        state.active += 1;
        state.jobs.insert(job.id, job.clone());

        Ok(InsertOutcome::Inserted(job))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut state = self.state.lock();
        state.promote_due(now);

        while let Some(entry) = state.ready.pop() {
            let Some(job) = state.jobs.get_mut(&entry.id) else {
                continue;
            };
            // Entries can go stale when a job is re-queued with a later run_at.
            if !job.is_claimable_at(now) {
                continue;
            }
            job.mark_processing(now);
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn compare_and_swap(&self, expected: JobStatus, job: Job) -> Result<bool> {
        let mut state = self.state.lock();

        let Some(current) = state.jobs.get(&job.id) else {
            return Err(CoreError::not_found(
                ErrorCode::JobNotFound,
                "job",
                job.id.to_string(),
            ));
        };
        if current.status != expected {
            return Ok(false);
        }

        let was_terminal = current.status.is_terminal();
        if job.status.is_terminal() && !was_terminal {
            state.active = state.active.saturating_sub(1);
            if let Some(key) = job.dedupe_key.as_deref() {
                if state.dedupe.get(key) == Some(&job.id) {
                    state.dedupe.remove(key);
                }
            }
        }
        if job.status == JobStatus::Pending {
            // Always routed through the delayed heap; claim promotes it once due.
            state
                .delayed
                .push(Reverse((job.run_at, job.sequence, job.id)));
        }
        state.jobs.insert(job.id, job);
        Ok(true)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn counts(&self) -> Result<QueueMetrics> {
        let state = self.state.lock();
        let mut metrics = QueueMetrics::default();
        for job in state.jobs.values() {
            metrics.record(job.status);
        }
        Ok(metrics)
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock();
        let mut removed = 0;
        state.jobs.retain(|_, job| {
            let expired = job.status.is_terminal()
                && job.completed_at.unwrap_or(job.created_at) < before;
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempts at a compare-and-swap before reporting a conflict.
const CAS_RETRIES: usize = 5;

/// The job queue: owns every job state transition.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    config: Arc<QueueConfig>,
    work_available: Arc<Notify>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            work_available: Arc::new(Notify::new()),
        }
    }

    /// An in-memory queue with default configuration.
    pub fn in_memory() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// An in-memory queue with the given configuration.
    pub fn with_config(config: QueueConfig) -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new()), config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a pending job.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        priority: impl Into<JobPriority>,
        payload: serde_json::Value,
    ) -> Result<Job> {
        self.enqueue_job(NewJob::new(job_type, payload).with_priority(priority))
            .await
    }

    pub async fn enqueue_job(&self, request: NewJob) -> Result<Job> {
        self.enqueue_job_at(request, Utc::now()).await
    }

    pub async fn enqueue_job_at(&self, request: NewJob, now: DateTime<Utc>) -> Result<Job> {
        if request.job_type.trim().is_empty() {
            return Err(CoreError::validation("Job type must not be empty"));
        }

        let job = Job::from_request(request, self.config.retry.max_attempts, now);
        match self.backend.insert(job, self.config.max_size).await? {
            InsertOutcome::Inserted(job) => {
                JobMetrics::enqueued(&job.job_type, job.priority.value());
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    priority = job.priority.value(),
                    "Job enqueued"
                );
                self.work_available.notify_one();
                Ok(job)
            }
            InsertOutcome::Existing(job) => {
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    dedupe_key = ?job.dedupe_key,
                    "Job with same dedupe key already queued"
                );
                Ok(job)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Claim
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim the highest-priority ready job. Never blocks waiting for work.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        self.claim_next_at(Utc::now()).await
    }

    pub async fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let claimed = self.backend.claim_next(now).await?;
        if let Some(job) = &claimed {
            JobMetrics::claimed(&job.job_type);
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.current_attempt(),
                "Job claimed"
            );
        }
        Ok(claimed)
    }

    /// Wait until new work is enqueued or `timeout` elapses.
    ///
    /// Returns `true` if woken by an enqueue.
    pub async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.work_available.notified())
            .await
            .is_ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// `processing -> completed`. Completing a terminal job returns it unchanged.
    pub async fn complete(&self, id: JobId) -> Result<Job> {
        self.complete_at(id, Utc::now()).await
    }

    pub async fn complete_at(&self, id: JobId, now: DateTime<Utc>) -> Result<Job> {
        for _ in 0..CAS_RETRIES {
            let mut job = self.require(id).await?;
            match job.status {
                JobStatus::Processing => {}
                status if status.is_terminal() => return Ok(job),
                status => return Err(invalid_transition(id, status, JobStatus::Completed)),
            }

            job.mark_completed(now);
            if self
                .backend
                .compare_and_swap(JobStatus::Processing, job.clone())
                .await?
            {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    "Job completed"
                );
                return Ok(job);
            }
        }
        Err(cas_conflict(id))
    }

    /// Record a failed attempt using the queue's default backoff.
    pub async fn fail(&self, id: JobId, error: &JobError) -> Result<Job> {
        let backoff = self.config.retry.backoff.clone();
        self.fail_at(id, error, &backoff, Utc::now()).await
    }

    /// Record a failed attempt with a handler-specific backoff.
    pub async fn fail_with_backoff(
        &self,
        id: JobId,
        error: &JobError,
        backoff: &BackoffStrategy,
    ) -> Result<Job> {
        self.fail_at(id, error, backoff, Utc::now()).await
    }

    /// Increment `attempts`; retry after backoff if the error is retryable and
    /// attempts remain, otherwise fail terminally. No-op on terminal jobs.
    pub async fn fail_at(
        &self,
        id: JobId,
        error: &JobError,
        backoff: &BackoffStrategy,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        for _ in 0..CAS_RETRIES {
            let mut job = self.require(id).await?;
            match job.status {
                JobStatus::Processing => {}
                status if status.is_terminal() => return Ok(job),
                status => return Err(invalid_transition(id, status, JobStatus::Failed)),
            }

            let outcome = job.mark_attempt_failed(error, backoff, now);
            if !self
                .backend
                .compare_and_swap(JobStatus::Processing, job.clone())
                .await?
            {
                continue;
            }

            match outcome {
                FailOutcome::Retrying { run_at } => {
                    JobMetrics::retried(&job.job_type);
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts = job.attempts,
                        max_attempts = job.max_attempts,
                        retry_at = %run_at,
                        error = %error,
                        "Job attempt failed, will retry"
                    );
                }
                FailOutcome::Failed => {
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts = job.attempts,
                        retryable = error.retryable,
                        error = %error,
                        "Job failed permanently"
                    );
                }
                FailOutcome::Ignored => {}
            }
            return Ok(job);
        }
        Err(cas_conflict(id))
    }

    /// Treat processing jobs claimed longer ago than `lease` as failed attempts.
    ///
    /// Returns the jobs that were recovered.
    pub async fn recover_stalled(&self, lease: Duration) -> Result<Vec<Job>> {
        self.recover_stalled_at(lease, Utc::now()).await
    }

    pub async fn recover_stalled_at(&self, lease: Duration, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| CoreError::validation(format!("Invalid lease: {}", e)))?;
        let cutoff = now - lease;
        let error = JobError::retryable("worker lease expired").with_code("LEASE_EXPIRED");
        let backoff = self.config.retry.backoff.clone();

        let mut recovered = Vec::new();
        for mut job in self.backend.list(&JobFilter::status(JobStatus::Processing)).await? {
            let stalled = job.claimed_at.or(job.processed_at).map_or(false, |at| at <= cutoff);
            if !stalled {
                continue;
            }
            job.mark_attempt_failed(&error, &backoff, now);
            if self
                .backend
                .compare_and_swap(JobStatus::Processing, job.clone())
                .await?
            {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    status = %job.status,
                    "Recovered stalled job"
                );
                recovered.push(job);
            }
        }

        if !recovered.is_empty() {
            self.work_available.notify_one();
        }
        Ok(recovered)
    }

    /// Drop completed and failed jobs that finished more than `older_than` ago.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<usize> {
        self.purge_terminal_at(older_than, Utc::now()).await
    }

    pub async fn purge_terminal_at(&self, older_than: Duration, now: DateTime<Utc>) -> Result<usize> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| CoreError::validation(format!("Invalid retention: {}", e)))?;
        let removed = self.backend.purge_terminal(now - older_than).await?;
        if removed > 0 {
            info!(removed, "Purged finished jobs");
        }
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.backend.get(id).await
    }

    /// Jobs newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let filter = JobFilter {
            status,
            job_type: None,
            limit: Some(limit),
        };
        self.backend.list(&filter).await
    }

    /// Job counts by status, counted from current job state.
    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let metrics = self.backend.counts().await?;
        JobMetrics::queue_depth("pending", metrics.pending);
        JobMetrics::queue_depth("processing", metrics.processing);
        JobMetrics::queue_depth("completed", metrics.completed);
        JobMetrics::queue_depth("failed", metrics.failed);
        Ok(metrics)
    }

    /// Statistics over the `limit` most recent jobs of one type.
    pub async fn processing_stats(&self, job_type: &str, limit: usize) -> Result<ProcessingStats> {
        let jobs = self
            .backend
            .list(&JobFilter::job_type(job_type).with_limit(limit))
            .await?;

        let timings: Vec<f64> = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .filter_map(|job| job.processing_time())
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();
        let average_processing_secs = if timings.is_empty() {
            0.0
        } else {
            timings.iter().sum::<f64>() / timings.len() as f64
        };

        Ok(ProcessingStats {
            job_type: job_type.to_string(),
            total: jobs.len(),
            completed: jobs.iter().filter(|j| j.status == JobStatus::Completed).count(),
            failed: jobs.iter().filter(|j| j.status == JobStatus::Failed).count(),
            average_processing_secs,
            last_created_at: jobs.first().map(|job| job.created_at),
        })
    }

    async fn require(&self, id: JobId) -> Result<Job> {
        self.backend
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found(ErrorCode::JobNotFound, "job", id.to_string()))
    }
}

fn invalid_transition(id: JobId, from: JobStatus, to: JobStatus) -> CoreError {
    CoreError::new(
        ErrorCode::InvalidStateTransition,
        format!("Job {} cannot move from {} to {}", id, from, to),
    )
    .with_context("from", from)
    .with_context("to", to)
}

fn cas_conflict(id: JobId) -> CoreError {
    CoreError::with_internal(
        ErrorCode::InvalidStateTransition,
        "Job was modified concurrently",
        format!("compare-and-swap kept failing for job {}", id),
    )
}
