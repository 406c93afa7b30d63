//! Worker dispatcher: drains the queue through registered handlers.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::job::{Job, JobContext, JobError, JobStatus};
use super::queue::JobQueue;
use super::registry::HandlerRegistry;
use crate::error::Result;
use crate::telemetry::JobMetrics;

/// Configuration for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of concurrent worker loops
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long an idle worker sleeps before polling again
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long `join` waits for in-flight handlers
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// How often abandoned `processing` jobs are recovered
    #[serde(default = "default_recovery_interval", with = "humantime_serde")]
    pub recovery_interval: Duration,

    /// Worker name used in logs
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_recovery_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_name() -> String {
    "amoeba-worker".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            recovery_interval: default_recovery_interval(),
            name: default_name(),
        }
    }
}

/// Counters shared by every worker loop of a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Attempts executed (including no-handler failures)
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Attempts that ended the job in terminal `failed`
    pub failed: Arc<AtomicU64>,
    /// Attempts that failed and were re-queued
    pub retried: Arc<AtomicU64>,
    /// Handlers running right now
    pub active: Arc<AtomicU64>,
}

/// Plain copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub active: u64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            retried: self.retried(),
            active: self.active(),
        }
    }
}

/// Decrements `active` when the attempt ends, including on early return.
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// How one dispatched attempt ended.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Completed(Job),
    /// Failed and returned to `pending` for a later attempt
    Retrying(Job),
    /// Failed terminally
    Failed(Job),
}

impl DispatchOutcome {
    pub fn job(&self) -> &Job {
        match self {
            Self::Completed(job) | Self::Retrying(job) | Self::Failed(job) => job,
        }
    }

    fn from_failed(job: Job) -> Self {
        if job.status == JobStatus::Failed {
            Self::Failed(job)
        } else {
            Self::Retrying(job)
        }
    }
}

/// Claims jobs and runs them through the handler registry.
#[derive(Clone)]
pub struct JobDispatcher {
    queue: JobQueue,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    stats: WorkerStats,
}

impl JobDispatcher {
    pub fn new(queue: JobQueue, registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim and execute one job. `None` when nothing is ready.
    pub async fn run_once(&self) -> Result<Option<DispatchOutcome>> {
        match self.queue.claim_next().await? {
            Some(job) => self.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one attempt of an already-claimed job and record the outcome.
    pub async fn execute(&self, job: Job) -> Result<DispatchOutcome> {
        let _active = ActiveGuard::enter(&self.stats.active);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.registry.get(&job.job_type) else {
            let error = JobError::no_handler(&job.job_type);
            error!(job_id = %job.id, job_type = %job.job_type, "No handler registered");
            let job = self.queue.fail(job.id, &error).await?;
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::failed(&job.job_type, 0.0);
            return Ok(DispatchOutcome::Failed(job));
        };

        let ctx = JobContext::new(job.clone());
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = ctx.attempt(),
        );

        let started = Instant::now();
        let result = AssertUnwindSafe(handler.handle(&ctx))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| {
                Err(JobError::retryable(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))
                .with_code("HANDLER_PANIC"))
            });
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                let job = self.queue.complete(job.id).await?;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                JobMetrics::completed(&job.job_type, elapsed);
                Ok(DispatchOutcome::Completed(job))
            }
            Err(error) => {
                let job = match handler.retry_policy() {
                    Some(policy) => {
                        self.queue
                            .fail_with_backoff(job.id, &error, &policy.backoff)
                            .await?
                    }
                    None => self.queue.fail(job.id, &error).await?,
                };
                let outcome = DispatchOutcome::from_failed(job);
                match &outcome {
                    DispatchOutcome::Failed(job) => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        JobMetrics::failed(&job.job_type, elapsed);
                    }
                    _ => {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(outcome)
            }
        }
    }

    /// Drain every job that is ready now, sequentially. Returns the outcomes.
    pub async fn drain(&self) -> Result<Vec<DispatchOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Spawn `concurrency` worker loops plus the stalled-job recovery loop.
    pub fn start(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = self.config.concurrency.max(1);

        info!(
            worker = %self.config.name,
            concurrency,
            handlers = ?self.registry.types(),
            "Job dispatcher started"
        );

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for index in 0..concurrency {
            tasks.push(tokio::spawn(
                worker_loop(self.clone(), index, shutdown_rx.clone()),
            ));
        }
        tasks.push(tokio::spawn(recovery_loop(self.clone(), shutdown_rx)));

        DispatcherHandle {
            shutdown: shutdown_tx,
            tasks,
            stats: self.stats.clone(),
            shutdown_timeout: self.config.shutdown_timeout,
            name: self.config.name,
        }
    }
}

async fn worker_loop(dispatcher: JobDispatcher, index: usize, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = dispatcher.config.poll_interval;
    debug!(worker = %dispatcher.config.name, index, "Worker loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match dispatcher.run_once().await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                e.log();
                true
            }
        };
        if !idle {
            continue;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = dispatcher.queue.wait_for_work(poll_interval) => {}
        }
    }

    debug!(worker = %dispatcher.config.name, index, "Worker loop stopped");
}

async fn recovery_loop(dispatcher: JobDispatcher, mut shutdown: watch::Receiver<bool>) {
    let lease = dispatcher.queue.config().stalled_lease;
    let retention = dispatcher.queue.config().terminal_retention;
    let mut interval = tokio::time::interval(dispatcher.config.recovery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                match dispatcher.queue.recover_stalled(lease).await {
                    Ok(recovered) if !recovered.is_empty() => {
                        warn!(count = recovered.len(), "Recovered stalled jobs");
                    }
                    Ok(_) => {}
                    Err(e) => e.log(),
                }
                if let Some(retention) = retention {
                    if let Err(e) = dispatcher.queue.purge_terminal(retention).await {
                        e.log();
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle for a running dispatcher.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: WorkerStats,
    shutdown_timeout: Duration,
    name: String,
}

impl DispatcherHandle {
    /// Stop claiming new jobs. In-flight handlers run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for worker loops to exit, up to the shutdown timeout.
    ///
    /// Returns `false` if the timeout elapsed; remaining handlers keep running detached.
    pub async fn join(self) -> bool {
        let all = futures::future::join_all(self.tasks);
        match tokio::time::timeout(self.shutdown_timeout, all).await {
            Ok(_) => {
                info!(worker = %self.name, "Job dispatcher stopped");
                true
            }
            Err(_) => {
                warn!(
                    worker = %self.name,
                    active = self.stats.active(),
                    timeout = ?self.shutdown_timeout,
                    "Dispatcher shutdown timed out with handlers still running"
                );
                false
            }
        }
    }

    /// `shutdown` followed by `join`.
    pub async fn stop(self) -> bool {
        self.shutdown();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_config_default() {
        let config = DispatcherConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_dispatcher_config_humantime() {
        let config: DispatcherConfig =
            serde_json::from_str(r#"{"concurrency": 2, "poll_interval": "250ms"}"#).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.name, "amoeba-worker");
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.snapshot(), WorkerStatsSnapshot::default());

        stats.processed.fetch_add(1, Ordering::Relaxed);
        {
            let _guard = ActiveGuard::enter(&stats.active);
            assert_eq!(stats.active(), 1);
        }
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.processed(), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
