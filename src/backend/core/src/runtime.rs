//! Explicitly constructed job runtime.
//!
//! `JobRuntime` owns one instance of every component (queue, handler
//! registry, rate limiter, scheduler, dispatcher, readiness) and the
//! background tasks that drive them. Nothing is global: two runtimes in one
//! process are fully independent.
//!
//! # Example
//!
//! ```rust,ignore
//! use amoeba_core::{Config, JobRuntime};
//! use amoeba_core::jobs::FnHandler;
//!
//! let runtime = JobRuntime::builder(Config::load()?)
//!     .handler(FnHandler::new("generate", |ctx| async move { generate(ctx).await }))
//!     .oracle(content_exists_oracle)
//!     .build()
//!     .await?;
//!
//! runtime.start();
//! // ...
//! runtime.stop().await;
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::admission::{ClientIdentity, CleanupHandle, RateLimitStore, RateLimitTier, RateLimiter};
use crate::config::Config;
use crate::error::{CoreError, ErrorCode, Result};
use crate::health::{ReadinessCheck, ReadinessService, ScheduleHealthCheck};
use crate::jobs::{
    DispatcherHandle, HandlerRegistry, HandlerRegistryBuilder, Job, JobDispatcher, JobHandler,
    JobPriority, JobQueue, NewJob, QueueBackend, WorkerStatsSnapshot,
};
use crate::scheduler::{IdempotencyOracle, JobScheduler, NeverComplete};

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

pub struct JobRuntimeBuilder {
    config: Config,
    handlers: HandlerRegistryBuilder,
    oracle: Option<Arc<dyn IdempotencyOracle>>,
    checks: Vec<Arc<dyn ReadinessCheck>>,
    queue_backend: Option<Arc<dyn QueueBackend>>,
    rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    submit_tier: RateLimitTier,
}

impl JobRuntimeBuilder {
    pub fn handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers = self.handlers.register(handler);
        self
    }

    pub fn handler_arc(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers = self.handlers.register_arc(handler);
        self
    }

    /// Completion check consulted by the scheduler. Defaults to
    /// [`NeverComplete`].
    pub fn oracle<O: IdempotencyOracle + 'static>(mut self, oracle: O) -> Self {
        self.oracle = Some(Arc::new(oracle));
        self
    }

    pub fn oracle_arc(mut self, oracle: Arc<dyn IdempotencyOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Extra readiness signal, e.g. credentials or storage reachability.
    pub fn readiness_check<C: ReadinessCheck + 'static>(mut self, check: C) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Job store; in-memory by default.
    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.queue_backend = Some(backend);
        self
    }

    /// Rate limit store; taken from config (Redis or in-memory) by default.
    pub fn rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limit_store = Some(store);
        self
    }

    /// Tier applied by [`JobRuntime::submit`]. Defaults to strict.
    pub fn submit_tier(mut self, tier: RateLimitTier) -> Self {
        self.submit_tier = tier;
        self
    }

    pub async fn build(self) -> Result<JobRuntime> {
        self.config.validate()?;
        let config = self.config;

        let registry = Arc::new(self.handlers.build()?);

        let queue = match self.queue_backend {
            Some(backend) => JobQueue::new(backend, config.queue.clone()),
            None => JobQueue::with_config(config.queue.clone()),
        };

        let rate_limiter = match self.rate_limit_store {
            Some(store) => RateLimiter::with_store(config.effective_rate_limit(), store),
            None => RateLimiter::from_config(config.effective_rate_limit()).await?,
        };

        let oracle = self.oracle.unwrap_or_else(|| Arc::new(NeverComplete));
        let scheduler = JobScheduler::with_registry(
            queue.clone(),
            oracle,
            registry.clone(),
            config.scheduler.clone(),
        );

        let dispatcher = JobDispatcher::new(queue.clone(), registry.clone(), config.dispatcher.clone());

        let mut readiness = ReadinessService::new(queue.clone(), config.readiness.clone())
            .with_check(ScheduleHealthCheck::new(scheduler.clone()));
        for check in self.checks {
            readiness.register(check);
        }

        info!(
            service = %config.service_name,
            handlers = ?registry.types(),
            rate_limit_backend = rate_limiter.backend(),
            "Job runtime built"
        );

        Ok(JobRuntime {
            config,
            registry,
            queue,
            rate_limiter,
            scheduler,
            dispatcher,
            readiness: Arc::new(readiness),
            submit_tier: self.submit_tier,
            tasks: Mutex::new(None),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runtime
// ═══════════════════════════════════════════════════════════════════════════════

struct RuntimeTasks {
    scheduler: crate::scheduler::SchedulerHandle,
    dispatcher: DispatcherHandle,
    cleanup: CleanupHandle,
}

pub struct JobRuntime {
    config: Config,
    registry: Arc<HandlerRegistry>,
    queue: JobQueue,
    rate_limiter: RateLimiter,
    scheduler: JobScheduler,
    dispatcher: JobDispatcher,
    readiness: Arc<ReadinessService>,
    submit_tier: RateLimitTier,
    tasks: Mutex<Option<RuntimeTasks>>,
}

impl JobRuntime {
    pub fn builder(config: Config) -> JobRuntimeBuilder {
        JobRuntimeBuilder {
            config,
            handlers: HandlerRegistry::builder(),
            oracle: None,
            checks: Vec::new(),
            queue_backend: None,
            rate_limit_store: None,
            submit_tier: RateLimitTier::strict(),
        }
    }

    /// Admit and enqueue a caller's job.
    ///
    /// Denied callers get `RateLimitExceeded` and nothing is queued; unknown
    /// job types are a configuration error.
    pub async fn submit(
        &self,
        caller: &ClientIdentity,
        job_type: &str,
        priority: impl Into<JobPriority>,
        payload: serde_json::Value,
    ) -> Result<Job> {
        self.rate_limiter.check(&self.submit_tier, caller).await?;

        if !self.registry.contains(job_type) {
            return Err(CoreError::new(
                ErrorCode::HandlerNotRegistered,
                format!("No handler registered for job type '{}'", job_type),
            )
            .with_context("job_type", job_type));
        }

        let mut request = NewJob::new(job_type, payload).with_priority(priority);
        if let Some(policy) = self.registry.retry_policy_for(job_type) {
            request = request.with_max_attempts(policy.max_attempts);
        }
        self.queue.enqueue_job(request).await
    }

    /// Spawn the scheduler, dispatcher and limiter cleanup. Calling it on a
    /// running runtime does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            warn!("Job runtime already started");
            return;
        }

        *tasks = Some(RuntimeTasks {
            scheduler: self.scheduler.start(),
            dispatcher: self.dispatcher.clone().start(),
            cleanup: self.rate_limiter.start_cleanup(),
        });
        info!(service = %self.config.service_name, "Job runtime started");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Stop every background task. Returns `false` when in-flight jobs did
    /// not finish within the dispatcher's shutdown timeout.
    pub async fn stop(&self) -> bool {
        let Some(tasks) = self.tasks.lock().take() else {
            return true;
        };

        tasks.scheduler.stop().await;
        let drained = tasks.dispatcher.stop().await;
        tasks.cleanup.stop().await;

        info!(drained, "Job runtime stopped");
        drained
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn readiness(&self) -> &Arc<ReadinessService> {
        &self.readiness
    }

    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.dispatcher.stats().snapshot()
    }
}
