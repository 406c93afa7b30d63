//! Cron scheduler: turns recurring schedules into queued jobs.
//!
//! On every tick each active schedule is checked for a due occurrence. A due
//! period is first put to the [`IdempotencyOracle`]; work that already exists
//! is skipped, otherwise a job is enqueued with a dedupe key derived from the
//! target and period. Errors are recorded on the schedule that caused them and
//! never stop evaluation of the others.
//!
//! Besides the tick loop the scheduler offers:
//!
//! - `catch_up`: eager evaluation of the current and next periods on startup
//! - `trigger`: manual run of one schedule, bypassing due-ness
//! - `backfill`: low-priority jobs for every incomplete period in a range

pub mod cron;
pub mod oracle;
pub mod schedule;

pub use cron::{next_due_time, parse_timezone, CronExpression, Occurrences};
pub use oracle::{FnOracle, IdempotencyOracle, InMemoryOracle, NeverComplete};
pub use schedule::{
    NewSchedule, Period, ScheduleId, ScheduleStatus, ScheduleSummary, ScheduleTarget, ScheduledJob,
};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{HandlerRegistry, Job, JobId, JobPriority, JobQueue, NewJob};
use crate::telemetry::ScheduleMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between due-checks
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Periods evaluated by `catch_up`: the current one plus the following ones
    #[serde(default = "default_lookahead_periods")]
    pub lookahead_periods: usize,

    /// Run `catch_up` when the scheduler loop starts
    #[serde(default = "default_catch_up_on_start")]
    pub catch_up_on_start: bool,

    /// Upper bound on periods examined by one backfill call
    #[serde(default = "default_max_backfill_periods")]
    pub max_backfill_periods: usize,

    /// How far back `catch_up` and `trigger` look for the current period
    #[serde(default = "default_period_lookback", with = "humantime_serde")]
    pub period_lookback: Duration,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_lookahead_periods() -> usize {
    2
}

fn default_catch_up_on_start() -> bool {
    true
}

fn default_max_backfill_periods() -> usize {
    1000
}

fn default_period_lookback() -> Duration {
    Duration::from_secs(400 * 24 * 60 * 60)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            lookahead_periods: default_lookahead_periods(),
            catch_up_on_start: default_catch_up_on_start(),
            max_backfill_periods: default_max_backfill_periods(),
            period_lookback: default_period_lookback(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// A schedule that failed to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleError {
    pub schedule_id: ScheduleId,
    pub name: String,
    pub message: String,
}

/// Result of one tick or catch-up pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Active schedules examined
    pub evaluated: usize,
    pub not_due: usize,
    pub enqueued: Vec<JobId>,
    /// Schedules whose due period was already complete
    pub skipped: Vec<ScheduleId>,
    pub errors: Vec<ScheduleError>,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        self.enqueued.is_empty() && self.errors.is_empty()
    }
}

/// Result of a manual trigger.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub period: Period,
    /// `None` when the oracle reported the period complete
    pub job: Option<Job>,
}

/// Result of a backfill call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub periods_checked: usize,
    pub enqueued: Vec<JobId>,
    pub already_complete: usize,
    /// `"<period>: <message>"` per failed period
    pub errors: Vec<String>,
    /// Stopped at `max_backfill_periods`
    pub truncated: bool,
}

enum RunOutcome {
    Enqueued(Job),
    AlreadyComplete,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

struct Inner {
    queue: JobQueue,
    oracle: Arc<dyn IdempotencyOracle>,
    registry: Option<Arc<HandlerRegistry>>,
    config: SchedulerConfig,
    schedules: RwLock<Vec<ScheduledJob>>,
}

/// Evaluates schedules and enqueues due work.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(queue: JobQueue, oracle: Arc<dyn IdempotencyOracle>, config: SchedulerConfig) -> Self {
        Self::build(queue, oracle, None, config)
    }

    /// A scheduler that validates target job types against `registry` and
    /// applies handler retry policies to the jobs it creates.
    pub fn with_registry(
        queue: JobQueue,
        oracle: Arc<dyn IdempotencyOracle>,
        registry: Arc<HandlerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self::build(queue, oracle, Some(registry), config)
    }

    fn build(
        queue: JobQueue,
        oracle: Arc<dyn IdempotencyOracle>,
        registry: Option<Arc<HandlerRegistry>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                oracle,
                registry,
                config,
                schedules: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Schedule management
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate and register a schedule.
    pub async fn add(&self, request: NewSchedule) -> Result<ScheduledJob> {
        self.add_at(request, Utc::now()).await
    }

    pub async fn add_at(&self, request: NewSchedule, now: DateTime<Utc>) -> Result<ScheduledJob> {
        if request.name.trim().is_empty() {
            return Err(CoreError::validation("Schedule name must not be empty"));
        }
        CronExpression::parse(&request.cron_expression)?;
        parse_timezone(&request.timezone)?;
        if let Some(registry) = &self.inner.registry {
            registry.ensure_registered(&[request.target.job_type.as_str()])?;
        }

        let schedule = request.into_scheduled(now);
        info!(
            schedule_id = %schedule.id,
            schedule = %schedule.name,
            cron = %schedule.cron_expression,
            timezone = %schedule.timezone,
            job_type = %schedule.target.job_type,
            "Schedule added"
        );
        self.inner.schedules.write().await.push(schedule.clone());
        Ok(schedule)
    }

    /// Load a persisted schedule as-is. Invalid definitions surface as
    /// evaluation errors on the schedule rather than here.
    pub async fn restore(&self, schedule: ScheduledJob) {
        let mut schedules = self.inner.schedules.write().await;
        match schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => schedules.push(schedule),
        }
    }

    pub async fn set_active(&self, id: ScheduleId, active: bool) -> Result<ScheduledJob> {
        let updated = self
            .update(id, |s| s.is_active = active)
            .await
            .ok_or_else(|| not_found(id))?;
        info!(schedule_id = %id, active, "Schedule activation changed");
        Ok(updated)
    }

    pub async fn remove(&self, id: ScheduleId) -> Result<ScheduledJob> {
        let mut schedules = self.inner.schedules.write().await;
        let index = schedules
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| not_found(id))?;
        Ok(schedules.remove(index))
    }

    pub async fn get(&self, id: ScheduleId) -> Option<ScheduledJob> {
        self.inner
            .schedules
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<ScheduledJob> {
        self.inner.schedules.read().await.clone()
    }

    pub async fn summary(&self) -> ScheduleSummary {
        ScheduleSummary::from_schedules(self.inner.schedules.read().await.iter())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Evaluate every active schedule against `now`.
    ///
    /// Only the latest due occurrence of a schedule is enqueued; older missed
    /// periods are left to `backfill`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for schedule in self.active_snapshot().await {
            report.evaluated += 1;

            let Some((cron, tz)) = self.compile(&schedule, &mut report).await else {
                continue;
            };

            let due = cron
                .latest_between(schedule.evaluated_through(), now, tz)
                .or(schedule.pending_period.filter(|p| *p <= now));
            let Some(start) = due else {
                report.not_due += 1;
                continue;
            };

            let period = Period::new(start, tz);
            match self
                .run_period(&schedule, &period, schedule.target.priority, now)
                .await
            {
                Ok(outcome) => {
                    self.update(schedule.id, |s| {
                        s.advance_period(start);
                        s.record_success(now);
                    })
                    .await;
                    record_outcome(&schedule, &period, outcome, &mut report);
                }
                Err(e) => self.record_error(&schedule, &period, e, now, &mut report).await,
            }
        }

        report
    }

    /// Evaluate the current period and the next ones for every active schedule.
    ///
    /// Upcoming periods enqueued here are remembered, so the tick that later
    /// reaches them does not enqueue them again. Periods already handled are
    /// not re-evaluated. The first failing period stops the pass for that
    /// schedule; a failed current period is retried by the next tick.
    pub async fn catch_up(&self) -> TickReport {
        self.catch_up_at(Utc::now()).await
    }

    pub async fn catch_up_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let lookahead = self.inner.config.lookahead_periods;
        if lookahead == 0 {
            return report;
        }

        for schedule in self.active_snapshot().await {
            report.evaluated += 1;

            let Some((cron, tz)) = self.compile(&schedule, &mut report).await else {
                continue;
            };

            let current = cron.current_period(now, self.lookback(), tz);
            let mut periods: Vec<DateTime<Utc>> = current.into_iter().collect();
            let mut cursor = now;
            while periods.len() < lookahead {
                match cron.next_after(cursor, tz) {
                    Some(next) => {
                        periods.push(next);
                        cursor = next;
                    }
                    None => break,
                }
            }

            let handled = schedule.handled_through();
            let mut current_done = false;
            let mut ahead = None;
            let mut failed = None;
            for start in periods {
                if handled.map_or(false, |h| start <= h) {
                    continue;
                }
                let period = Period::new(start, tz);
                match self
                    .run_period(&schedule, &period, schedule.target.priority, now)
                    .await
                {
                    Ok(outcome) => {
                        record_outcome(&schedule, &period, outcome, &mut report);
                        if start > now {
                            ahead = Some(start);
                        } else {
                            current_done = true;
                        }
                    }
                    Err(e) => {
                        self.record_error(&schedule, &period, e, now, &mut report).await;
                        failed = Some(start);
                        break;
                    }
                }
            }

            self.update(schedule.id, |s| {
                if let Some(current) = current {
                    if current_done {
                        s.advance_period(current);
                    } else if failed == Some(current) {
                        s.pending_period = Some(current);
                    }
                }
                if let Some(ahead) = ahead {
                    s.advance_scheduled_through(ahead);
                }
                if failed.is_none() {
                    s.record_success(now);
                }
            })
            .await;
        }

        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admin operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a schedule's current period now. Works on inactive schedules.
    pub async fn trigger(&self, id: ScheduleId) -> Result<TriggerOutcome> {
        self.trigger_at(id, Utc::now()).await
    }

    pub async fn trigger_at(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<TriggerOutcome> {
        let schedule = self.get(id).await.ok_or_else(|| not_found(id))?;
        let (cron, tz) = self.compile_strict(&schedule).await?;

        let current = cron.current_period(now, self.lookback(), tz);
        let period = Period::new(current.unwrap_or(now), tz);

        info!(schedule_id = %id, schedule = %schedule.name, period = %period.key(), "Manual trigger");

        match self
            .run_period(&schedule, &period, schedule.target.priority, now)
            .await
        {
            Ok(outcome) => {
                self.update(id, |s| {
                    if let Some(current) = current {
                        s.advance_period(current);
                    }
                    s.record_success(now);
                })
                .await;
                let job = match outcome {
                    RunOutcome::Enqueued(job) => Some(job),
                    RunOutcome::AlreadyComplete => None,
                };
                Ok(TriggerOutcome { period, job })
            }
            Err(e) => {
                let message = e.user_message().to_string();
                self.update(id, |s| s.record_failure(now, message)).await;
                Err(e)
            }
        }
    }

    /// Enqueue low-priority jobs for every incomplete period in `[from, to]`.
    ///
    /// Does not move the schedule's `last_period`.
    pub async fn backfill(
        &self,
        id: ScheduleId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BackfillReport> {
        self.backfill_at(id, from, to, Utc::now()).await
    }

    pub async fn backfill_at(
        &self,
        id: ScheduleId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BackfillReport> {
        if from > to {
            return Err(CoreError::validation("Backfill range start is after its end")
                .with_context("from", from)
                .with_context("to", to));
        }

        let schedule = self.get(id).await.ok_or_else(|| not_found(id))?;
        let (cron, tz) = self.compile_strict(&schedule).await?;
        let mut report = BackfillReport::default();

        for start in cron.occurrences(from, to, tz) {
            if report.periods_checked >= self.inner.config.max_backfill_periods {
                report.truncated = true;
                break;
            }
            report.periods_checked += 1;

            let period = Period::new(start, tz);
            match self
                .run_period(&schedule, &period, JobPriority::BACKFILL, now)
                .await
            {
                Ok(RunOutcome::Enqueued(job)) => report.enqueued.push(job.id),
                Ok(RunOutcome::AlreadyComplete) => report.already_complete += 1,
                Err(e) => report
                    .errors
                    .push(format!("{}: {}", period.key(), e.user_message())),
            }
        }

        ScheduleMetrics::backfill_enqueued(&schedule.name, report.enqueued.len() as u64);
        info!(
            schedule_id = %id,
            schedule = %schedule.name,
            periods = report.periods_checked,
            enqueued = report.enqueued.len(),
            already_complete = report.already_complete,
            errors = report.errors.len(),
            truncated = report.truncated,
            "Backfill finished"
        );

        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the tick loop (after an optional catch-up pass).
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();

        let task = tokio::spawn(async move {
            let config = scheduler.inner.config.clone();
            info!(tick_interval = ?config.tick_interval, "Scheduler started");

            if config.catch_up_on_start {
                let report = scheduler.catch_up().await;
                info!(
                    evaluated = report.evaluated,
                    enqueued = report.enqueued.len(),
                    errors = report.errors.len(),
                    "Scheduler catch-up complete"
                );
            }

            let mut interval = tokio::time::interval(config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let report = scheduler.tick().await;
                        if !report.is_quiet() {
                            info!(
                                evaluated = report.evaluated,
                                enqueued = report.enqueued.len(),
                                skipped = report.skipped.len(),
                                errors = report.errors.len(),
                                "Scheduler tick"
                            );
                        }
                    }
                }
            }

            info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn active_snapshot(&self) -> Vec<ScheduledJob> {
        self.inner
            .schedules
            .read()
            .await
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    fn lookback(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.config.period_lookback)
            .unwrap_or_else(|_| chrono::Duration::days(400))
    }

    /// Parse cron and timezone, recording a failure on the schedule.
    async fn compile(
        &self,
        schedule: &ScheduledJob,
        report: &mut TickReport,
    ) -> Option<(CronExpression, Tz)> {
        match self.compile_strict(schedule).await {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                report.errors.push(ScheduleError {
                    schedule_id: schedule.id,
                    name: schedule.name.clone(),
                    message: e.user_message().to_string(),
                });
                None
            }
        }
    }

    async fn compile_strict(&self, schedule: &ScheduledJob) -> Result<(CronExpression, Tz)> {
        let compiled = CronExpression::parse(&schedule.cron_expression)
            .and_then(|cron| parse_timezone(&schedule.timezone).map(|tz| (cron, tz)));

        if let Err(e) = &compiled {
            warn!(
                schedule_id = %schedule.id,
                schedule = %schedule.name,
                error = %e,
                "Schedule definition is invalid"
            );
            ScheduleMetrics::evaluated(&schedule.name, "error");
            let message = e.user_message().to_string();
            self.update(schedule.id, |s| s.record_invalid(message)).await;
        }
        compiled
    }

    async fn run_period(
        &self,
        schedule: &ScheduledJob,
        period: &Period,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let target = &schedule.target;

        if self.inner.oracle.is_complete(target, period).await? {
            debug!(
                schedule_id = %schedule.id,
                schedule = %schedule.name,
                period = %period.key(),
                "Period already complete, skipping"
            );
            return Ok(RunOutcome::AlreadyComplete);
        }

        let mut request = NewJob::new(
            target.job_type.clone(),
            target.payload_for(Some(schedule.id), period),
        )
        .with_priority(priority)
        .with_dedupe_key(target.dedupe_key(period));

        if let Some(policy) = self
            .inner
            .registry
            .as_ref()
            .and_then(|r| r.retry_policy_for(&target.job_type))
        {
            request = request.with_max_attempts(policy.max_attempts);
        }

        let job = self.inner.queue.enqueue_job_at(request, now).await?;
        info!(
            schedule_id = %schedule.id,
            schedule = %schedule.name,
            period = %period.key(),
            job_id = %job.id,
            priority = job.priority.value(),
            "Scheduled job enqueued"
        );
        Ok(RunOutcome::Enqueued(job))
    }

    async fn record_error(
        &self,
        schedule: &ScheduledJob,
        period: &Period,
        error: CoreError,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        warn!(
            schedule_id = %schedule.id,
            schedule = %schedule.name,
            period = %period.key(),
            error = %error,
            "Schedule evaluation failed"
        );
        ScheduleMetrics::evaluated(&schedule.name, "error");

        let message = error.user_message().to_string();
        self.update(schedule.id, |s| s.record_failure(now, message.clone()))
            .await;
        report.errors.push(ScheduleError {
            schedule_id: schedule.id,
            name: schedule.name.clone(),
            message,
        });
    }

    async fn update(
        &self,
        id: ScheduleId,
        apply: impl FnOnce(&mut ScheduledJob),
    ) -> Option<ScheduledJob> {
        let mut schedules = self.inner.schedules.write().await;
        let schedule = schedules.iter_mut().find(|s| s.id == id)?;
        apply(schedule);
        Some(schedule.clone())
    }
}

fn record_outcome(schedule: &ScheduledJob, period: &Period, outcome: RunOutcome, report: &mut TickReport) {
    match outcome {
        RunOutcome::Enqueued(job) => {
            ScheduleMetrics::evaluated(&schedule.name, "enqueued");
            report.enqueued.push(job.id);
        }
        RunOutcome::AlreadyComplete => {
            ScheduleMetrics::evaluated(&schedule.name, "skipped");
            debug!(schedule = %schedule.name, period = %period.key(), "Skipped complete period");
            report.skipped.push(schedule.id);
        }
    }
}

fn not_found(id: ScheduleId) -> CoreError {
    CoreError::not_found(ErrorCode::ScheduleNotFound, "schedule", id.to_string())
}

/// Handle for the scheduler's background loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the loop to exit. An in-progress tick finishes first.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }

    pub async fn stop(self) {
        self.shutdown();
        self.join().await
    }
}
