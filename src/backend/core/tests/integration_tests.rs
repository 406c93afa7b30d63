//! End-to-end tests through `JobRuntime`.
//!
//! These wire every component together the way an embedding service would:
//! handlers and an oracle registered on the builder, work admitted through
//! `submit`, schedules evaluated into the shared queue and drained by the
//! dispatcher.

use amoeba_core::admission::{ClientIdentity, RateLimitRule, RateLimitTier};
use amoeba_core::error::ErrorCode;
use amoeba_core::health::{FnCheck, HealthCheck, HealthStatus};
use amoeba_core::jobs::{
    DispatchOutcome, FnHandler, JobError, JobPriority, JobStatus, RetryPolicy,
};
use amoeba_core::scheduler::{InMemoryOracle, NewSchedule};
use amoeba_core::{Config, JobRuntime};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn runtime_with_recorder() -> (JobRuntime, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    let runtime = JobRuntime::builder(Config::default())
        .handler(FnHandler::new("report", move |ctx| {
            let recorder = recorder.clone();
            async move {
                let name = ctx.payload_str("name").unwrap_or("?").to_string();
                recorder.lock().push(name);
                Ok(())
            }
        }))
        .submit_tier(RateLimitTier::new("submit", RateLimitRule::per_minute(100)))
        .build()
        .await
        .unwrap();

    (runtime, seen)
}

// ============================================================================
// Submission Tests
// ============================================================================

#[tokio::test]
async fn test_high_priority_submission_runs_first() {
    let (runtime, seen) = runtime_with_recorder().await;
    let caller = ClientIdentity::new("10.0.0.1");

    runtime
        .submit(&caller, "report", 1, json!({"name": "bulk"}))
        .await
        .unwrap();
    runtime
        .submit(&caller, "report", 10, json!({"name": "live"}))
        .await
        .unwrap();

    let outcomes = runtime.dispatcher().drain().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(*seen.lock(), vec!["live".to_string(), "bulk".to_string()]);
    assert_eq!(runtime.worker_stats().succeeded, 2);
}

#[tokio::test]
async fn test_strict_admission_rejects_sixth_submission() {
    let runtime = JobRuntime::builder(Config::default())
        .handler(FnHandler::new("generate", |_ctx| async { Ok(()) }))
        .build()
        .await
        .unwrap();
    let caller = ClientIdentity::new("198.51.100.4").with_subject("user-7");

    for _ in 0..5 {
        runtime
            .submit(&caller, "generate", JobPriority::LIVE, json!({}))
            .await
            .unwrap();
    }

    let err = runtime
        .submit(&caller, "generate", JobPriority::LIVE, json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
    assert!(err.retry_after_secs().unwrap() >= 1);
    assert_eq!(runtime.queue().metrics().await.unwrap().pending, 5);

    // Another caller is unaffected
    runtime
        .submit(&ClientIdentity::new("198.51.100.5"), "generate", 5, json!({}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_handler_retry_policy_sets_attempt_ceiling() {
    let runtime = JobRuntime::builder(Config::default())
        .handler(
            FnHandler::new("email", |_ctx| async {
                Err(JobError::retryable("smtp unavailable"))
            })
            .with_retry_policy(RetryPolicy::with_attempts(2).with_backoff(
                amoeba_core::jobs::BackoffStrategy::immediate(),
            )),
        )
        .submit_tier(RateLimitTier::standard())
        .build()
        .await
        .unwrap();

    let job = runtime
        .submit(&ClientIdentity::new("10.0.0.1"), "email", 5, json!({}))
        .await
        .unwrap();
    assert_eq!(job.max_attempts, 2);

    let outcomes = runtime.dispatcher().drain().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[1], DispatchOutcome::Failed(_)));

    let job = runtime.queue().get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
}

// ============================================================================
// Scheduling Flow Tests
// ============================================================================

#[tokio::test]
async fn test_scheduled_work_is_produced_once_per_period() {
    let oracle = Arc::new(InMemoryOracle::new());
    let marker = oracle.clone();

    let runtime = JobRuntime::builder(Config::default())
        .handler(FnHandler::new("digest", move |ctx| {
            let marker = marker.clone();
            async move {
                let key = ctx
                    .job()
                    .dedupe_key
                    .clone()
                    .ok_or_else(|| JobError::fatal("scheduled job without dedupe key"))?;
                marker.mark_key_complete(key);
                Ok(())
            }
        }))
        .oracle_arc(oracle.clone())
        .build()
        .await
        .unwrap();

    let created = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
    let schedule = runtime
        .scheduler()
        .add_at(NewSchedule::new("daily digest", "0 6 * * *", "digest"), created)
        .await
        .unwrap();

    let tick = runtime
        .scheduler()
        .tick_at(Utc.with_ymd_and_hms(2026, 4, 3, 7, 0, 0).unwrap())
        .await;
    assert_eq!(tick.enqueued.len(), 1);

    runtime.dispatcher().drain().await.unwrap();
    assert_eq!(oracle.len(), 1);

    // Re-triggering the period finds the result already produced
    let trigger = runtime
        .scheduler()
        .trigger_at(schedule.id, Utc.with_ymd_and_hms(2026, 4, 3, 9, 0, 0).unwrap())
        .await
        .unwrap();
    assert!(trigger.job.is_none());

    // Backfill fills the two earlier days only
    let report = runtime
        .scheduler()
        .backfill(
            schedule.id,
            created,
            Utc.with_ymd_and_hms(2026, 4, 3, 23, 0, 0).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(report.periods_checked, 3);
    assert_eq!(report.already_complete, 1);
    assert_eq!(report.enqueued.len(), 2);

    let outcomes = runtime.dispatcher().drain().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert_eq!(outcome.job().priority, JobPriority::BACKFILL);
    }
    assert_eq!(oracle.len(), 3);
}

#[tokio::test]
async fn test_live_work_overtakes_backfill() {
    let (runtime, seen) = runtime_with_recorder().await;
    let schedule = runtime
        .scheduler()
        .add(
            NewSchedule::new("hourly", "0 * * * *", "report")
                .with_target_ref(json!({"name": "backfill"})),
        )
        .await
        .unwrap();

    runtime
        .scheduler()
        .backfill(
            schedule.id,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
        )
        .await
        .unwrap();
    runtime
        .submit(&ClientIdentity::new("10.0.0.1"), "report", JobPriority::LIVE, json!({"name": "live"}))
        .await
        .unwrap();

    runtime.dispatcher().run_once().await.unwrap();
    assert_eq!(seen.lock().first().map(String::as_str), Some("live"));
}

// ============================================================================
// Readiness Tests
// ============================================================================

#[tokio::test]
async fn test_runtime_readiness_reflects_components() {
    let runtime = JobRuntime::builder(Config::default())
        .handler(FnHandler::new("digest", |_ctx| async { Ok(()) }))
        .readiness_check(FnCheck::new("credentials", || async {
            HealthCheck::healthy("credentials", "1 credential ready")
        }))
        .build()
        .await
        .unwrap();

    let report = runtime.readiness().get_readiness().await;
    let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["queue", "scheduled_jobs", "credentials"]);
    assert_eq!(
        report.check("scheduled_jobs").unwrap().status,
        HealthStatus::Degraded
    );
    assert_eq!(report.overall, HealthStatus::Healthy);

    runtime
        .scheduler()
        .add(NewSchedule::new("daily", "0 6 * * *", "digest"))
        .await
        .unwrap();
    let report = runtime.readiness().get_readiness().await;
    assert_eq!(report.score, 100);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_runtime_processes_submissions() {
    let mut config = Config::default();
    config.dispatcher.poll_interval = Duration::from_millis(10);
    config.scheduler.catch_up_on_start = false;

    let runtime = JobRuntime::builder(config)
        .handler(FnHandler::new("generate", |_ctx| async { Ok(()) }))
        .build()
        .await
        .unwrap();

    runtime.start();
    let job = runtime
        .submit(&ClientIdentity::new("10.0.0.1"), "generate", 5, json!({}))
        .await
        .unwrap();

    let mut status = JobStatus::Pending;
    for _ in 0..200 {
        status = runtime.queue().get(job.id).await.unwrap().unwrap().status;
        if status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(runtime.stop().await);
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(runtime.worker_stats().succeeded, 1);
}

#[tokio::test]
async fn test_invalid_config_fails_build() {
    let mut config = Config::default();
    config.dispatcher.concurrency = 0;

    let err = JobRuntime::builder(config).build().await.err().unwrap();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}
