//! Integration tests for the cron scheduler.
//!
//! Tests cover:
//! - Due detection and single enqueue per period
//! - Idempotency oracle consultation
//! - Timezone-aware evaluation
//! - Error isolation between schedules
//! - Startup catch-up, manual trigger and backfill

use amoeba_core::error::{CoreError, ErrorCode};
use amoeba_core::jobs::{FnHandler, HandlerRegistry, JobPriority, JobQueue, JobStatus};
use amoeba_core::scheduler::{
    FnOracle, InMemoryOracle, JobScheduler, NeverComplete, NewSchedule, Period, ScheduleStatus,
    SchedulerConfig,
};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn scheduler_with(queue: &JobQueue, oracle: Arc<dyn amoeba_core::scheduler::IdempotencyOracle>) -> JobScheduler {
    JobScheduler::new(queue.clone(), oracle, SchedulerConfig::default())
}

// ============================================================================
// Tick Tests
// ============================================================================

#[tokio::test]
async fn test_daily_schedule_fires_once_per_period() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    scheduler
        .add_at(NewSchedule::new("digest", "0 6 * * *", "digest"), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap();

    let early = scheduler.tick_at(at(2026, 1, 1, 5, 59, 0)).await;
    assert_eq!(early.evaluated, 1);
    assert_eq!(early.not_due, 1);
    assert!(early.enqueued.is_empty());

    let due = scheduler.tick_at(at(2026, 1, 1, 6, 0, 30)).await;
    assert_eq!(due.enqueued.len(), 1);

    let again = scheduler.tick_at(at(2026, 1, 1, 6, 5, 0)).await;
    assert!(again.enqueued.is_empty());
    assert_eq!(again.not_due, 1);

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.pending, 1);

    let job = queue.get(due.enqueued[0]).await.unwrap().unwrap();
    assert_eq!(job.job_type, "digest");
    assert_eq!(job.priority, JobPriority::LIVE);
    assert_eq!(job.payload["period"], "2026-01-01T06:00");
    assert_eq!(job.dedupe_key.as_deref(), Some("digest:-:2026-01-01T06:00"));
}

#[tokio::test]
async fn test_missed_periods_enqueue_only_latest() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    scheduler
        .add_at(NewSchedule::new("hourly", "0 * * * *", "sync"), at(2026, 3, 1, 0, 0, 0))
        .await
        .unwrap();

    let report = scheduler.tick_at(at(2026, 3, 1, 5, 30, 0)).await;
    assert_eq!(report.enqueued.len(), 1);

    let job = queue.get(report.enqueued[0]).await.unwrap().unwrap();
    assert_eq!(job.payload["period"], "2026-03-01T05:00");
}

#[tokio::test]
async fn test_completed_period_is_skipped() {
    let queue = JobQueue::in_memory();
    let oracle = Arc::new(InMemoryOracle::new());
    let scheduler = scheduler_with(&queue, oracle.clone());
    let schedule = scheduler
        .add_at(NewSchedule::new("digest", "0 6 * * *", "digest"), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap();

    oracle.mark_complete(&schedule.target, &Period::new(at(2026, 1, 1, 6, 0, 0), Tz::UTC));

    let report = scheduler.tick_at(at(2026, 1, 1, 6, 1, 0)).await;
    assert!(report.enqueued.is_empty());
    assert_eq!(report.skipped, vec![schedule.id]);
    assert_eq!(queue.metrics().await.unwrap().total(), 0);

    let schedule = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(schedule.last_status, ScheduleStatus::Success);
    assert_eq!(schedule.last_period, Some(at(2026, 1, 1, 6, 0, 0)));
}

#[tokio::test]
async fn test_schedule_timezone_is_respected() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    scheduler
        .add_at(
            NewSchedule::new("morning", "0 9 * * *", "digest").with_timezone("America/New_York"),
            at(2026, 1, 5, 0, 0, 0),
        )
        .await
        .unwrap();

    // 09:00 EST is 14:00 UTC
    let before = scheduler.tick_at(at(2026, 1, 5, 13, 59, 0)).await;
    assert!(before.enqueued.is_empty());

    let after = scheduler.tick_at(at(2026, 1, 5, 14, 0, 1)).await;
    assert_eq!(after.enqueued.len(), 1);

    let job = queue.get(after.enqueued[0]).await.unwrap().unwrap();
    assert_eq!(job.payload["period"], "2026-01-05T09:00");
    assert_eq!(job.payload["period_date"], "2026-01-05");
}

#[tokio::test]
async fn test_inactive_schedule_not_evaluated() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    scheduler
        .add_at(
            NewSchedule::new("paused", "* * * * *", "sync").inactive(),
            at(2026, 1, 1, 0, 0, 0),
        )
        .await
        .unwrap();

    let report = scheduler.tick_at(at(2026, 1, 1, 1, 0, 0)).await;
    assert_eq!(report.evaluated, 0);
    assert!(report.enqueued.is_empty());
}

// ============================================================================
// Error Isolation Tests
// ============================================================================

#[tokio::test]
async fn test_invalid_schedule_does_not_block_others() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    let created = at(2026, 1, 1, 0, 0, 0);

    scheduler
        .add_at(NewSchedule::new("healthy", "0 6 * * *", "digest"), created)
        .await
        .unwrap();
    let mut broken = scheduler
        .add_at(NewSchedule::new("broken", "0 6 * * *", "digest"), created)
        .await
        .unwrap();
    broken.cron_expression = "every morning".to_string();
    scheduler.restore(broken.clone()).await;

    let report = scheduler.tick_at(at(2026, 1, 1, 6, 1, 0)).await;
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].name, "broken");

    let broken = scheduler.get(broken.id).await.unwrap();
    assert_eq!(broken.last_status, ScheduleStatus::Error);
    assert!(broken.last_error.is_some());

    let summary = scheduler.summary().await;
    assert_eq!(summary.total, 2);
    assert_eq!(summary.failing, 1);
}

#[tokio::test]
async fn test_oracle_failure_retries_period_next_tick() {
    let queue = JobQueue::in_memory();
    let broken = Arc::new(AtomicBool::new(true));
    let oracle = {
        let broken = broken.clone();
        FnOracle::new(move |_target, _period| {
            let broken = broken.clone();
            async move {
                if broken.load(Ordering::SeqCst) {
                    Err(CoreError::new(ErrorCode::IdempotencyCheckFailed, "store offline"))
                } else {
                    Ok(false)
                }
            }
        })
    };
    let scheduler = scheduler_with(&queue, Arc::new(oracle));
    let schedule = scheduler
        .add_at(NewSchedule::new("digest", "0 6 * * *", "digest"), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap();

    let failed = scheduler.tick_at(at(2026, 1, 1, 6, 1, 0)).await;
    assert_eq!(failed.errors.len(), 1);
    assert!(failed.enqueued.is_empty());

    let after_failure = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(after_failure.last_status, ScheduleStatus::Error);
    assert_eq!(after_failure.last_period, None);
    assert_eq!(after_failure.total_runs, 1);
    assert_eq!(after_failure.success_count, 0);

    broken.store(false, Ordering::SeqCst);
    let recovered = scheduler.tick_at(at(2026, 1, 1, 6, 2, 0)).await;
    assert_eq!(recovered.enqueued.len(), 1);

    let schedule = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(schedule.last_status, ScheduleStatus::Success);
    assert_eq!(schedule.success_rate(), Some(50.0));
}

// ============================================================================
// Validation Tests
// ============================================================================

#[tokio::test]
async fn test_add_rejects_bad_definitions() {
    let queue = JobQueue::in_memory();
    let registry = HandlerRegistry::builder()
        .register(FnHandler::new("digest", |_ctx| async { Ok(()) }))
        .build()
        .unwrap();
    let scheduler = JobScheduler::with_registry(
        queue,
        Arc::new(NeverComplete),
        Arc::new(registry),
        SchedulerConfig::default(),
    );

    let err = scheduler
        .add(NewSchedule::new("bad cron", "61 * * * *", "digest"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCronExpression);

    let err = scheduler
        .add(NewSchedule::new("bad tz", "0 6 * * *", "digest").with_timezone("Mars/Olympus"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTimezone);

    let err = scheduler
        .add(NewSchedule::new("no handler", "0 6 * * *", "email"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HandlerNotRegistered);

    assert!(scheduler.list().await.is_empty());
}

// ============================================================================
// Catch-up and Trigger Tests
// ============================================================================

#[tokio::test]
async fn test_catch_up_enqueues_current_and_next_period() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    let schedule = scheduler
        .add_at(NewSchedule::new("digest", "0 6 * * *", "digest"), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap();

    let report = scheduler.catch_up_at(at(2026, 1, 3, 12, 0, 0)).await;
    assert_eq!(report.enqueued.len(), 2);

    let mut periods: Vec<String> = Vec::new();
    for id in &report.enqueued {
        let job = queue.get(*id).await.unwrap().unwrap();
        periods.push(job.payload["period"].as_str().unwrap().to_string());
    }
    periods.sort();
    assert_eq!(periods, vec!["2026-01-03T06:00", "2026-01-04T06:00"]);

    let schedule = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(schedule.last_period, Some(at(2026, 1, 3, 6, 0, 0)));

    // The next tick lands on the pre-generated job instead of a duplicate
    scheduler.tick_at(at(2026, 1, 4, 6, 1, 0)).await;
    assert_eq!(queue.metrics().await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_period_enqueued_ahead_is_not_repeated_after_completion() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    let schedule = scheduler
        .add_at(NewSchedule::new("nightly", "0 0 * * *", "digest"), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap();

    let report = scheduler.catch_up_at(at(2026, 1, 1, 10, 0, 0)).await;
    assert_eq!(report.enqueued.len(), 2);
    assert_eq!(
        scheduler.get(schedule.id).await.unwrap().scheduled_through,
        Some(at(2026, 1, 2, 0, 0, 0))
    );

    // Both jobs finish, which releases their dedupe keys
    while let Some(job) = queue.claim_next().await.unwrap() {
        queue.complete(job.id).await.unwrap();
    }

    let arrival = scheduler.tick_at(at(2026, 1, 2, 0, 0, 30)).await;
    assert!(arrival.enqueued.is_empty());
    assert_eq!(arrival.not_due, 1);

    // Regular production resumes with the following period
    let next = scheduler.tick_at(at(2026, 1, 3, 0, 0, 30)).await;
    assert_eq!(next.enqueued.len(), 1);
    let job = queue.get(next.enqueued[0]).await.unwrap().unwrap();
    assert_eq!(job.payload["period"], "2026-01-03T00:00");

    // A second catch-up does not revisit handled periods either
    let again = scheduler.catch_up_at(at(2026, 1, 3, 1, 0, 0)).await;
    let periods: Vec<String> = {
        let mut periods = Vec::new();
        for id in &again.enqueued {
            let job = queue.get(*id).await.unwrap().unwrap();
            periods.push(job.payload["period"].as_str().unwrap().to_string());
        }
        periods
    };
    assert_eq!(periods, vec!["2026-01-04T00:00"]);
}

#[tokio::test]
async fn test_failed_catch_up_period_is_retried_by_tick() {
    let queue = JobQueue::in_memory();
    let broken = Arc::new(AtomicBool::new(true));
    let oracle = {
        let broken = broken.clone();
        FnOracle::new(move |_target, _period| {
            let broken = broken.clone();
            async move {
                if broken.load(Ordering::SeqCst) {
                    Err(CoreError::new(ErrorCode::IdempotencyCheckFailed, "store offline"))
                } else {
                    Ok(false)
                }
            }
        })
    };
    let scheduler = scheduler_with(&queue, Arc::new(oracle));

    // Added after today's 06:00 occurrence
    let schedule = scheduler
        .add_at(NewSchedule::new("digest", "0 6 * * *", "digest"), at(2026, 1, 1, 10, 0, 0))
        .await
        .unwrap();

    let failed = scheduler.catch_up_at(at(2026, 1, 1, 10, 0, 0)).await;
    assert_eq!(failed.errors.len(), 1);
    assert!(failed.enqueued.is_empty());

    let after_failure = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(after_failure.last_period, None);
    assert_eq!(after_failure.pending_period, Some(at(2026, 1, 1, 6, 0, 0)));

    broken.store(false, Ordering::SeqCst);
    let retried = scheduler.tick_at(at(2026, 1, 1, 10, 1, 0)).await;
    assert_eq!(retried.enqueued.len(), 1);
    let job = queue.get(retried.enqueued[0]).await.unwrap().unwrap();
    assert_eq!(job.payload["period"], "2026-01-01T06:00");

    let schedule = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(schedule.last_period, Some(at(2026, 1, 1, 6, 0, 0)));
    assert_eq!(schedule.pending_period, None);

    let quiet = scheduler.tick_at(at(2026, 1, 1, 10, 2, 0)).await;
    assert!(quiet.enqueued.is_empty());
}

#[tokio::test]
async fn test_trigger_runs_inactive_schedule_and_dedupes() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    let schedule = scheduler
        .add_at(
            NewSchedule::new("digest", "0 6 * * *", "digest").inactive(),
            at(2026, 1, 1, 0, 0, 0),
        )
        .await
        .unwrap();

    let first = scheduler
        .trigger_at(schedule.id, at(2026, 1, 2, 8, 0, 0))
        .await
        .unwrap();
    let second = scheduler
        .trigger_at(schedule.id, at(2026, 1, 2, 8, 30, 0))
        .await
        .unwrap();

    assert_eq!(first.period.key(), "2026-01-02T06:00");
    let first_job = first.job.unwrap();
    assert_eq!(second.job.unwrap().id, first_job.id);
    assert_eq!(queue.metrics().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_trigger_unknown_schedule() {
    let scheduler = scheduler_with(&JobQueue::in_memory(), Arc::new(NeverComplete));
    let err = scheduler
        .trigger(amoeba_core::scheduler::ScheduleId::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ScheduleNotFound);
}

// ============================================================================
// Backfill Tests
// ============================================================================

#[tokio::test]
async fn test_backfill_enqueues_only_incomplete_periods() {
    let queue = JobQueue::in_memory();
    let oracle = Arc::new(InMemoryOracle::new());
    let scheduler = scheduler_with(&queue, oracle.clone());
    let schedule = scheduler
        .add_at(NewSchedule::new("digest", "0 6 * * *", "digest"), at(2026, 2, 1, 0, 0, 0))
        .await
        .unwrap();

    oracle.mark_complete(&schedule.target, &Period::new(at(2026, 1, 2, 6, 0, 0), Tz::UTC));
    oracle.mark_complete(&schedule.target, &Period::new(at(2026, 1, 4, 6, 0, 0), Tz::UTC));

    let report = scheduler
        .backfill_at(
            schedule.id,
            at(2026, 1, 1, 0, 0, 0),
            at(2026, 1, 5, 23, 59, 0),
            at(2026, 2, 1, 12, 0, 0),
        )
        .await
        .unwrap();

    assert_eq!(report.periods_checked, 5);
    assert_eq!(report.already_complete, 2);
    assert_eq!(report.enqueued.len(), 3);
    assert!(report.errors.is_empty());
    assert!(!report.truncated);

    for id in &report.enqueued {
        let job = queue.get(*id).await.unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::BACKFILL);
        assert_eq!(job.status, JobStatus::Pending);
    }

    // Backfill leaves the schedule's own progress alone
    let schedule = scheduler.get(schedule.id).await.unwrap();
    assert_eq!(schedule.last_period, None);
}

#[tokio::test]
async fn test_backfill_twice_does_not_duplicate() {
    let queue = JobQueue::in_memory();
    let scheduler = scheduler_with(&queue, Arc::new(NeverComplete));
    let schedule = scheduler
        .add(NewSchedule::new("digest", "0 6 * * *", "digest"))
        .await
        .unwrap();

    let from = at(2026, 1, 1, 0, 0, 0);
    let to = at(2026, 1, 3, 23, 0, 0);
    scheduler.backfill(schedule.id, from, to).await.unwrap();
    scheduler.backfill(schedule.id, from, to).await.unwrap();

    assert_eq!(queue.metrics().await.unwrap().pending, 3);
}

#[tokio::test]
async fn test_backfill_is_truncated_at_limit() {
    let queue = JobQueue::in_memory();
    let scheduler = JobScheduler::new(
        queue.clone(),
        Arc::new(NeverComplete),
        SchedulerConfig {
            max_backfill_periods: 2,
            ..Default::default()
        },
    );
    let schedule = scheduler
        .add(NewSchedule::new("digest", "0 6 * * *", "digest"))
        .await
        .unwrap();

    let report = scheduler
        .backfill(schedule.id, at(2026, 1, 1, 0, 0, 0), at(2026, 1, 10, 0, 0, 0))
        .await
        .unwrap();

    assert!(report.truncated);
    assert_eq!(report.periods_checked, 2);
    assert_eq!(queue.metrics().await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_backfill_rejects_reversed_range() {
    let scheduler = scheduler_with(&JobQueue::in_memory(), Arc::new(NeverComplete));
    let schedule = scheduler
        .add(NewSchedule::new("digest", "0 6 * * *", "digest"))
        .await
        .unwrap();

    let err = scheduler
        .backfill(schedule.id, at(2026, 1, 5, 0, 0, 0), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

// ============================================================================
// Background Loop Tests
// ============================================================================

#[tokio::test]
async fn test_started_scheduler_catches_up_then_stops() {
    let queue = JobQueue::in_memory();
    let scheduler = JobScheduler::new(
        queue.clone(),
        Arc::new(NeverComplete),
        SchedulerConfig {
            tick_interval: std::time::Duration::from_millis(20),
            ..Default::default()
        },
    );
    scheduler
        .add_at(NewSchedule::new("minutely", "* * * * *", "sync"), at(2026, 1, 1, 0, 0, 0))
        .await
        .unwrap();

    let handle = scheduler.start();
    for _ in 0..100 {
        if queue.metrics().await.unwrap().pending > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.stop().await;

    assert!(queue.metrics().await.unwrap().pending >= 1);
}
