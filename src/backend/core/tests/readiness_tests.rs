//! Integration tests for readiness aggregation.
//!
//! Tests cover:
//! - Overall status rules across mixed check results
//! - Score, blockers, warnings and recommendations
//! - Queue and schedule checks against live components
//! - Timeouts and the quick view

use amoeba_core::health::{
    FnCheck, HealthCheck, HealthStatus, ReadinessConfig, ReadinessService, ScheduleHealthCheck,
};
use amoeba_core::jobs::{JobError, JobQueue};
use amoeba_core::scheduler::{JobScheduler, NeverComplete, NewSchedule, SchedulerConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn service(queue: &JobQueue) -> ReadinessService {
    ReadinessService::new(queue.clone(), ReadinessConfig::default())
}

fn healthy(name: &'static str) -> FnCheck<impl Fn() -> std::future::Ready<HealthCheck> + Send + Sync> {
    FnCheck::new(name, move || std::future::ready(HealthCheck::healthy(name, "ok")))
}

fn degraded(name: &'static str, action: &'static str) -> FnCheck<impl Fn() -> std::future::Ready<HealthCheck> + Send + Sync> {
    FnCheck::new(name, move || {
        std::future::ready(HealthCheck::degraded(name, "limited").with_action(action))
    })
}

// ============================================================================
// Aggregation Tests
// ============================================================================

#[tokio::test]
async fn test_all_healthy() {
    let queue = JobQueue::in_memory();
    let report = service(&queue)
        .with_check(healthy("credentials"))
        .with_check(healthy("storage"))
        .get_readiness()
        .await;

    assert_eq!(report.overall, HealthStatus::Healthy);
    assert_eq!(report.score, 100);
    assert!(report.blockers.is_empty());
    assert!(report.warnings.is_empty());
    assert_eq!(report.recommendations, vec!["System is fully operational".to_string()]);
    assert_eq!(report.checks.len(), 3);
}

#[tokio::test]
async fn test_degraded_when_half_degraded() {
    let queue = JobQueue::in_memory();
    let report = service(&queue)
        .with_check(degraded("templates", "Add a template"))
        .get_readiness()
        .await;

    assert_eq!(report.overall, HealthStatus::Degraded);
    assert_eq!(report.score, 50);
    assert_eq!(report.warnings, vec!["templates: limited".to_string()]);
    assert!(report.recommendations.contains(&"Add a template".to_string()));
    assert!(report.is_operational());
}

#[tokio::test]
async fn test_mostly_healthy_stays_healthy() {
    let queue = JobQueue::in_memory();
    let report = service(&queue)
        .with_check(healthy("credentials"))
        .with_check(healthy("storage"))
        .with_check(degraded("templates", "Add a template"))
        .get_readiness()
        .await;

    assert_eq!(report.overall, HealthStatus::Healthy);
    assert_eq!(report.score, 75);
    assert_eq!(report.warnings.len(), 1);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.starts_with("Most systems healthy")));
}

#[tokio::test]
async fn test_any_critical_is_critical() {
    let queue = JobQueue::in_memory();
    let report = service(&queue)
        .with_check(healthy("credentials"))
        .with_check(healthy("storage"))
        .with_check(FnCheck::new("database", || async {
            HealthCheck::critical("database", "unreachable").with_action("Check DATABASE_URL")
        }))
        .get_readiness()
        .await;

    assert_eq!(report.overall, HealthStatus::Critical);
    assert_eq!(report.blockers, vec!["database: unreachable".to_string()]);
    assert!(report.recommendations.contains(&"Check DATABASE_URL".to_string()));
    assert!(!report.is_operational());
    assert_eq!(report.overall.http_status(), 503);
}

#[tokio::test]
async fn test_slow_check_times_out_as_critical() {
    let queue = JobQueue::in_memory();
    let report = ReadinessService::new(
        queue,
        ReadinessConfig {
            check_timeout: Duration::from_millis(20),
            ..Default::default()
        },
    )
    .with_check(FnCheck::new("ai_provider", || async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        HealthCheck::healthy("ai_provider", "late")
    }))
    .get_readiness()
    .await;

    assert_eq!(report.overall, HealthStatus::Critical);
    let check = report.check("ai_provider").unwrap();
    assert_eq!(check.status, HealthStatus::Critical);
    assert!(check.message.contains("timed out"));
}

// ============================================================================
// Component Check Tests
// ============================================================================

#[tokio::test]
async fn test_queue_failures_degrade_readiness() {
    let queue = JobQueue::in_memory();
    for _ in 0..2 {
        let job = queue.enqueue("render", 5, json!({})).await.unwrap();
        queue.claim_next().await.unwrap();
        queue.fail(job.id, &JobError::fatal("bad template")).await.unwrap();
    }

    let report = service(&queue).get_readiness().await;
    assert_eq!(report.overall, HealthStatus::Degraded);

    let check = report.check("queue").unwrap();
    assert_eq!(check.details["failed"], 2);
    assert!(check.action().is_some());
}

#[tokio::test]
async fn test_queue_metrics_exposed() {
    let queue = JobQueue::in_memory();
    queue.enqueue("render", 5, json!({})).await.unwrap();

    let metrics = service(&queue).get_queue_metrics().await.unwrap();
    assert_eq!(metrics.pending, 1);
}

#[tokio::test]
async fn test_schedule_check_with_failing_schedules() {
    let queue = JobQueue::in_memory();
    let scheduler = JobScheduler::new(queue.clone(), Arc::new(NeverComplete), SchedulerConfig::default());

    let mut broken = scheduler
        .add(NewSchedule::new("broken", "0 6 * * *", "digest"))
        .await
        .unwrap();
    broken.cron_expression = "not cron".to_string();
    scheduler.restore(broken).await;
    scheduler.tick().await;

    let report = service(&queue)
        .with_check(ScheduleHealthCheck::new(scheduler))
        .get_readiness()
        .await;

    let check = report.check("scheduled_jobs").unwrap();
    assert_eq!(check.status, HealthStatus::Degraded);
    assert!(check.message.contains("failing"));
}

// ============================================================================
// Quick View Tests
// ============================================================================

#[tokio::test]
async fn test_quick_health_reports_core_failures() {
    let queue = JobQueue::in_memory();
    let service = service(&queue)
        .with_check(
            FnCheck::new("credentials", || async {
                HealthCheck::critical("credentials", "no credentials configured")
            })
            .core(),
        )
        .with_check(degraded("templates", "Add a template"));

    let quick = service.quick_health().await;
    assert_eq!(quick.status, HealthStatus::Critical);
    assert_eq!(quick.message, "credentials: no credentials configured");
}

#[tokio::test]
async fn test_quick_health_all_good() {
    let queue = JobQueue::in_memory();
    let quick = service(&queue).quick_health().await;
    assert_eq!(quick.status, HealthStatus::Healthy);
    assert_eq!(quick.message, "All core systems operational");
}
