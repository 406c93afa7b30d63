//! Recurring schedule definitions.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::jobs::JobPriority;

/// Unique identifier for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of the most recent evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Success,
    Error,
    #[default]
    NeverRun,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::NeverRun => write!(f, "never run"),
        }
    }
}

/// The work a schedule produces when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTarget {
    pub job_type: String,
    /// Parameters for the job; merged into the job payload
    #[serde(default)]
    pub target_ref: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: JobPriority,
}

fn default_priority() -> JobPriority {
    JobPriority::LIVE
}

impl ScheduleTarget {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            target_ref: serde_json::Value::Null,
            priority: default_priority(),
        }
    }

    /// Stable string form of `target_ref`, used in dedupe keys.
    pub fn reference_key(&self) -> String {
        match &self.target_ref {
            serde_json::Value::Null => "-".to_string(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// `"<job_type>:<target_ref>:<period>"`
    pub fn dedupe_key(&self, period: &Period) -> String {
        format!("{}:{}:{}", self.job_type, self.reference_key(), period.key())
    }

    /// Job payload for one period: the target parameters plus period fields.
    pub fn payload_for(&self, schedule_id: Option<ScheduleId>, period: &Period) -> serde_json::Value {
        let mut payload = match &self.target_ref {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("target_ref".to_string(), other.clone());
                map
            }
        };
        payload.insert("period".to_string(), period.key().into());
        payload.insert(
            "period_date".to_string(),
            period.local_date().to_string().into(),
        );
        payload.insert(
            "scheduled_for".to_string(),
            period.starts_at.to_rfc3339().into(),
        );
        if let Some(id) = schedule_id {
            payload.insert("schedule_id".to_string(), id.to_string().into());
        }
        serde_json::Value::Object(payload)
    }
}

/// One occurrence of a schedule, in the schedule's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub starts_at: DateTime<Utc>,
    pub timezone: Tz,
}

impl Period {
    pub fn new(starts_at: DateTime<Utc>, timezone: Tz) -> Self {
        Self {
            starts_at,
            timezone,
        }
    }

    pub fn local(&self) -> DateTime<Tz> {
        self.starts_at.with_timezone(&self.timezone)
    }

    pub fn local_date(&self) -> NaiveDate {
        self.local().date_naive()
    }

    /// Local `YYYY-MM-DDTHH:MM`, with `:SS` appended for sub-minute schedules.
    pub fn key(&self) -> String {
        let local = self.local();
        if chrono::Timelike::second(&local) == 0 {
            local.format("%Y-%m-%dT%H:%M").to_string()
        } else {
            local.format("%Y-%m-%dT%H:%M:%S").to_string()
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key(), self.timezone)
    }
}

/// A recurring intent turned into jobs by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: ScheduleId,
    pub name: String,
    pub cron_expression: String,
    /// IANA timezone name
    pub timezone: String,
    pub is_active: bool,
    pub target: ScheduleTarget,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: ScheduleStatus,
    pub last_error: Option<String>,
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub success_count: u64,
    /// Latest occurrence already handled
    pub last_period: Option<DateTime<Utc>>,
    /// Latest upcoming occurrence enqueued ahead of time by catch-up
    #[serde(default)]
    pub scheduled_through: Option<DateTime<Utc>>,
    /// Current occurrence a failed catch-up left unhandled
    #[serde(default)]
    pub pending_period: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Percentage of runs that succeeded; `None` before the first run.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_runs > 0).then(|| self.success_count as f64 / self.total_runs as f64 * 100.0)
    }

    pub fn is_failing(&self) -> bool {
        self.last_status == ScheduleStatus::Error
    }

    pub(crate) fn record_success(&mut self, now: DateTime<Utc>) {
        self.advance_run_at(now);
        self.total_runs += 1;
        self.success_count += 1;
        self.last_status = ScheduleStatus::Success;
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.advance_run_at(now);
        self.total_runs += 1;
        self.last_status = ScheduleStatus::Error;
        self.last_error = Some(error.into());
    }

    /// An error found before any run was attempted (bad cron or timezone).
    pub(crate) fn record_invalid(&mut self, error: impl Into<String>) {
        self.last_status = ScheduleStatus::Error;
        self.last_error = Some(error.into());
    }

    pub(crate) fn advance_period(&mut self, period: DateTime<Utc>) {
        if self.last_period.map_or(true, |p| period > p) {
            self.last_period = Some(period);
        }
        if self.pending_period.map_or(false, |p| p <= period) {
            self.pending_period = None;
        }
    }

    pub(crate) fn advance_scheduled_through(&mut self, period: DateTime<Utc>) {
        if self.scheduled_through.map_or(true, |p| period > p) {
            self.scheduled_through = Some(period);
        }
    }

    /// Latest occurrence that must not be enqueued again, if any.
    pub fn handled_through(&self) -> Option<DateTime<Utc>> {
        match (self.last_period, self.scheduled_through) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Exclusive lower bound for due-ness checks on tick.
    pub(crate) fn evaluated_through(&self) -> DateTime<Utc> {
        self.handled_through().unwrap_or(self.created_at)
    }

    fn advance_run_at(&mut self, now: DateTime<Utc>) {
        if self.last_run_at.map_or(true, |t| now > t) {
            self.last_run_at = Some(now);
        }
    }
}

/// Request to create a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub target: ScheduleTarget,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_active() -> bool {
    true
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            timezone: default_timezone(),
            target: ScheduleTarget::new(job_type),
            is_active: true,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_target_ref(mut self, target_ref: serde_json::Value) -> Self {
        self.target.target_ref = target_ref;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<JobPriority>) -> Self {
        self.target.priority = priority.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub(crate) fn into_scheduled(self, now: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob {
            id: ScheduleId::new(),
            name: self.name,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            is_active: self.is_active,
            target: self.target,
            last_run_at: None,
            last_status: ScheduleStatus::NeverRun,
            last_error: None,
            total_runs: 0,
            success_count: 0,
            last_period: None,
            scheduled_through: None,
            pending_period: None,
            created_at: now,
        }
    }
}

/// Aggregate view over all schedules.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleSummary {
    pub total: usize,
    pub active: usize,
    /// Active schedules whose last evaluation errored
    pub failing: usize,
    pub never_run: usize,
    pub total_runs: u64,
    pub success_count: u64,
    /// Percentage over all runs; `None` before any run
    pub success_rate: Option<f64>,
}

impl ScheduleSummary {
    pub fn from_schedules<'a>(schedules: impl IntoIterator<Item = &'a ScheduledJob>) -> Self {
        let mut summary = Self::default();
        for schedule in schedules {
            summary.total += 1;
            if schedule.is_active {
                summary.active += 1;
                if schedule.is_failing() {
                    summary.failing += 1;
                }
            }
            if schedule.last_status == ScheduleStatus::NeverRun {
                summary.never_run += 1;
            }
            summary.total_runs += schedule.total_runs;
            summary.success_count += schedule.success_count;
        }
        summary.success_rate = (summary.total_runs > 0)
            .then(|| summary.success_count as f64 / summary.total_runs as f64 * 100.0);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_period_key_uses_local_time() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let period = Period::new(utc("2024-05-31T15:00:00Z"), tz);
        assert_eq!(period.key(), "2024-06-01T00:00");
        assert_eq!(period.local_date().to_string(), "2024-06-01");

        let sub_minute = Period::new(utc("2024-05-31T15:00:30Z"), tz);
        assert_eq!(sub_minute.key(), "2024-06-01T00:00:30");
    }

    #[test]
    fn test_dedupe_key_format() {
        let target = ScheduleTarget {
            job_type: "horoscope_generation".to_string(),
            target_ref: json!("daily"),
            priority: JobPriority::LIVE,
        };
        let period = Period::new(utc("2024-01-01T00:00:00Z"), Tz::UTC);
        assert_eq!(
            target.dedupe_key(&period),
            "horoscope_generation:daily:2024-01-01T00:00"
        );
        assert_eq!(ScheduleTarget::new("x").reference_key(), "-");
    }

    #[test]
    fn test_payload_merges_target_parameters() {
        let target = ScheduleTarget {
            job_type: "generate".to_string(),
            target_ref: json!({"template": "weekly"}),
            priority: JobPriority::LIVE,
        };
        let period = Period::new(utc("2024-01-01T06:00:00Z"), Tz::UTC);
        let payload = target.payload_for(None, &period);
        assert_eq!(payload["template"], "weekly");
        assert_eq!(payload["period"], "2024-01-01T06:00");
        assert_eq!(payload["period_date"], "2024-01-01");
        assert!(payload.get("schedule_id").is_none());
    }

    #[test]
    fn test_monotonic_advances() {
        let now = utc("2024-01-02T00:00:00Z");
        let mut schedule = NewSchedule::new("daily", "0 0 * * *", "generate").into_scheduled(now);

        schedule.advance_period(utc("2024-01-02T00:00:00Z"));
        schedule.advance_period(utc("2024-01-01T00:00:00Z"));
        assert_eq!(schedule.last_period, Some(utc("2024-01-02T00:00:00Z")));

        schedule.record_success(now);
        schedule.record_failure(utc("2024-01-01T00:00:00Z"), "oracle down");
        assert_eq!(schedule.last_run_at, Some(now));
        assert_eq!(schedule.total_runs, 2);
        assert_eq!(schedule.success_rate(), Some(50.0));
        assert!(schedule.is_failing());
    }

    #[test]
    fn test_summary() {
        let now = Utc::now();
        let mut ok = NewSchedule::new("a", "* * * * *", "x").into_scheduled(now);
        ok.record_success(now);
        let mut failing = NewSchedule::new("b", "* * * * *", "x").into_scheduled(now);
        failing.record_failure(now, "boom");
        let idle = NewSchedule::new("c", "* * * * *", "x").inactive().into_scheduled(now);

        let summary = ScheduleSummary::from_schedules([&ok, &failing, &idle]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.failing, 1);
        assert_eq!(summary.never_run, 1);
        assert_eq!(summary.success_rate, Some(50.0));
    }
}
