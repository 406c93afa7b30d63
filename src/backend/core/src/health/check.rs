//! Readiness status types and aggregation.
//!
//! This module provides:
//! - `HealthStatus`: the three-level traffic light
//! - `HealthCheck`: one sub-check result with a detail bag
//! - `ReadinessReport`: the aggregated view with score and remediation text
//!
//! # Aggregation
//!
//! - any **critical** check makes the whole report critical
//! - otherwise, if degraded checks are at least as many as healthy ones, the
//!   report is **degraded**
//! - otherwise it is **healthy**
//!
//! The score is the healthy fraction of checks, 0-100.
//!
//! # Example
//!
//! ```rust,ignore
//! use amoeba_core::health::{HealthCheck, ReadinessReport};
//!
//! let storage = HealthCheck::healthy("storage", "Storage reachable (4ms)")
//!     .with_detail("latency_ms", 4);
//!
//! let report = ReadinessReport::from_checks(vec![storage]);
//! assert_eq!(report.score, 100);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    #[default]
    Healthy,
    /// Operational, needs attention
    Degraded,
    /// Blocking normal operation
    Critical,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// The worse of two statuses.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Critical, _) | (_, Self::Critical) => Self::Critical,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Self::Healthy => "🟢",
            Self::Degraded => "🟡",
            Self::Critical => "🔴",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Critical => 503,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

/// Detail key holding the remediation text for a non-healthy check.
pub const ACTION_DETAIL: &str = "action";

/// Result of one readiness sub-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,

    /// Machine-usable details
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    pub checked_at: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            details: BTreeMap::new(),
            latency_ms: None,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy, message)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded, message)
    }

    pub fn critical(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Critical, message)
    }

    /// Add a detail. Values that fail to serialize are dropped.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Remediation text surfaced as a recommendation.
    pub fn with_action(self, action: impl Into<String>) -> Self {
        self.with_detail(ACTION_DETAIL, action.into())
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn action(&self) -> Option<&str> {
        self.details.get(ACTION_DETAIL).and_then(|v| v.as_str())
    }

    pub fn icon(&self) -> &'static str {
        self.status.icon()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Readiness Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub overall: HealthStatus,
    pub icon: String,
    /// Healthy checks as a percentage of all checks
    pub score: u8,
    pub checks: Vec<HealthCheck>,
    /// Critical problems preventing operation
    pub blockers: Vec<String>,
    /// Degraded areas needing attention
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ReadinessReport {
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let total = checks.len();
        let healthy = checks.iter().filter(|c| c.status == HealthStatus::Healthy).count();
        let degraded = checks.iter().filter(|c| c.status == HealthStatus::Degraded).count();
        let critical = checks.iter().filter(|c| c.status == HealthStatus::Critical).count();

        let overall = if critical > 0 {
            HealthStatus::Critical
        } else if degraded > 0 && degraded >= healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let score = if total == 0 {
            100
        } else {
            ((healthy as f64 / total as f64) * 100.0).round() as u8
        };

        let mut blockers = Vec::new();
        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        for check in &checks {
            match check.status {
                HealthStatus::Critical => blockers.push(format!("{}: {}", check.name, check.message)),
                HealthStatus::Degraded => warnings.push(format!("{}: {}", check.name, check.message)),
                HealthStatus::Healthy => continue,
            }
            if let Some(action) = check.action() {
                recommendations.push(action.to_string());
            }
        }

        if healthy == total {
            recommendations.push("System is fully operational".to_string());
        } else if critical == 0 && healthy > degraded {
            recommendations
                .push("Most systems healthy; address warnings for full functionality".to_string());
        }

        Self {
            overall,
            icon: overall.icon().to_string(),
            score,
            checks,
            blockers,
            warnings,
            recommendations,
            timestamp: Utc::now(),
        }
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn is_operational(&self) -> bool {
        self.overall.is_operational()
    }
}

/// Cheap status for liveness endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickHealth {
    pub status: HealthStatus,
    pub icon: String,
    pub message: String,
}

impl QuickHealth {
    /// Worst of `checks`; the message is the first non-healthy check's.
    pub fn from_checks(checks: &[HealthCheck]) -> Self {
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.combine(c.status));

        let message = checks
            .iter()
            .filter(|c| c.status == status && !status.is_healthy())
            .map(|c| format!("{}: {}", c.name, c.message))
            .next()
            .unwrap_or_else(|| "All core systems operational".to_string());

        Self {
            status,
            icon: status.icon().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_combine() {
        use HealthStatus::*;
        assert_eq!(Healthy.combine(Healthy), Healthy);
        assert_eq!(Healthy.combine(Degraded), Degraded);
        assert_eq!(Degraded.combine(Critical), Critical);
    }

    #[test]
    fn test_status_icon_and_serde() {
        assert_eq!(HealthStatus::Healthy.icon(), "🟢");
        assert_eq!(HealthStatus::Critical.icon(), "🔴");
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
    }

    #[test]
    fn test_check_action_detail() {
        let check = HealthCheck::degraded("templates", "No templates")
            .with_action("Create a template")
            .with_detail("total", 0);
        assert_eq!(check.action(), Some("Create a template"));
        assert_eq!(check.details["total"], 0);
    }

    #[test]
    fn test_report_any_critical_is_critical() {
        let report = ReadinessReport::from_checks(vec![
            HealthCheck::healthy("a", "ok"),
            HealthCheck::healthy("b", "ok"),
            HealthCheck::critical("storage", "unreachable").with_action("Check the storage URL"),
        ]);
        assert_eq!(report.overall, HealthStatus::Critical);
        assert_eq!(report.score, 67);
        assert_eq!(report.blockers, vec!["storage: unreachable".to_string()]);
        assert!(report.recommendations.contains(&"Check the storage URL".to_string()));
    }

    #[test]
    fn test_report_degraded_ties_are_degraded() {
        let report = ReadinessReport::from_checks(vec![
            HealthCheck::healthy("a", "ok"),
            HealthCheck::degraded("b", "slow"),
        ]);
        assert_eq!(report.overall, HealthStatus::Degraded);
        assert_eq!(report.score, 50);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_report_healthy_majority() {
        let report = ReadinessReport::from_checks(vec![
            HealthCheck::healthy("a", "ok"),
            HealthCheck::healthy("b", "ok"),
            HealthCheck::degraded("c", "slow"),
        ]);
        assert_eq!(report.overall, HealthStatus::Healthy);
        assert_eq!(report.score, 67);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_report_without_checks() {
        let report = ReadinessReport::from_checks(Vec::new());
        assert_eq!(report.overall, HealthStatus::Healthy);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn test_quick_health() {
        let quick = QuickHealth::from_checks(&[
            HealthCheck::healthy("queue", "ok"),
            HealthCheck::critical("storage", "down"),
        ]);
        assert_eq!(quick.status, HealthStatus::Critical);
        assert_eq!(quick.message, "storage: down");

        let quick = QuickHealth::from_checks(&[]);
        assert_eq!(quick.message, "All core systems operational");
    }
}
