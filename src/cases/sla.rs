use chrono::{DateTime, Duration, Utc};

use crate::config::SlaConfig;
use crate::rules::Severity;

/// Resolution deadlines by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaPolicy {
    pub critical: Duration,
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            critical: Duration::hours(2),
            high: Duration::days(1),
            medium: Duration::days(3),
            low: Duration::days(5),
        }
    }
}

impl From<&SlaConfig> for SlaPolicy {
    fn from(config: &SlaConfig) -> Self {
        Self {
            critical: Duration::hours(i64::from(config.critical_hours)),
            high: Duration::hours(i64::from(config.high_hours)),
            medium: Duration::hours(i64::from(config.medium_hours)),
            low: Duration::hours(i64::from(config.low_hours)),
        }
    }
}

impl SlaPolicy {
    pub fn window(&self, severity: Severity) -> Duration {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    pub fn due_at(&self, severity: Severity, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + self.window(severity)
    }
}
