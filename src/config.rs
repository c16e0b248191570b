use serde::Deserialize;
use std::path::Path;

use crate::rules::Severity;
use crate::signals::FailClosed;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub screening: ScreeningConfig,
    pub sla: SlaConfig,
    pub cases: CaseConfig,
    pub rules: RulesConfig,
    pub collaborators: CollaboratorConfig,
    pub database: DatabaseConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScreeningConfig {
    pub block_threshold: u8,
    pub flag_threshold: u8,
    /// ISO country codes treated as high risk by geographic rules with an
    /// empty country list.
    pub high_risk_countries: Vec<String>,
    pub collaborator_timeout_ms: u64,
    /// Per-entity, per-rule event cap for velocity windows.
    pub max_window_events: usize,
    /// Concurrent screenings; 0 means one per available CPU.
    pub workers: usize,
    pub watchlist_fail_action: FailClosed,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SlaConfig {
    pub critical_hours: u32,
    pub high_hours: u32,
    pub medium_hours: u32,
    pub low_hours: u32,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CaseConfig {
    /// Escalation targets, used in order when no supervisor is named.
    pub supervisors: Vec<String>,
    /// Investigators that new cases are handed to round-robin. Empty leaves
    /// cases in the queue to be claimed.
    pub auto_assign: Vec<String>,
    pub audit_memory: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RulesConfig {
    pub path: Option<String>,
    pub reload_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub watchlist_url: Option<String>,
    pub enrichment_url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub min_severity: Severity,
    pub cooldown_seconds: u64,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            block_threshold: 75,
            flag_threshold: 50,
            high_risk_countries: Vec::new(),
            collaborator_timeout_ms: 2000,
            max_window_events: 10_000,
            workers: 0,
            watchlist_fail_action: FailClosed::Match,
        }
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            critical_hours: 2,
            high_hours: 24,
            medium_hours: 72,
            low_hours: 120,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for CaseConfig {
    fn default() -> Self {
        Self {
            supervisors: Vec::new(),
            auto_assign: Vec::new(),
            audit_memory: 10_000,
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: Some("rules.toml".into()),
            reload_interval_secs: 300,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/txsentinel.db".into(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: Severity::Critical,
            cooldown_seconds: 30,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn workers(&self) -> usize {
        match self.screening.workers {
            0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.screening.block_threshold, 75);
        assert_eq!(c.screening.flag_threshold, 50);
        assert_eq!(c.screening.collaborator_timeout_ms, 2000);
        assert_eq!(c.sla.critical_hours, 2);
        assert_eq!(c.sla.low_hours, 120);
        assert_eq!(c.notifications.min_severity, Severity::Critical);
        assert_eq!(c.database.path, "data/txsentinel.db");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let c: Config = toml::from_str(
            r#"
            [screening]
            block_threshold = 80
            high_risk_countries = ["KP", "IR"]
            watchlist_fail_action = "review"

            [cases]
            supervisors = ["sup-1"]
            "#,
        )
        .unwrap();
        assert_eq!(c.screening.block_threshold, 80);
        assert_eq!(c.screening.flag_threshold, 50);
        assert_eq!(c.screening.watchlist_fail_action, FailClosed::Review);
        assert_eq!(c.screening.high_risk_countries, vec!["KP", "IR"]);
        assert_eq!(c.cases.supervisors, vec!["sup-1"]);
        assert_eq!(c.sla.high_hours, 24);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let c = Config::load("/nonexistent/txsentinel.toml");
        assert_eq!(c.rules.reload_interval_secs, 300);
    }

    #[test]
    fn explicit_workers_win() {
        let mut c = Config::default();
        c.screening.workers = 3;
        assert_eq!(c.workers(), 3);
        c.screening.workers = 0;
        assert!(c.workers() >= 1);
    }
}
