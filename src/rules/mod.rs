pub mod store;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Fixed weight used by the risk scorer.
    pub fn weight(&self) -> u8 {
        match self {
            Severity::Low => 10,
            Severity::Medium => 30,
            Severity::High => 60,
            Severity::Critical => 90,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action a rule asks for when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Flag,
    Block,
    Review,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    AmountThreshold,
    Velocity,
    Geographic,
    Watchlist,
    Pattern,
    Behavioral,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::AmountThreshold => "amount_threshold",
            RuleType::Velocity => "velocity",
            RuleType::Geographic => "geographic",
            RuleType::Watchlist => "watchlist",
            RuleType::Pattern => "pattern",
            RuleType::Behavioral => "behavioral",
        }
    }
}

/// Type-specific parameters. The variant *is* the rule type, so a rule
/// can never carry more than one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConditions {
    AmountThreshold {
        #[serde(default)]
        amount_min: Option<f64>,
        #[serde(default)]
        amount_max: Option<f64>,
    },
    Velocity {
        transaction_count: u32,
        time_window_minutes: u32,
        /// Optional volume trigger over the same window.
        #[serde(default)]
        volume_min: Option<f64>,
    },
    Geographic {
        /// ISO country codes. Empty means the deployment's default high-risk set.
        #[serde(default)]
        countries: Vec<String>,
    },
    Watchlist {
        #[serde(default)]
        min_confidence: f64,
    },
    Pattern { signal: String, threshold: f64 },
    Behavioral { signal: String, threshold: f64 },
}

impl RuleConditions {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleConditions::AmountThreshold { .. } => RuleType::AmountThreshold,
            RuleConditions::Velocity { .. } => RuleType::Velocity,
            RuleConditions::Geographic { .. } => RuleType::Geographic,
            RuleConditions::Watchlist { .. } => RuleType::Watchlist,
            RuleConditions::Pattern { .. } => RuleType::Pattern,
            RuleConditions::Behavioral { .. } => RuleType::Behavioral,
        }
    }

    /// Structural check run before activation and again before evaluation.
    pub fn validate(&self, rule_id: &str) -> Result<(), ConfigurationError> {
        let err = |reason: &str| Err(ConfigurationError::new(rule_id, reason));
        match self {
            RuleConditions::AmountThreshold {
                amount_min,
                amount_max,
            } => {
                if amount_min.is_none() && amount_max.is_none() {
                    return err("amount_threshold needs amount_min or amount_max");
                }
                if amount_min.is_some_and(|v| !v.is_finite())
                    || amount_max.is_some_and(|v| !v.is_finite())
                {
                    return err("amount bounds must be finite");
                }
                if let (Some(min), Some(max)) = (amount_min, amount_max) {
                    if min > max {
                        return err("amount_min is greater than amount_max");
                    }
                }
                Ok(())
            }
            RuleConditions::Velocity {
                transaction_count,
                time_window_minutes,
                volume_min,
            } => {
                if *transaction_count == 0 {
                    return err("transaction_count must be at least 1");
                }
                if *time_window_minutes == 0 {
                    return err("time_window_minutes must be at least 1");
                }
                if volume_min.is_some_and(|v| !v.is_finite() || v < 0.0) {
                    return err("volume_min must be a non-negative number");
                }
                Ok(())
            }
            RuleConditions::Geographic { countries } => {
                if countries.iter().any(|c| c.trim().is_empty()) {
                    return err("country codes must not be blank");
                }
                Ok(())
            }
            RuleConditions::Watchlist { min_confidence } => {
                if !(0.0..=1.0).contains(min_confidence) {
                    return err("min_confidence must be within 0.0..=1.0");
                }
                Ok(())
            }
            RuleConditions::Pattern { signal, threshold }
            | RuleConditions::Behavioral { signal, threshold } => {
                if signal.trim().is_empty() {
                    return err("signal name must not be empty");
                }
                if !threshold.is_finite() {
                    return err("threshold must be finite");
                }
                Ok(())
            }
        }
    }

    /// Window length for velocity rules.
    pub fn window(&self) -> Option<Duration> {
        match self {
            RuleConditions::Velocity {
                time_window_minutes,
                ..
            } => Some(Duration::minutes(i64::from(*time_window_minutes))),
            _ => None,
        }
    }
}

/// A versioned rule definition. Pure data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub severity: Severity,
    pub action: RuleAction,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub auto_create_case: bool,
    pub conditions: RuleConditions,
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn first_version() -> u32 {
    1
}

impl Rule {
    pub fn rule_type(&self) -> RuleType {
        self.conditions.rule_type()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::new("<unnamed>", "rule id must not be empty"));
        }
        self.conditions.validate(&self.id)
    }
}
