pub mod decision;
pub mod rules;
pub mod score;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collaborators::CollaboratorInputs;
use crate::core::velocity::VelocityTracker;
use crate::core::{RuleMatch, Transaction};
use crate::error::ConfigurationError;
use crate::rules::{Rule, RuleConditions};
use crate::rules::store::RuleSnapshot;
use rules::{EvalContext, evaluate_rule};

/// What to do with a rule whose external input is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailClosed {
    /// Treat the rule as matched with its configured action.
    #[default]
    Match,
    /// Treat the rule as matched and route the transaction to manual review.
    Review,
}

/// Every active rule's result for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub results: Vec<RuleMatch>,
    pub config_errors: Vec<ConfigurationError>,
}

impl Evaluation {
    pub fn matched(&self) -> Vec<RuleMatch> {
        self.results.iter().filter(|m| m.matched).cloned().collect()
    }

    pub fn matched_rule_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|m| m.matched)
            .map(|m| m.rule_id.clone())
            .collect()
    }
}

/// The rule evaluation engine applies every active rule to a transaction.
pub struct RuleEngine {
    tracker: Arc<VelocityTracker>,
    high_risk_countries: HashSet<String>,
    fail_closed: FailClosed,
}

impl RuleEngine {
    pub fn new(
        tracker: Arc<VelocityTracker>,
        high_risk_countries: impl IntoIterator<Item = String>,
        fail_closed: FailClosed,
    ) -> Self {
        Self {
            tracker,
            high_risk_countries: high_risk_countries
                .into_iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .collect(),
            fail_closed,
        }
    }

    pub fn tracker(&self) -> &Arc<VelocityTracker> {
        &self.tracker
    }

    /// Run all active rules. A malformed rule is skipped and reported; it
    /// never stops the others. Inactive rules are not touched at all.
    pub fn evaluate(
        &self,
        tx: &Transaction,
        snapshot: &RuleSnapshot,
        inputs: &CollaboratorInputs,
    ) -> Evaluation {
        let ctx = EvalContext {
            tx,
            tracker: &self.tracker,
            inputs,
            high_risk_countries: &self.high_risk_countries,
            fail_closed: self.fail_closed,
        };

        let mut results = Vec::with_capacity(snapshot.len());
        let mut config_errors = Vec::new();
        for rule in snapshot.rules() {
            if !rule.is_active {
                continue;
            }
            if let Err(e) = rule.validate().and_then(|()| self.check_window_capacity(rule)) {
                warn!(rule_id = %rule.id, "Configuration error, rule skipped: {}", e.reason);
                config_errors.push(e);
                continue;
            }
            let result = evaluate_rule(rule, &ctx);
            if result.matched {
                debug!(tx_id = %tx.id, rule_id = %rule.id, "Rule matched");
            }
            results.push(result);
        }

        Evaluation {
            results,
            config_errors,
        }
    }

    /// A velocity rule needing more events than a window keeps could never fire.
    fn check_window_capacity(&self, rule: &Rule) -> Result<(), ConfigurationError> {
        match &rule.conditions {
            RuleConditions::Velocity {
                transaction_count, ..
            } if *transaction_count as usize > self.tracker.capacity() => Err(ConfigurationError::new(
                &rule.id,
                format!(
                    "transaction_count {transaction_count} exceeds max_window_events {}",
                    self.tracker.capacity()
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::make_tx;
    use crate::rules::tests::make_rule;
    use crate::rules::{RuleAction, Severity};

    fn engine() -> RuleEngine {
        RuleEngine::new(
            Arc::new(VelocityTracker::new(1000)),
            vec!["IR".to_string()],
            FailClosed::Match,
        )
    }

    fn velocity_rule(id: &str) -> Rule {
        make_rule(
            id,
            Severity::Medium,
            RuleAction::Flag,
            RuleConditions::Velocity {
                transaction_count: 2,
                time_window_minutes: 10,
                volume_min: None,
            },
        )
    }

    #[test]
    fn no_rules_no_matches() {
        let e = engine();
        let eval = e.evaluate(&make_tx("t", "e", 1.0), &RuleSnapshot::empty(), &CollaboratorInputs::none());
        assert!(eval.results.is_empty());
        assert!(eval.matched().is_empty());
    }

    #[test]
    fn malformed_rule_is_isolated() {
        let e = engine();
        let mut broken = make_rule(
            "broken",
            Severity::Critical,
            RuleAction::Block,
            RuleConditions::AmountThreshold {
                amount_min: Some(10.0),
                amount_max: Some(1.0),
            },
        );
        broken.is_active = true;
        let good = make_rule(
            "good",
            Severity::High,
            RuleAction::Flag,
            RuleConditions::AmountThreshold {
                amount_min: Some(100.0),
                amount_max: None,
            },
        );
        // The snapshot is built directly, bypassing activation checks.
        let snap = RuleSnapshot::new(1, vec![broken, good]);
        let eval = e.evaluate(&make_tx("t", "e", 500.0), &snap, &CollaboratorInputs::none());
        assert_eq!(eval.config_errors.len(), 1);
        assert_eq!(eval.config_errors[0].rule_id, "broken");
        assert_eq!(eval.matched_rule_ids(), vec!["good".to_string()]);
    }

    #[test]
    fn all_rules_are_evaluated() {
        let e = engine();
        let a = make_rule(
            "a",
            Severity::Low,
            RuleAction::Flag,
            RuleConditions::AmountThreshold {
                amount_min: Some(1.0),
                amount_max: None,
            },
        );
        let mut tx = make_tx("t", "e", 5.0);
        tx.counterparty_country = Some("IR".into());
        let b = make_rule(
            "b",
            Severity::High,
            RuleAction::Review,
            RuleConditions::Geographic { countries: vec![] },
        );
        let snap = RuleSnapshot::new(1, vec![a, b, velocity_rule("c")]);
        let eval = e.evaluate(&tx, &snap, &CollaboratorInputs::none());
        assert_eq!(eval.results.len(), 3);
        assert_eq!(eval.matched_rule_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn inactive_rule_leaves_no_velocity_state() {
        let e = engine();
        let mut off = velocity_rule("off");
        off.is_active = false;
        let snap = RuleSnapshot::new(1, vec![off]);
        let tx = make_tx("t", "e", 1.0);
        let eval = e.evaluate(&tx, &snap, &CollaboratorInputs::none());
        assert!(eval.results.is_empty());
        assert_eq!(e.tracker().peek("e", "off", tx.timestamp).count, 0);
        assert_eq!(e.tracker().tracked_windows(), 0);
    }

    #[test]
    fn velocity_count_beyond_window_capacity_is_reported() {
        let e = RuleEngine::new(Arc::new(VelocityTracker::new(3)), Vec::new(), FailClosed::Match);
        let mut rule = velocity_rule("burst");
        rule.conditions = RuleConditions::Velocity {
            transaction_count: 5,
            time_window_minutes: 10,
            volume_min: None,
        };
        let snap = RuleSnapshot::new(1, vec![rule, velocity_rule("ok")]);
        let eval = e.evaluate(&make_tx("t", "e", 1.0), &snap, &CollaboratorInputs::none());
        assert_eq!(eval.config_errors.len(), 1);
        assert_eq!(eval.config_errors[0].rule_id, "burst");
        assert!(eval.config_errors[0].reason.contains("max_window_events"));
        assert_eq!(eval.results.len(), 1);
    }
}
