use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{RuleMatch, Transaction};
use crate::rules::Severity;

/// Composite score plus the matches that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// 0-100.
    pub score: u8,
    pub top_severity: Option<Severity>,
    /// Every match at the top severity, kept for audit.
    pub top_rule_ids: Vec<String>,
}

/// Score is the highest severity weight among matched rules, never a sum.
pub fn score(tx: &Transaction, matches: &[RuleMatch]) -> RiskScore {
    let top_severity = matches
        .iter()
        .filter(|m| m.matched)
        .map(|m| m.severity)
        .max();

    let (score, top_rule_ids) = match top_severity {
        Some(top) => (
            top.weight().min(100),
            matches
                .iter()
                .filter(|m| m.matched && m.severity == top)
                .map(|m| m.rule_id.clone())
                .collect(),
        ),
        None => (0, Vec::new()),
    };

    debug!(tx_id = %tx.id, score, "Risk scored");
    RiskScore {
        score,
        top_severity,
        top_rule_ids,
    }
}
