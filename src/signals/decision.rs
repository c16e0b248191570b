use crate::core::{Action, RuleMatch};
use crate::rules::RuleAction;

/// Score thresholds for the numeric part of the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub block_threshold: u8,
    pub flag_threshold: u8,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            block_threshold: 75,
            flag_threshold: 50,
        }
    }
}

impl DecisionPolicy {
    /// Precedence: explicit block, then score thresholds, then explicit
    /// review, then approve.
    pub fn decide(&self, score: u8, matches: &[RuleMatch]) -> Action {
        let wants = |action: RuleAction| matches.iter().any(|m| m.matched && m.action == action);

        if wants(RuleAction::Block) || score >= self.block_threshold {
            Action::Block
        } else if score >= self.flag_threshold {
            Action::Flag
        } else if wants(RuleAction::Review) {
            Action::Review
        } else {
            Action::Approve
        }
    }
}

/// Decide with the default thresholds (block ≥75, flag ≥50).
pub fn decide(score: u8, matches: &[RuleMatch]) -> Action {
    DecisionPolicy::default().decide(score, matches)
}
