use std::collections::HashSet;

use serde_json::json;

use super::FailClosed;
use crate::collaborators::{CollaboratorInputs, Lookup};
use crate::core::velocity::VelocityTracker;
use crate::core::{RuleMatch, Transaction};
use crate::rules::{Rule, RuleAction, RuleConditions};

/// Everything a single rule may look at.
pub struct EvalContext<'a> {
    pub tx: &'a Transaction,
    pub tracker: &'a VelocityTracker,
    pub inputs: &'a CollaboratorInputs,
    pub high_risk_countries: &'a HashSet<String>,
    pub fail_closed: FailClosed,
}

/// Evaluate one (already validated) rule. Velocity rules record the
/// transaction in their window as part of evaluation.
pub fn evaluate_rule(rule: &Rule, ctx: &EvalContext<'_>) -> RuleMatch {
    match &rule.conditions {
        RuleConditions::AmountThreshold {
            amount_min,
            amount_max,
        } => {
            let amount = ctx.tx.amount;
            let above_min = amount_min.is_none_or(|min| amount >= min);
            let below_max = amount_max.is_none_or(|max| amount <= max);
            outcome(
                rule,
                above_min && below_max,
                json!({
                    "amount": amount,
                    "currency": ctx.tx.currency,
                    "amount_min": amount_min,
                    "amount_max": amount_max,
                }),
            )
        }
        RuleConditions::Velocity {
            transaction_count,
            time_window_minutes,
            volume_min,
        } => {
            let window = chrono::Duration::minutes(i64::from(*time_window_minutes));
            let stats = ctx.tracker.record(
                &ctx.tx.origin_entity_id,
                &rule.id,
                ctx.tx.timestamp,
                ctx.tx.amount,
                window,
            );
            let by_count = stats.count >= *transaction_count as usize;
            let by_volume = volume_min.is_some_and(|v| stats.volume >= v);
            outcome(
                rule,
                by_count || by_volume,
                json!({
                    "entity_id": ctx.tx.origin_entity_id,
                    "count": stats.count,
                    "volume": stats.volume,
                    "transaction_count": transaction_count,
                    "volume_min": volume_min,
                    "time_window_minutes": time_window_minutes,
                }),
            )
        }
        RuleConditions::Geographic { countries } => {
            let Some(country) = ctx.tx.counterparty_country.as_deref() else {
                return outcome(rule, false, json!({ "reason": "no counterparty country" }));
            };
            let listed = if countries.is_empty() {
                ctx.high_risk_countries.contains(country)
            } else {
                countries.iter().any(|c| c.trim().eq_ignore_ascii_case(country))
            };
            outcome(rule, listed, json!({ "counterparty_country": country }))
        }
        RuleConditions::Watchlist { min_confidence } => match &ctx.inputs.watchlist {
            Lookup::Answered(result) => outcome(
                rule,
                result.hit && result.confidence >= *min_confidence,
                json!({
                    "hit": result.hit,
                    "confidence": result.confidence,
                    "min_confidence": min_confidence,
                    "list": result.list,
                }),
            ),
            Lookup::Failed(reason) => fail_closed(rule, ctx.fail_closed, reason),
            Lookup::NotRequested => fail_closed(rule, ctx.fail_closed, "watchlist was not screened"),
        },
        RuleConditions::Pattern { signal, threshold }
        | RuleConditions::Behavioral { signal, threshold } => {
            let from_provider = ctx
                .inputs
                .enrichment
                .answer()
                .and_then(|signals| signals.get(signal).copied());
            match from_provider.or_else(|| ctx.tx.signal(signal)) {
                Some(value) => outcome(
                    rule,
                    value >= *threshold,
                    json!({ "signal": signal, "value": value, "threshold": threshold }),
                ),
                None => match ctx.inputs.enrichment.failure() {
                    Some(reason) => fail_closed(rule, ctx.fail_closed, reason),
                    None => outcome(
                        rule,
                        false,
                        json!({ "signal": signal, "reason": "signal not supplied" }),
                    ),
                },
            }
        }
    }
}

fn outcome(rule: &Rule, matched: bool, evidence: serde_json::Value) -> RuleMatch {
    RuleMatch {
        rule_id: rule.id.clone(),
        matched,
        severity: rule.severity,
        action: rule.action,
        auto_create_case: rule.auto_create_case,
        evidence,
    }
}

/// A check we could not perform counts as matched.
fn fail_closed(rule: &Rule, mode: FailClosed, reason: &str) -> RuleMatch {
    let action = match (mode, rule.action) {
        (_, RuleAction::Block) => RuleAction::Block,
        (FailClosed::Review, _) => RuleAction::Review,
        (FailClosed::Match, action) => action,
    };
    RuleMatch {
        rule_id: rule.id.clone(),
        matched: true,
        severity: rule.severity,
        action,
        auto_create_case: rule.auto_create_case,
        evidence: json!({ "fail_closed": true, "reason": reason }),
    }
}
