pub mod pipeline;
pub mod velocity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ValidationError;
use crate::rules::{RuleAction, Severity};

/// A validated transaction. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub amount: f64,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub origin_entity_id: String,
    pub counterparty_id: Option<String>,
    pub counterparty_name: Option<String>,
    /// ISO 3166 alpha-2, upper-cased at ingestion.
    pub counterparty_country: Option<String>,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    /// Enrichment supplied by the ingestion side (device, behavioral, ...).
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Transaction {
    /// Numeric view of an enrichment attribute: numbers as-is, bools as 0/1.
    pub fn signal(&self, name: &str) -> Option<f64> {
        signal_value(self.attributes.get(name)?)
    }
}

pub(crate) fn signal_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Transaction as received on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTransaction {
    pub id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub origin_entity_id: Option<String>,
    pub counterparty_id: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_country: Option<String>,
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(_) => Err(ValidationError::invalid(field, "must not be blank")),
        None => Err(ValidationError::missing(field)),
    }
}

impl RawTransaction {
    /// Check every required field. A rejected transaction touches no state.
    pub fn validate(self) -> Result<Transaction, ValidationError> {
        let id = required(self.id, "id")?;
        let amount = self.amount.ok_or_else(|| ValidationError::missing("amount"))?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(ValidationError::invalid(
                "amount",
                "must be a finite, non-negative number",
            ));
        }
        let currency = required(self.currency, "currency")?;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::invalid("currency", "must be a 3-letter ISO code"));
        }
        let timestamp = self
            .timestamp
            .ok_or_else(|| ValidationError::missing("timestamp"))?;
        let origin_entity_id = required(self.origin_entity_id, "origin_entity_id")?;

        Ok(Transaction {
            id,
            amount,
            currency: currency.to_ascii_uppercase(),
            timestamp,
            origin_entity_id,
            counterparty_id: self.counterparty_id,
            counterparty_name: self.counterparty_name,
            counterparty_country: self
                .counterparty_country
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty()),
            device_fingerprint: self.device_fingerprint,
            ip_address: self.ip_address,
            attributes: self.attributes,
        })
    }
}

/// Outcome of one rule against one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub matched: bool,
    pub severity: Severity,
    pub action: RuleAction,
    pub auto_create_case: bool,
    pub evidence: serde_json::Value,
}

/// Final disposition for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Flag,
    Block,
    Review,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Flag => "flag",
            Action::Block => "block",
            Action::Review => "review",
        }
    }
}

/// What ingestion returns to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningOutcome {
    pub transaction_id: String,
    pub action: Action,
    pub risk_score: u8,
    pub matched_rule_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// Rules skipped because their conditions were malformed.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped_rule_ids: Vec<String>,
}
