use thiserror::Error;

use crate::cases::state::CaseStatus;

/// A rule whose conditions are not structurally valid for its type.
/// The engine skips such a rule and keeps evaluating the rest.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rule {rule_id}: {reason}")]
pub struct ConfigurationError {
    pub rule_id: String,
    pub reason: String,
}

impl ConfigurationError {
    pub fn new(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }
}

/// Ingestion rejected a transaction. Nothing was processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transaction field `{field}`: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn missing(field: &'static str) -> Self {
        Self {
            field,
            reason: "required field is missing".into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure talking to an external screening or enrichment service.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{service} did not answer within {timeout_ms}ms")]
    Timeout { service: &'static str, timeout_ms: u64 },
    #[error("{service} is not configured")]
    Unavailable { service: &'static str },
    #[error("HTTP error from {service}: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response from {service}: {reason}")]
    Protocol { service: &'static str, reason: String },
}

/// An illegal case transition. The case is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {event} a case in status {from}: {reason}")]
pub struct StateTransitionError {
    pub from: CaseStatus,
    pub event: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CaseError {
    #[error("case not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] StateTransitionError),
    #[error("invalid case input `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("no supervisor available to take case {case_id}")]
    NoSupervisor { case_id: String },
    #[error("case storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("case encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("rule already exists: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("rule storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Why a screening request produced no outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScreeningError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),
    #[error("screening cancelled before a decision was committed")]
    Cancelled,
}

/// Top-level failures surfaced by the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rules(#[from] RuleStoreError),
    #[error(transparent)]
    Cases(#[from] CaseError),
}
