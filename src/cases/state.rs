//! Case record and its state machine.
//!
//! ```text
//! new → assigned → in_progress → {pending_info, resolved, escalated} → closed
//!                       ↑   pending_info ↵          escalated → assigned
//! ```
//!
//! A [`Case`] has no public setters: every change goes through
//! [`transition`], which either returns the next version of the case or a
//! [`StateTransitionError`] leaving the original untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sla::SlaPolicy;
use crate::error::{CaseError, StateTransitionError};
use crate::rules::{RuleType, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    New,
    Assigned,
    InProgress,
    PendingInfo,
    Escalated,
    Resolved,
    Closed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::New => "new",
            CaseStatus::Assigned => "assigned",
            CaseStatus::InProgress => "in_progress",
            CaseStatus::PendingInfo => "pending_info",
            CaseStatus::Escalated => "escalated",
            CaseStatus::Resolved => "resolved",
            CaseStatus::Closed => "closed",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::Closed)
    }

    /// Still awaiting a resolution, so the SLA clock is running.
    pub fn is_open(&self) -> bool {
        !matches!(self, CaseStatus::Resolved | CaseStatus::Closed)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Approved,
    Rejected,
    Escalated,
    MoreInfoNeeded,
    NoAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    AmountThreshold,
    Velocity,
    Geographic,
    Watchlist,
    Pattern,
    Behavioral,
    Manual,
}

impl From<RuleType> for CaseType {
    fn from(rule_type: RuleType) -> Self {
        match rule_type {
            RuleType::AmountThreshold => CaseType::AmountThreshold,
            RuleType::Velocity => CaseType::Velocity,
            RuleType::Geographic => CaseType::Geographic,
            RuleType::Watchlist => CaseType::Watchlist,
            RuleType::Pattern => CaseType::Pattern,
            RuleType::Behavioral => CaseType::Behavioral,
        }
    }
}

/// Who opened the case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum CaseOrigin {
    Automatic,
    Manual { created_by: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    /// Written by an investigator.
    Investigation,
    /// Written by the workflow itself (escalations, info requests).
    System,
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseNote {
    pub seq: u32,
    pub author: String,
    pub content: String,
    pub kind: NoteKind,
    pub created_at: DateTime<Utc>,
}

/// Input for opening a case.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCase {
    pub case_type: CaseType,
    pub severity: Severity,
    pub origin: CaseOrigin,
    pub summary: String,
    pub related_transaction_id: Option<String>,
    pub related_entity_id: Option<String>,
    pub risk_score: Option<u8>,
    pub matched_rule_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    id: String,
    case_type: CaseType,
    severity: Severity,
    status: CaseStatus,
    origin: CaseOrigin,
    summary: String,
    related_transaction_id: Option<String>,
    related_entity_id: Option<String>,
    risk_score: Option<u8>,
    matched_rule_ids: Vec<String>,
    assigned_to: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sla_due_at: DateTime<Utc>,
    sla_breached: bool,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    resolution: Option<String>,
    resolution_action: Option<ResolutionAction>,
    time_to_resolve_hours: Option<f64>,
    escalation_count: u32,
    notes: Vec<CaseNote>,
}

impl Case {
    /// Build a `new` case with its SLA deadline fixed from severity.
    pub fn open(
        id: String,
        input: NewCase,
        sla: &SlaPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, CaseError> {
        let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        if blank(&input.related_transaction_id) && blank(&input.related_entity_id) {
            return Err(CaseError::Validation {
                field: "related_transaction_id",
                reason: "a case must reference a transaction or an entity".into(),
            });
        }
        if let CaseOrigin::Manual { created_by } = &input.origin {
            if created_by.trim().is_empty() {
                return Err(CaseError::Validation {
                    field: "created_by",
                    reason: "manual cases need a creator".into(),
                });
            }
        }

        Ok(Self {
            id,
            case_type: input.case_type,
            severity: input.severity,
            status: CaseStatus::New,
            origin: input.origin,
            summary: input.summary,
            related_transaction_id: input.related_transaction_id,
            related_entity_id: input.related_entity_id,
            risk_score: input.risk_score,
            matched_rule_ids: input.matched_rule_ids,
            assigned_to: None,
            assigned_at: None,
            created_at: now,
            updated_at: now,
            sla_due_at: sla.due_at(input.severity, now),
            sla_breached: false,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            resolution_action: None,
            time_to_resolve_hours: None,
            escalation_count: 0,
            notes: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn case_type(&self) -> CaseType {
        self.case_type
    }
    pub fn severity(&self) -> Severity {
        self.severity
    }
    pub fn status(&self) -> CaseStatus {
        self.status
    }
    pub fn origin(&self) -> &CaseOrigin {
        &self.origin
    }
    pub fn summary(&self) -> &str {
        &self.summary
    }
    pub fn related_transaction_id(&self) -> Option<&str> {
        self.related_transaction_id.as_deref()
    }
    pub fn related_entity_id(&self) -> Option<&str> {
        self.related_entity_id.as_deref()
    }
    pub fn risk_score(&self) -> Option<u8> {
        self.risk_score
    }
    pub fn matched_rule_ids(&self) -> &[String] {
        &self.matched_rule_ids
    }
    pub fn assigned_to(&self) -> Option<&str> {
        self.assigned_to.as_deref()
    }
    pub fn assigned_at(&self) -> Option<DateTime<Utc>> {
        self.assigned_at
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    pub fn sla_due_at(&self) -> DateTime<Utc> {
        self.sla_due_at
    }
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }
    pub fn resolved_by(&self) -> Option<&str> {
        self.resolved_by.as_deref()
    }
    pub fn resolution(&self) -> Option<&str> {
        self.resolution.as_deref()
    }
    pub fn resolution_action(&self) -> Option<ResolutionAction> {
        self.resolution_action
    }
    pub fn time_to_resolve_hours(&self) -> Option<f64> {
        self.time_to_resolve_hours
    }
    pub fn escalation_count(&self) -> u32 {
        self.escalation_count
    }
    pub fn notes(&self) -> &[CaseNote] {
        &self.notes
    }

    /// Past its deadline while still open. Visibility only: no status change.
    pub fn is_breached(&self, now: DateTime<Utc>) -> bool {
        self.sla_breached || (self.status.is_open() && now > self.sla_due_at)
    }

    /// Whether the breach has already been recorded on the case.
    pub fn breach_recorded(&self) -> bool {
        self.sla_breached
    }

    fn push_note(&mut self, author: &str, content: &str, kind: NoteKind, now: DateTime<Utc>) {
        self.notes.push(CaseNote {
            seq: self.notes.len() as u32,
            author: author.to_string(),
            content: content.to_string(),
            kind,
            created_at: now,
        });
    }

    fn close_out(
        &mut self,
        by: &str,
        resolution: &str,
        action: ResolutionAction,
        now: DateTime<Utc>,
    ) {
        let resolved_at = now.max(self.created_at);
        let hours = (resolved_at - self.created_at).num_milliseconds() as f64 / 3_600_000.0;
        self.resolved_at = Some(resolved_at);
        self.resolved_by = Some(by.to_string());
        self.resolution = Some(resolution.trim().to_string());
        self.resolution_action = Some(action);
        self.time_to_resolve_hours = Some((hours * 100.0).round() / 100.0);
    }

    /// A resolved case sent to a supervisor is no longer resolved.
    fn reopen(&mut self) {
        self.resolved_at = None;
        self.resolved_by = None;
        self.resolution = None;
        self.resolution_action = None;
        self.time_to_resolve_hours = None;
    }
}

/// Everything that can happen to a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaseEvent {
    /// Claim (`to == by`) or assignment by someone else.
    Assign { to: String, by: String },
    AddNote { author: String, content: String },
    RequestInfo { by: String, reason: String },
    InfoReceived { by: String },
    Resolve {
        by: String,
        resolution: String,
        action: ResolutionAction,
    },
    Escalate { to: String, by: String, reason: String },
    Close { by: String },
    /// Dismiss an open case outright, closing it as rejected.
    Reject { by: String, reason: String },
    FlagSlaBreach,
}

impl CaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaseEvent::Assign { .. } => "assign",
            CaseEvent::AddNote { .. } => "add a note to",
            CaseEvent::RequestInfo { .. } => "request info on",
            CaseEvent::InfoReceived { .. } => "resume",
            CaseEvent::Resolve { .. } => "resolve",
            CaseEvent::Escalate { .. } => "escalate",
            CaseEvent::Close { .. } => "close",
            CaseEvent::Reject { .. } => "reject",
            CaseEvent::FlagSlaBreach => "flag an SLA breach on",
        }
    }

    pub fn actor(&self) -> Option<&str> {
        match self {
            CaseEvent::Assign { by, .. }
            | CaseEvent::RequestInfo { by, .. }
            | CaseEvent::InfoReceived { by }
            | CaseEvent::Resolve { by, .. }
            | CaseEvent::Escalate { by, .. }
            | CaseEvent::Close { by }
            | CaseEvent::Reject { by, .. } => Some(by.as_str()),
            CaseEvent::AddNote { author, .. } => Some(author.as_str()),
            CaseEvent::FlagSlaBreach => None,
        }
    }
}

/// The only way a case changes.
pub fn transition(
    case: &Case,
    event: &CaseEvent,
    now: DateTime<Utc>,
) -> Result<Case, StateTransitionError> {
    let from = case.status;
    let reject = |reason: &str| StateTransitionError {
        from,
        event: event.name(),
        reason: reason.to_string(),
    };
    let require = |value: &str, what: &str| {
        if value.trim().is_empty() {
            Err(reject(&format!("{what} must not be empty")))
        } else {
            Ok(())
        }
    };

    if from.is_terminal() {
        return Err(reject("the case is closed"));
    }

    let mut next = case.clone();
    match event {
        CaseEvent::Assign { to, by } => {
            require(to, "assignee")?;
            require(by, "actor")?;
            match from {
                CaseStatus::New if case.assigned_to.is_none() => {}
                CaseStatus::New => return Err(reject("the case is already assigned")),
                CaseStatus::Escalated => {}
                _ => return Err(reject("only new or escalated cases can be assigned")),
            }
            next.status = CaseStatus::Assigned;
            next.assigned_to = Some(to.clone());
            next.assigned_at = Some(now);
        }
        CaseEvent::AddNote { author, content } => {
            require(author, "author")?;
            require(content, "note")?;
            next.push_note(author, content, NoteKind::Investigation, now);
            if from == CaseStatus::Assigned {
                next.status = CaseStatus::InProgress;
            }
        }
        CaseEvent::RequestInfo { by, reason } => {
            require(reason, "reason")?;
            if from != CaseStatus::InProgress {
                return Err(reject("info can only be requested while in progress"));
            }
            next.push_note(by, &format!("Information requested: {reason}"), NoteKind::System, now);
            next.status = CaseStatus::PendingInfo;
        }
        CaseEvent::InfoReceived { by } => {
            if from != CaseStatus::PendingInfo {
                return Err(reject("the case is not waiting for information"));
            }
            next.push_note(by, "Requested information received", NoteKind::System, now);
            next.status = CaseStatus::InProgress;
        }
        CaseEvent::Resolve {
            by,
            resolution,
            action,
        } => {
            require(by, "resolver")?;
            require(resolution, "resolution")?;
            if !matches!(from, CaseStatus::InProgress | CaseStatus::PendingInfo) {
                return Err(reject("only in-progress or pending cases can be resolved"));
            }
            next.close_out(by, resolution, *action, now);
            next.status = CaseStatus::Resolved;
        }
        CaseEvent::Escalate { to, by, reason } => {
            require(to, "supervisor")?;
            require(reason, "reason")?;
            if case.assigned_to.as_deref() == Some(to.as_str()) {
                return Err(reject("the supervisor is already the assignee"));
            }
            let previous = case.assigned_to.as_deref().unwrap_or("nobody");
            next.push_note(
                by,
                &format!("Escalated from {previous} to {to}: {reason}"),
                NoteKind::System,
                now,
            );
            if from == CaseStatus::Resolved {
                next.reopen();
            }
            next.status = CaseStatus::Escalated;
            next.assigned_to = Some(to.clone());
            next.assigned_at = Some(now);
            next.escalation_count += 1;
        }
        CaseEvent::Close { by } => {
            require(by, "actor")?;
            if from != CaseStatus::Resolved {
                return Err(reject("only resolved cases can be closed"));
            }
            next.status = CaseStatus::Closed;
        }
        CaseEvent::Reject { by, reason } => {
            require(by, "actor")?;
            require(reason, "reason")?;
            if from == CaseStatus::Resolved {
                return Err(reject("a resolved case can only be closed"));
            }
            next.close_out(by, reason, ResolutionAction::Rejected, now);
            next.status = CaseStatus::Closed;
        }
        CaseEvent::FlagSlaBreach => {
            if !from.is_open() {
                return Err(reject("the case is no longer open"));
            }
            next.sla_breached = true;
        }
    }

    next.updated_at = now;
    Ok(next)
}
