pub mod sla;
pub mod state;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditKind, AuditTrail};
use crate::db::{CaseRow, NoteRow, SharedDatabase};
use crate::error::CaseError;
use crate::notifications::Notifier;
use crate::rules::Severity;
use sla::SlaPolicy;
use state::{Case, CaseEvent, CaseStatus, NewCase, ResolutionAction, transition};

/// Actor recorded for transitions the workflow performs on its own.
pub const SYSTEM_ACTOR: &str = "system";

/// Result of racing to claim an unassigned case. Losing is an expected
/// outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Case),
    AlreadyClaimed { assigned_to: String },
}

/// All set fields must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseFilter {
    pub status: Option<CaseStatus>,
    pub severity: Option<Severity>,
    pub assigned_to: Option<String>,
    pub breached: Option<bool>,
}

impl CaseFilter {
    fn matches(&self, case: &Case, now: DateTime<Utc>) -> bool {
        self.status.is_none_or(|s| case.status() == s)
            && self.severity.is_none_or(|s| case.severity() == s)
            && self
                .assigned_to
                .as_deref()
                .is_none_or(|who| case.assigned_to() == Some(who))
            && self.breached.is_none_or(|b| case.is_breached(now) == b)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaseStats {
    pub total: usize,
    pub open: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub breached: usize,
    pub avg_time_to_resolve_hours: Option<f64>,
}

/// Owns every case, serialises changes per case and records each one.
pub struct CaseManager {
    cases: DashMap<String, Case>,
    sla: SlaPolicy,
    supervisors: Vec<String>,
    auto_assign: Vec<String>,
    next_assignee: AtomicUsize,
    audit: Arc<AuditTrail>,
    db: Option<SharedDatabase>,
    notifier: Option<Arc<Notifier>>,
}

impl CaseManager {
    pub fn new(sla: SlaPolicy, audit: Arc<AuditTrail>) -> Self {
        Self {
            cases: DashMap::new(),
            sla,
            supervisors: Vec::new(),
            auto_assign: Vec::new(),
            next_assignee: AtomicUsize::new(0),
            audit,
            db: None,
            notifier: None,
        }
    }

    pub fn with_db(mut self, db: SharedDatabase) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_supervisors(mut self, supervisors: Vec<String>) -> Self {
        self.supervisors = supervisors;
        self
    }

    pub fn with_auto_assign(mut self, investigators: Vec<String>) -> Self {
        self.auto_assign = investigators;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Restore cases saved by a previous run. Unreadable rows are skipped.
    pub fn load_from_db(&self) -> Result<usize, CaseError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut loaded = 0;
        for body in db.load_case_bodies()? {
            match serde_json::from_str::<Case>(&body) {
                Ok(case) => {
                    self.cases.insert(case.id().to_string(), case);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping unreadable stored case: {e}"),
            }
        }
        info!("Loaded {loaded} cases from database");
        Ok(loaded)
    }

    /// Open a case. The case is durable once this returns, whatever happens
    /// to the request that caused it.
    pub fn open_case(&self, input: NewCase, now: DateTime<Utc>) -> Result<Case, CaseError> {
        let id = uuid::Uuid::new_v4().to_string();
        let case = Case::open(id.clone(), input, &self.sla, now)?;
        self.persist(&case)?;
        self.cases.insert(id.clone(), case.clone());

        self.audit.record(
            AuditKind::CaseOpened,
            &id,
            match case.origin() {
                state::CaseOrigin::Manual { created_by } => Some(created_by.as_str()),
                state::CaseOrigin::Automatic => None,
            },
            json!({
                "severity": case.severity(),
                "case_type": case.case_type(),
                "transaction_id": case.related_transaction_id(),
                "entity_id": case.related_entity_id(),
                "rule_ids": case.matched_rule_ids(),
                "sla_due_at": case.sla_due_at(),
            }),
        );
        info!(case_id = %id, severity = %case.severity(), "Case opened");

        if let Some(notifier) = &self.notifier {
            notifier.notify_case_opened(&case);
        }

        let Some(to) = self.pick_assignee() else {
            return Ok(case);
        };
        let event = CaseEvent::Assign {
            to,
            by: SYSTEM_ACTOR.into(),
        };
        // The case already exists; a failed auto-assign leaves it in the queue.
        match self.apply(&id, event, now) {
            Ok(assigned) => Ok(assigned),
            Err(e) => {
                warn!(case_id = %id, "Auto-assign failed, case left unassigned: {e}");
                Ok(case)
            }
        }
    }

    fn pick_assignee(&self) -> Option<String> {
        if self.auto_assign.is_empty() {
            return None;
        }
        let n = self.next_assignee.fetch_add(1, Ordering::Relaxed);
        Some(self.auto_assign[n % self.auto_assign.len()].clone())
    }

    /// Apply one event. On any error the stored case is unchanged.
    pub fn apply(&self, id: &str, event: CaseEvent, now: DateTime<Utc>) -> Result<Case, CaseError> {
        let mut entry = self
            .cases
            .get_mut(id)
            .ok_or_else(|| CaseError::NotFound(id.to_string()))?;
        self.commit(&mut entry, &event, now)
    }

    /// Runs under the per-case entry lock so concurrent events on one case
    /// are applied one at a time.
    fn commit(&self, case: &mut Case, event: &CaseEvent, now: DateTime<Utc>) -> Result<Case, CaseError> {
        let from = case.status();
        let next = transition(case, event, now).inspect_err(|e| {
            debug!(case_id = %case.id(), "Transition rejected: {e}");
        })?;
        self.persist(&next)?;
        *case = next.clone();

        self.audit.record(
            AuditKind::CaseTransition,
            next.id(),
            event.actor(),
            json!({
                "event": event,
                "from": from,
                "to": next.status(),
                "assigned_to": next.assigned_to(),
            }),
        );
        info!(
            case_id = %next.id(),
            from = %from,
            to = %next.status(),
            actor = event.actor().unwrap_or(SYSTEM_ACTOR),
            "Case transition"
        );
        Ok(next)
    }

    /// Compare-and-swap on the assignee: succeeds only while the case has
    /// no owner. Exactly one of any number of concurrent claims wins.
    pub fn claim(&self, id: &str, by: &str, now: DateTime<Utc>) -> Result<ClaimOutcome, CaseError> {
        let mut entry = self
            .cases
            .get_mut(id)
            .ok_or_else(|| CaseError::NotFound(id.to_string()))?;
        if let Some(owner) = entry.assigned_to() {
            debug!(case_id = %id, claimant = by, owner, "Claim lost");
            return Ok(ClaimOutcome::AlreadyClaimed {
                assigned_to: owner.to_string(),
            });
        }
        let event = CaseEvent::Assign {
            to: by.to_string(),
            by: by.to_string(),
        };
        self.commit(&mut entry, &event, now).map(ClaimOutcome::Claimed)
    }

    pub fn assign(&self, id: &str, to: &str, by: &str, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.apply(
            id,
            CaseEvent::Assign {
                to: to.into(),
                by: by.into(),
            },
            now,
        )
    }

    pub fn add_note(&self, id: &str, author: &str, content: &str, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.apply(
            id,
            CaseEvent::AddNote {
                author: author.into(),
                content: content.into(),
            },
            now,
        )
    }

    pub fn request_info(&self, id: &str, by: &str, reason: &str, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.apply(
            id,
            CaseEvent::RequestInfo {
                by: by.into(),
                reason: reason.into(),
            },
            now,
        )
    }

    pub fn info_received(&self, id: &str, by: &str, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.apply(id, CaseEvent::InfoReceived { by: by.into() }, now)
    }

    pub fn resolve(
        &self,
        id: &str,
        by: &str,
        resolution: &str,
        action: ResolutionAction,
        now: DateTime<Utc>,
    ) -> Result<Case, CaseError> {
        self.apply(
            id,
            CaseEvent::Resolve {
                by: by.into(),
                resolution: resolution.into(),
                action,
            },
            now,
        )
    }

    /// Hand the case to a supervisor. An explicit target must be one of the
    /// configured supervisors; without one the first supervisor who is not
    /// the current assignee is used.
    pub fn escalate(
        &self,
        id: &str,
        by: &str,
        reason: &str,
        to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Case, CaseError> {
        let mut entry = self
            .cases
            .get_mut(id)
            .ok_or_else(|| CaseError::NotFound(id.to_string()))?;
        let target = match to {
            Some(to) if self.supervisors.iter().any(|s| s == to) => to.to_string(),
            Some(to) => {
                return Err(CaseError::Validation {
                    field: "to",
                    reason: format!("{to} is not a supervisor"),
                });
            }
            None => self
                .supervisors
                .iter()
                .find(|s| entry.assigned_to() != Some(s.as_str()))
                .cloned()
                .ok_or_else(|| CaseError::NoSupervisor {
                    case_id: id.to_string(),
                })?,
        };
        let event = CaseEvent::Escalate {
            to: target,
            by: by.into(),
            reason: reason.into(),
        };
        self.commit(&mut entry, &event, now)
    }

    pub fn close(&self, id: &str, by: &str, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.apply(id, CaseEvent::Close { by: by.into() }, now)
    }

    pub fn reject(&self, id: &str, by: &str, reason: &str, now: DateTime<Utc>) -> Result<Case, CaseError> {
        self.apply(
            id,
            CaseEvent::Reject {
                by: by.into(),
                reason: reason.into(),
            },
            now,
        )
    }

    pub fn get(&self, id: &str) -> Option<Case> {
        self.cases.get(id).map(|c| c.value().clone())
    }

    /// Cases opened for one transaction.
    pub fn for_transaction(&self, tx_id: &str) -> Vec<Case> {
        let mut found: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| c.related_transaction_id() == Some(tx_id))
            .map(|c| c.value().clone())
            .collect();
        found.sort_by_key(|c| c.created_at());
        found
    }

    /// Matching cases, oldest first.
    pub fn list(&self, filter: &CaseFilter, now: DateTime<Utc>) -> Vec<Case> {
        let mut found: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| filter.matches(c, now))
            .map(|c| c.value().clone())
            .collect();
        found.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(b.id())));
        found
    }

    pub fn stats(&self, now: DateTime<Utc>) -> CaseStats {
        let mut stats = CaseStats::default();
        let mut resolve_hours = Vec::new();
        for case in self.cases.iter() {
            stats.total += 1;
            if case.status().is_open() {
                stats.open += 1;
            }
            if case.is_breached(now) {
                stats.breached += 1;
            }
            *stats.by_status.entry(case.status().to_string()).or_default() += 1;
            *stats.by_severity.entry(case.severity().to_string()).or_default() += 1;
            if let Some(h) = case.time_to_resolve_hours() {
                resolve_hours.push(h);
            }
        }
        if !resolve_hours.is_empty() {
            let mean = resolve_hours.iter().sum::<f64>() / resolve_hours.len() as f64;
            stats.avg_time_to_resolve_hours = Some((mean * 100.0).round() / 100.0);
        }
        stats
    }

    /// Record a breach on every open case past its deadline. Status is not
    /// changed. Returns the newly breached cases.
    pub fn sweep_sla(&self, now: DateTime<Utc>) -> Vec<Case> {
        // Ids first: mutating while iterating a DashMap shard deadlocks.
        let due: Vec<String> = self
            .cases
            .iter()
            .filter(|c| c.is_breached(now) && !c.breach_recorded())
            .map(|c| c.id().to_string())
            .collect();

        let mut breached = Vec::new();
        for id in due {
            match self.apply(&id, CaseEvent::FlagSlaBreach, now) {
                Ok(case) => {
                    warn!(
                        case_id = %id,
                        severity = %case.severity(),
                        due = %case.sla_due_at(),
                        "SLA breached"
                    );
                    if let Some(notifier) = &self.notifier {
                        notifier.notify_sla_breach(&case);
                    }
                    breached.push(case);
                }
                // Resolved between the scan and the update.
                Err(CaseError::Transition(e)) => debug!(case_id = %id, "SLA flag skipped: {e}"),
                Err(e) => warn!(case_id = %id, "Failed to record SLA breach: {e}"),
            }
        }
        breached
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    fn persist(&self, case: &Case) -> Result<(), CaseError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let row = CaseRow {
            id: case.id().to_string(),
            status: case.status().as_str().to_string(),
            severity: case.severity().as_str().to_string(),
            assigned_to: case.assigned_to().map(str::to_string),
            created_at: case.created_at().to_rfc3339(),
            sla_due_at: case.sla_due_at().to_rfc3339(),
            body: serde_json::to_string(case)?,
        };
        let notes: Vec<NoteRow> = case
            .notes()
            .iter()
            .map(|n| NoteRow {
                seq: n.seq,
                author: n.author.clone(),
                content: n.content.clone(),
                created_at: n.created_at.to_rfc3339(),
            })
            .collect();
        db.save_case(&row, &notes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::state::tests::{new_case, t0};
    use crate::cases::state::{CaseOrigin, CaseType};
    use chrono::Duration;
    use std::sync::atomic::AtomicU64;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_db_path() -> std::path::PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "txsentinel_cases_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn temp_db() -> SharedDatabase {
        SharedDatabase::open(&temp_db_path()).unwrap()
    }

    fn manager() -> CaseManager {
        CaseManager::new(SlaPolicy::default(), Arc::new(AuditTrail::new(1000, None)))
            .with_supervisors(vec!["sup-1".into(), "sup-2".into()])
    }

    fn work(mgr: &CaseManager, id: &str, who: &str) {
        mgr.claim(id, who, t0()).unwrap();
        mgr.add_note(id, who, "reviewing counterparty", t0() + Duration::minutes(10))
            .unwrap();
    }

    #[test]
    fn critical_case_breaches_but_stays_in_progress() {
        let mgr = manager();
        let case = mgr.open_case(new_case(Severity::Critical), t0()).unwrap();
        assert_eq!(case.sla_due_at(), t0() + Duration::hours(2));
        work(&mgr, case.id(), "ann");

        assert!(mgr.sweep_sla(t0() + Duration::hours(1)).is_empty());
        let breached = mgr.sweep_sla(t0() + Duration::hours(3));
        assert_eq!(breached.len(), 1);

        let case = mgr.get(case.id()).unwrap();
        assert!(case.is_breached(t0() + Duration::hours(3)));
        assert_eq!(case.status(), CaseStatus::InProgress);

        // Already recorded: a second sweep is quiet.
        assert!(mgr.sweep_sla(t0() + Duration::hours(4)).is_empty());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let mgr = manager();
        let id = mgr.open_case(new_case(Severity::High), t0()).unwrap().id().to_string();

        let outcomes: Vec<ClaimOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let mgr = &mgr;
                    let id = id.as_str();
                    s.spawn(move || mgr.claim(id, &format!("admin-{i}"), t0()).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<&Case> = outcomes
            .iter()
            .filter_map(|o| match o {
                ClaimOutcome::Claimed(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1);
        let owner = winners[0].assigned_to().unwrap().to_string();
        for o in &outcomes {
            if let ClaimOutcome::AlreadyClaimed { assigned_to } = o {
                assert_eq!(assigned_to, &owner);
            }
        }
        let stored = mgr.get(&id).unwrap();
        assert_eq!(stored.status(), CaseStatus::Assigned);
        assert_eq!(stored.assigned_to(), Some(owner.as_str()));
    }

    #[test]
    fn losing_claim_is_not_an_error() {
        let mgr = manager();
        let id = mgr.open_case(new_case(Severity::Low), t0()).unwrap().id().to_string();
        assert!(matches!(mgr.claim(&id, "ann", t0()).unwrap(), ClaimOutcome::Claimed(_)));
        assert_eq!(
            mgr.claim(&id, "bob", t0()).unwrap(),
            ClaimOutcome::AlreadyClaimed {
                assigned_to: "ann".into()
            }
        );
    }

    #[test]
    fn illegal_transition_leaves_case_unchanged() {
        let mgr = manager();
        let id = mgr.open_case(new_case(Severity::Medium), t0()).unwrap().id().to_string();
        work(&mgr, &id, "ann");
        mgr.resolve(&id, "ann", "benign", ResolutionAction::Approved, t0() + Duration::hours(1))
            .unwrap();
        mgr.close(&id, "ann", t0() + Duration::hours(2)).unwrap();
        let before = mgr.get(&id).unwrap();

        let err = mgr
            .resolve(&id, "ann", "again", ResolutionAction::Approved, t0() + Duration::hours(3))
            .unwrap_err();
        assert!(matches!(err, CaseError::Transition(_)));
        assert_eq!(mgr.get(&id).unwrap(), before);
    }

    #[test]
    fn escalate_picks_supervisor_other_than_assignee() {
        let mgr = manager();
        let id = mgr.open_case(new_case(Severity::High), t0()).unwrap().id().to_string();
        mgr.claim(&id, "sup-1", t0()).unwrap();
        mgr.add_note(&id, "sup-1", "needs a second look", t0()).unwrap();
        let case = mgr.escalate(&id, "sup-1", "conflict of interest", None, t0()).unwrap();
        assert_eq!(case.assigned_to(), Some("sup-2"));
        assert_eq!(case.status(), CaseStatus::Escalated);
    }

    #[test]
    fn escalate_to_non_supervisor_is_refused() {
        let mgr = manager();
        let id = mgr.open_case(new_case(Severity::High), t0()).unwrap().id().to_string();
        work(&mgr, &id, "ann");
        let before = mgr.get(&id).unwrap();

        let err = mgr
            .escalate(&id, "ann", "help", Some("random-intern"), t0())
            .unwrap_err();
        assert!(matches!(err, CaseError::Validation { field: "to", .. }));
        assert_eq!(mgr.get(&id).unwrap(), before);

        let case = mgr.escalate(&id, "ann", "help", Some("sup-2"), t0()).unwrap();
        assert_eq!(case.assigned_to(), Some("sup-2"));
    }

    #[test]
    fn resolved_case_can_be_escalated() {
        let mgr = manager();
        let id = mgr.open_case(new_case(Severity::Medium), t0()).unwrap().id().to_string();
        work(&mgr, &id, "ann");
        mgr.resolve(&id, "ann", "benign", ResolutionAction::Approved, t0() + Duration::hours(1))
            .unwrap();
        let case = mgr
            .escalate(&id, "qa", "resolution disputed", None, t0() + Duration::hours(2))
            .unwrap();
        assert_eq!(case.status(), CaseStatus::Escalated);
        assert_eq!(case.assigned_to(), Some("sup-1"));
        assert_eq!(case.resolved_at(), None);
    }

    #[test]
    fn escalate_without_supervisors_fails() {
        let mgr = CaseManager::new(SlaPolicy::default(), Arc::new(AuditTrail::new(10, None)));
        let id = mgr.open_case(new_case(Severity::High), t0()).unwrap().id().to_string();
        assert!(matches!(
            mgr.escalate(&id, "ann", "help", None, t0()),
            Err(CaseError::NoSupervisor { .. })
        ));
    }

    #[test]
    fn auto_assign_round_robin() {
        let mgr = manager().with_auto_assign(vec!["ann".into(), "bob".into()]);
        let owners: Vec<String> = (0..4)
            .map(|_| {
                mgr.open_case(new_case(Severity::Low), t0())
                    .unwrap()
                    .assigned_to()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(owners, vec!["ann", "bob", "ann", "bob"]);
    }

    #[test]
    fn failed_auto_assign_still_returns_the_case() {
        let path = temp_db_path();
        let db = SharedDatabase::open(&path).unwrap();
        // Inserts go through, every later save of a case fails.
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER cases_frozen BEFORE UPDATE ON cases
                 BEGIN SELECT RAISE(ABORT, 'cases are frozen'); END;",
            )
            .unwrap();
        let mgr = manager()
            .with_db(db.clone())
            .with_auto_assign(vec!["ann".into()]);

        let case = mgr.open_case(new_case(Severity::High), t0()).unwrap();
        assert_eq!(case.status(), CaseStatus::New);
        assert_eq!(case.assigned_to(), None);
        assert_eq!(mgr.get(case.id()).unwrap(), case);
        assert_eq!(db.load_case_bodies().unwrap().len(), 1);
    }

    #[test]
    fn manual_case_records_creator() {
        let audit = Arc::new(AuditTrail::new(100, None));
        let mgr = CaseManager::new(SlaPolicy::default(), audit.clone());
        let mut input = new_case(Severity::Medium);
        input.case_type = CaseType::Manual;
        input.origin = CaseOrigin::Manual {
            created_by: "ann".into(),
        };
        let case = mgr.open_case(input, t0()).unwrap();
        let entries = audit.for_subject(case.id());
        assert_eq!(entries[0].kind, AuditKind::CaseOpened);
        assert_eq!(entries[0].actor.as_deref(), Some("ann"));
    }

    #[test]
    fn every_transition_is_audited() {
        let audit = Arc::new(AuditTrail::new(100, None));
        let mgr = CaseManager::new(SlaPolicy::default(), audit.clone());
        let id = mgr.open_case(new_case(Severity::Low), t0()).unwrap().id().to_string();
        work(&mgr, &id, "ann");
        let _ = mgr.close(&id, "ann", t0());
        let kinds: Vec<AuditKind> = audit.for_subject(&id).iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![AuditKind::CaseOpened, AuditKind::CaseTransition, AuditKind::CaseTransition]
        );
    }

    #[test]
    fn list_filters_and_stats() {
        let mgr = manager();
        let a = mgr.open_case(new_case(Severity::Critical), t0()).unwrap();
        let b = mgr
            .open_case(new_case(Severity::Low), t0() + Duration::minutes(1))
            .unwrap();
        work(&mgr, b.id(), "ann");
        mgr.resolve(b.id(), "ann", "ok", ResolutionAction::NoAction, t0() + Duration::hours(3))
            .unwrap();

        let now = t0() + Duration::hours(5);
        let open = mgr.list(
            &CaseFilter {
                status: Some(CaseStatus::New),
                ..CaseFilter::default()
            },
            now,
        );
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id(), a.id());

        let anns = mgr.list(
            &CaseFilter {
                assigned_to: Some("ann".into()),
                ..CaseFilter::default()
            },
            now,
        );
        assert_eq!(anns[0].id(), b.id());

        let breached = mgr.list(
            &CaseFilter {
                breached: Some(true),
                ..CaseFilter::default()
            },
            now,
        );
        assert_eq!(breached.len(), 1);

        let all = mgr.list(&CaseFilter::default(), now);
        assert_eq!(all[0].id(), a.id());

        let stats = mgr.stats(now);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.breached, 1);
        assert_eq!(stats.by_status.get("resolved"), Some(&1));
        assert_eq!(stats.avg_time_to_resolve_hours, Some(2.98));
    }

    #[test]
    fn unknown_case_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.claim("nope", "ann", t0()), Err(CaseError::NotFound(_))));
    }

    #[test]
    fn cases_survive_restart() {
        let db = temp_db();
        let audit = Arc::new(AuditTrail::new(100, Some(db.clone())));
        let mgr = CaseManager::new(SlaPolicy::default(), audit.clone()).with_db(db.clone());
        let id = mgr.open_case(new_case(Severity::High), t0()).unwrap().id().to_string();
        work(&mgr, &id, "ann");

        let restored = CaseManager::new(SlaPolicy::default(), audit).with_db(db.clone());
        assert_eq!(restored.load_from_db().unwrap(), 1);
        let case = restored.get(&id).unwrap();
        assert_eq!(case.status(), CaseStatus::InProgress);
        assert_eq!(case.notes().len(), 1);
        assert_eq!(db.case_notes(&id).unwrap().len(), 1);
        assert!(db.audit_count().unwrap() >= 3);
    }
}
