use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::db::SharedDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    RuleMatched,
    RuleSkipped,
    TransactionScreened,
    TransactionRejected,
    CaseOpened,
    CaseTransition,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::RuleMatched => "rule_matched",
            AuditKind::RuleSkipped => "rule_skipped",
            AuditKind::TransactionScreened => "transaction_screened",
            AuditKind::TransactionRejected => "transaction_rejected",
            AuditKind::CaseOpened => "case_opened",
            AuditKind::CaseTransition => "case_transition",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    /// Transaction or case id.
    pub subject_id: String,
    pub actor: Option<String>,
    pub detail: serde_json::Value,
}

struct Recent {
    entries: VecDeque<AuditEntry>,
    next_seq: u64,
}

/// Append-only record of rule matches, decisions and case transitions.
///
/// Entries are written once to the database and never updated. The
/// in-memory view keeps only the most recent `capacity` entries.
pub struct AuditTrail {
    recent: Mutex<Recent>,
    capacity: usize,
    db: Option<SharedDatabase>,
}

impl AuditTrail {
    pub fn new(capacity: usize, db: Option<SharedDatabase>) -> Self {
        Self {
            recent: Mutex::new(Recent {
                entries: VecDeque::new(),
                next_seq: 1,
            }),
            capacity: capacity.max(1),
            db,
        }
    }

    pub fn record(
        &self,
        kind: AuditKind,
        subject_id: &str,
        actor: Option<&str>,
        detail: serde_json::Value,
    ) -> AuditEntry {
        // Sequence and memory view under the lock; the database write after it.
        let entry = {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = AuditEntry {
                seq: recent.next_seq,
                at: Utc::now(),
                kind,
                subject_id: subject_id.to_string(),
                actor: actor.map(str::to_string),
                detail,
            };
            recent.next_seq += 1;
            recent.entries.push_back(entry.clone());
            while recent.entries.len() > self.capacity {
                recent.entries.pop_front();
            }
            entry
        };

        if let Some(db) = &self.db {
            let detail = entry.detail.to_string();
            if let Err(e) = db.append_audit(
                &entry.at.to_rfc3339(),
                kind.as_str(),
                subject_id,
                actor,
                Some(&detail),
            ) {
                // Not retried: a retry could duplicate an entry.
                error!(subject_id, kind = kind.as_str(), "Failed to persist audit entry: {e}");
            }
        }
        entry
    }

    /// Recent entries for one transaction or case, oldest first.
    pub fn for_subject(&self, subject_id: &str) -> Vec<AuditEntry> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent
            .entries
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = recent.entries.len().saturating_sub(limit);
        recent.entries.iter().skip(skip).cloned().collect()
    }

    /// Total entries recorded since start, including any no longer in memory.
    pub fn recorded(&self) -> u64 {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.next_seq - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "txsentinel_audit_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    #[test]
    fn sequence_is_monotonic() {
        let trail = AuditTrail::new(10, None);
        let a = trail.record(AuditKind::CaseOpened, "c1", None, json!({}));
        let b = trail.record(AuditKind::CaseTransition, "c1", Some("ann"), json!({}));
        assert!(b.seq > a.seq);
        assert_eq!(trail.for_subject("c1").len(), 2);
    }

    #[test]
    fn memory_is_bounded_but_count_is_not() {
        let trail = AuditTrail::new(3, None);
        for i in 0..5 {
            trail.record(AuditKind::RuleMatched, &format!("t{i}"), None, json!(null));
        }
        assert_eq!(trail.recent(10).len(), 3);
        assert_eq!(trail.recent(10)[0].subject_id, "t2");
        assert_eq!(trail.recorded(), 5);
    }

    #[test]
    fn entries_reach_the_database() {
        let db = temp_db();
        let trail = AuditTrail::new(10, Some(db.clone()));
        trail.record(AuditKind::TransactionScreened, "tx9", None, json!({"action": "flag"}));
        let rows = db.audit_for_subject("tx9").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "transaction_screened");
        assert!(rows[0].detail.as_deref().unwrap().contains("flag"));
    }

    #[test]
    fn concurrent_records_get_distinct_sequence_numbers() {
        let db = temp_db();
        let trail = AuditTrail::new(1000, Some(db.clone()));
        let mut seqs: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|worker| {
                    let trail = &trail;
                    s.spawn(move || {
                        (0..25)
                            .map(|i| {
                                trail
                                    .record(AuditKind::RuleMatched, &format!("t{worker}-{i}"), None, json!(null))
                                    .seq
                            })
                            .collect::<Vec<u64>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 200);
        assert_eq!(trail.recorded(), 200);
        assert_eq!(db.audit_count().unwrap(), 200);
        let memory: Vec<u64> = trail.recent(200).iter().map(|e| e.seq).collect();
        assert!(memory.windows(2).all(|w| w[0] < w[1]));
    }
}
