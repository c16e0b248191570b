use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditKind, AuditTrail};
use crate::cases::CaseManager;
use crate::cases::state::{CaseOrigin, CaseType, NewCase};
use crate::collaborators::{CollaboratorInputs, Collaborators};
use crate::core::{Action, RawTransaction, RuleMatch, ScreeningOutcome, Transaction};
use crate::error::ScreeningError;
use crate::rules::Severity;
use crate::rules::store::{RuleSnapshot, RuleStore};
use crate::signals::RuleEngine;
use crate::signals::decision::DecisionPolicy;
use crate::signals::score::{RiskScore, score};

/// Whether a decision hands the transaction to an investigator.
pub fn needs_case(action: Action, matches: &[RuleMatch]) -> bool {
    match action {
        Action::Review => true,
        Action::Approve => false,
        Action::Flag | Action::Block => matches.iter().any(|m| m.matched && m.auto_create_case),
    }
}

/// Screens one transaction end to end: collaborators, rules, score,
/// decision and, when needed, a case.
pub struct Screener {
    rules: Arc<RuleStore>,
    collaborators: Collaborators,
    engine: RuleEngine,
    policy: DecisionPolicy,
    cases: Arc<CaseManager>,
    audit: Arc<AuditTrail>,
}

impl Screener {
    pub fn new(
        rules: Arc<RuleStore>,
        collaborators: Collaborators,
        engine: RuleEngine,
        policy: DecisionPolicy,
        cases: Arc<CaseManager>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            rules,
            collaborators,
            engine,
            policy,
            cases,
            audit,
        }
    }

    pub async fn screen(&self, raw: RawTransaction) -> Result<ScreeningOutcome, ScreeningError> {
        self.screen_until(raw, std::future::pending()).await
    }

    /// Screen unless `cancel` completes first. Cancellation is honoured only
    /// while waiting on collaborators; once rules start running the decision
    /// and any case it opens are committed.
    pub async fn screen_until(
        &self,
        raw: RawTransaction,
        cancel: impl Future<Output = ()>,
    ) -> Result<ScreeningOutcome, ScreeningError> {
        let raw_id = raw.id.clone();
        let tx = raw.validate().inspect_err(|e| {
            debug!(tx_id = raw_id.as_deref().unwrap_or("-"), "Transaction rejected: {e}");
            self.audit.record(
                AuditKind::TransactionRejected,
                raw_id.as_deref().unwrap_or("-"),
                None,
                json!({ "field": e.field, "reason": e.reason }),
            );
        })?;

        let snapshot = self.rules.snapshot();
        let inputs = tokio::select! {
            biased;
            _ = cancel => {
                debug!(tx_id = %tx.id, "Screening cancelled before decision");
                return Err(ScreeningError::Cancelled);
            }
            inputs = self.collaborators.gather(&tx, &snapshot) => inputs,
        };

        Ok(self.commit(&tx, &snapshot, &inputs))
    }

    fn commit(
        &self,
        tx: &Transaction,
        snapshot: &RuleSnapshot,
        inputs: &CollaboratorInputs,
    ) -> ScreeningOutcome {
        let evaluation = self.engine.evaluate(tx, snapshot, inputs);
        for m in evaluation.results.iter().filter(|m| m.matched) {
            self.audit.record(
                AuditKind::RuleMatched,
                &tx.id,
                None,
                json!({
                    "rule_id": m.rule_id,
                    "severity": m.severity,
                    "action": m.action,
                    "evidence": m.evidence,
                }),
            );
        }
        for e in &evaluation.config_errors {
            self.audit.record(
                AuditKind::RuleSkipped,
                &tx.id,
                None,
                json!({ "rule_id": e.rule_id, "reason": e.reason }),
            );
        }

        let risk = score(tx, &evaluation.results);
        let action = self.policy.decide(risk.score, &evaluation.results);
        let matched_rule_ids = evaluation.matched_rule_ids();

        let case_id = if needs_case(action, &evaluation.results) {
            self.open_case(tx, snapshot, &risk, action, &matched_rule_ids)
        } else {
            None
        };

        self.audit.record(
            AuditKind::TransactionScreened,
            &tx.id,
            None,
            json!({
                "entity_id": tx.origin_entity_id,
                "action": action,
                "risk_score": risk.score,
                "matched_rule_ids": matched_rule_ids,
                "case_id": case_id,
            }),
        );
        debug!(
            tx_id = %tx.id,
            action = action.as_str(),
            score = risk.score,
            matches = matched_rule_ids.len(),
            "Transaction screened"
        );

        ScreeningOutcome {
            transaction_id: tx.id.clone(),
            action,
            risk_score: risk.score,
            matched_rule_ids,
            case_id,
            skipped_rule_ids: evaluation
                .config_errors
                .iter()
                .map(|e| e.rule_id.clone())
                .collect(),
        }
    }

    fn open_case(
        &self,
        tx: &Transaction,
        snapshot: &RuleSnapshot,
        risk: &RiskScore,
        action: Action,
        matched_rule_ids: &[String],
    ) -> Option<String> {
        let case_type = risk
            .top_rule_ids
            .first()
            .and_then(|id| snapshot.rules().iter().find(|r| &r.id == id))
            .map_or(CaseType::Manual, |r| CaseType::from(r.rule_type()));
        let severity = risk.top_severity.unwrap_or(Severity::Low);

        let input = NewCase {
            case_type,
            severity,
            origin: CaseOrigin::Automatic,
            summary: format!(
                "{} {:.2} {} from {}: score {}, rules {}",
                action.as_str(),
                tx.amount,
                tx.currency,
                tx.origin_entity_id,
                risk.score,
                matched_rule_ids.join(", ")
            ),
            related_transaction_id: Some(tx.id.clone()),
            related_entity_id: Some(tx.origin_entity_id.clone()),
            risk_score: Some(risk.score),
            matched_rule_ids: matched_rule_ids.to_vec(),
        };
        match self.cases.open_case(input, Utc::now()) {
            Ok(case) => Some(case.id().to_string()),
            Err(e) => {
                error!(tx_id = %tx.id, "Failed to open case: {e}");
                None
            }
        }
    }
}

/// One line of pipeline output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PipelineOutput {
    Screened(ScreeningOutcome),
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
        error: String,
    },
    Cancelled {
        #[serde(skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
        cancelled: bool,
    },
}

impl PipelineOutput {
    fn from_result(transaction_id: Option<String>, result: Result<ScreeningOutcome, ScreeningError>) -> Self {
        match result {
            Ok(outcome) => PipelineOutput::Screened(outcome),
            Err(ScreeningError::Cancelled) => PipelineOutput::Cancelled {
                transaction_id,
                cancelled: true,
            },
            Err(e @ ScreeningError::Rejected(_)) => PipelineOutput::Rejected {
                transaction_id,
                error: e.to_string(),
            },
        }
    }
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run the pipeline: receive NDJSON transaction lines, screen them on up to
/// `workers` concurrent tasks, forward one output per line.
///
/// Flipping `shutdown` to true stops intake and cancels screenings that have
/// not reached their decision yet.
pub async fn run_pipeline(
    mut rx: mpsc::Receiver<String>,
    out: mpsc::UnboundedSender<PipelineOutput>,
    screener: Arc<Screener>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = workers.max(1);
    let permits = Arc::new(Semaphore::new(workers));
    let processed = Arc::new(AtomicU64::new(0));

    info!("Pipeline started with {workers} workers, waiting for transactions...");

    loop {
        let line = tokio::select! {
            _ = stop_requested(&mut shutdown) => {
                info!("Shutdown requested, stopping intake");
                break;
            }
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let raw: RawTransaction = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Unparseable transaction line: {e}");
                let _ = out.send(PipelineOutput::Rejected {
                    transaction_id: None,
                    error: format!("malformed JSON: {e}"),
                });
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let screener = screener.clone();
        let out = out.clone();
        let processed = processed.clone();
        let mut stop = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let tx_id = raw.id.clone();
            let cancel = async move { stop_requested(&mut stop).await };
            let result = screener.screen_until(raw, cancel).await;

            let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 1000 == 0 {
                info!("Pipeline processed {count} transactions");
            }
            if out.send(PipelineOutput::from_result(tx_id, result)).is_err() {
                debug!("Output channel closed");
            }
        });
    }

    // Drain: every permit back means every spawned screening has finished.
    let _ = permits.acquire_many(workers as u32).await;
    info!(
        "Pipeline shutting down after {} transactions",
        processed.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::CaseFilter;
    use crate::cases::sla::SlaPolicy;
    use crate::cases::state::CaseStatus;
    use crate::collaborators::WatchlistResult;
    use crate::collaborators::tests::{SlowScreener, StaticScreener};
    use crate::core::velocity::VelocityTracker;
    use crate::rules::tests::make_rule;
    use crate::rules::{Rule, RuleAction, RuleConditions};
    use crate::signals::FailClosed;
    use chrono::{DateTime, Duration, TimeZone};
    use std::time::Duration as StdDuration;

    struct Harness {
        screener: Arc<Screener>,
        cases: Arc<CaseManager>,
        audit: Arc<AuditTrail>,
    }

    fn harness(rules: Vec<Rule>, collaborators: Collaborators, mode: FailClosed) -> Harness {
        let store = Arc::new(RuleStore::new());
        for rule in rules {
            store.create(rule).unwrap();
        }
        let audit = Arc::new(AuditTrail::new(10_000, None));
        let cases = Arc::new(CaseManager::new(SlaPolicy::default(), audit.clone()));
        let engine = RuleEngine::new(Arc::new(VelocityTracker::new(1000)), vec!["KP".to_string()], mode);
        let screener = Arc::new(Screener::new(
            store,
            collaborators,
            engine,
            DecisionPolicy::default(),
            cases.clone(),
            audit.clone(),
        ));
        Harness {
            screener,
            cases,
            audit,
        }
    }

    fn simple(rules: Vec<Rule>) -> Harness {
        harness(rules, Collaborators::new(StdDuration::from_millis(50)), FailClosed::Match)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn raw(id: &str, entity: &str, amount: f64, at: DateTime<Utc>) -> RawTransaction {
        RawTransaction {
            id: Some(id.into()),
            amount: Some(amount),
            currency: Some("USD".into()),
            timestamp: Some(at),
            origin_entity_id: Some(entity.into()),
            ..Default::default()
        }
    }

    fn amount_rule(id: &str, min: f64, severity: Severity, action: RuleAction) -> Rule {
        make_rule(
            id,
            severity,
            action,
            RuleConditions::AmountThreshold {
                amount_min: Some(min),
                amount_max: None,
            },
        )
    }

    #[tokio::test]
    async fn large_amount_is_flagged() {
        let h = simple(vec![amount_rule("big", 10_000.0, Severity::High, RuleAction::Flag)]);
        let out = h.screener.screen(raw("t1", "acct-1", 15_000.0, t0())).await.unwrap();
        assert_eq!(out.risk_score, 60);
        assert_eq!(out.action, Action::Flag);
        assert_eq!(out.matched_rule_ids, vec!["big".to_string()]);
        assert!(out.case_id.is_none());
    }

    #[tokio::test]
    async fn sixth_transaction_trips_velocity() {
        let h = simple(vec![make_rule(
            "burst",
            Severity::Medium,
            RuleAction::Review,
            RuleConditions::Velocity {
                transaction_count: 5,
                time_window_minutes: 15,
                volume_min: None,
            },
        )]);
        let mut last = None;
        for i in 0..6 {
            let at = t0() + Duration::minutes(2 * i);
            last = Some(
                h.screener
                    .screen(raw(&format!("v{i}"), "acct-7", 20.0, at))
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last.matched_rule_ids.contains(&"burst".to_string()));
        assert_eq!(last.action, Action::Review);
        assert!(last.case_id.is_some());
    }

    #[tokio::test]
    async fn explicit_block_beats_low_score() {
        let h = simple(vec![amount_rule("deny", 1.0, Severity::Low, RuleAction::Block)]);
        let out = h.screener.screen(raw("t1", "acct-1", 5.0, t0())).await.unwrap();
        assert_eq!(out.risk_score, 10);
        assert_eq!(out.action, Action::Block);
    }

    #[tokio::test]
    async fn no_matches_approve_with_zero_score() {
        let h = simple(vec![amount_rule("big", 10_000.0, Severity::High, RuleAction::Flag)]);
        let out = h.screener.screen(raw("t1", "acct-1", 5.0, t0())).await.unwrap();
        assert_eq!(out.action, Action::Approve);
        assert_eq!(out.risk_score, 0);
        assert!(out.matched_rule_ids.is_empty());
        assert!(h.cases.is_empty());
    }

    #[tokio::test]
    async fn invalid_transaction_is_rejected_untouched() {
        let h = simple(vec![make_rule(
            "burst",
            Severity::Medium,
            RuleAction::Flag,
            RuleConditions::Velocity {
                transaction_count: 2,
                time_window_minutes: 5,
                volume_min: None,
            },
        )]);
        let mut bad = raw("t1", "acct-1", 5.0, t0());
        bad.currency = None;
        let err = h.screener.screen(bad).await.unwrap_err();
        assert!(matches!(err, ScreeningError::Rejected(ref e) if e.field == "currency"));
        assert_eq!(h.audit.for_subject("t1")[0].kind, AuditKind::TransactionRejected);
        assert!(h.cases.is_empty());

        // The rejected attempt left no velocity trace.
        let out = h.screener.screen(raw("t2", "acct-1", 5.0, t0())).await.unwrap();
        assert!(out.matched_rule_ids.is_empty());
        let out = h.screener.screen(raw("t3", "acct-1", 5.0, t0())).await.unwrap();
        assert_eq!(out.matched_rule_ids, vec!["burst".to_string()]);
    }

    #[tokio::test]
    async fn auto_case_opened_with_top_severity() {
        let mut watch = make_rule(
            "sanctions",
            Severity::Critical,
            RuleAction::Flag,
            RuleConditions::Watchlist { min_confidence: 0.5 },
        );
        watch.auto_create_case = true;
        let collaborators = Collaborators::new(StdDuration::from_millis(200)).with_watchlist(Arc::new(
            StaticScreener(WatchlistResult {
                hit: true,
                confidence: 0.9,
                list: Some("OFAC".into()),
            }),
        ));
        let h = harness(
            vec![watch, amount_rule("big", 100.0, Severity::Medium, RuleAction::Flag)],
            collaborators,
            FailClosed::Match,
        );
        let out = h.screener.screen(raw("t9", "acct-3", 500.0, t0())).await.unwrap();
        assert_eq!(out.action, Action::Block);
        let case = h.cases.get(out.case_id.as_deref().unwrap()).unwrap();
        assert_eq!(case.severity(), Severity::Critical);
        assert_eq!(case.case_type(), CaseType::Watchlist);
        assert_eq!(case.related_transaction_id(), Some("t9"));
        assert_eq!(case.status(), CaseStatus::New);
        assert_eq!(case.matched_rule_ids().len(), 2);
    }

    #[tokio::test]
    async fn flag_without_auto_case_opens_nothing() {
        let h = simple(vec![amount_rule("big", 10.0, Severity::High, RuleAction::Flag)]);
        h.screener.screen(raw("t1", "acct-1", 50.0, t0())).await.unwrap();
        assert!(h.cases.list(&CaseFilter::default(), t0()).is_empty());
    }

    #[tokio::test]
    async fn watchlist_timeout_fails_closed_to_review() {
        let collaborators = Collaborators::new(StdDuration::from_millis(20))
            .with_watchlist(Arc::new(SlowScreener(StdDuration::from_secs(5))));
        let h = harness(
            vec![make_rule(
                "sanctions",
                Severity::Medium,
                RuleAction::Flag,
                RuleConditions::Watchlist { min_confidence: 0.0 },
            )],
            collaborators,
            FailClosed::Review,
        );
        let out = h.screener.screen(raw("t1", "acct-1", 5.0, t0())).await.unwrap();
        assert_eq!(out.matched_rule_ids, vec!["sanctions".to_string()]);
        assert_eq!(out.action, Action::Review);
        assert!(out.case_id.is_some());
    }

    #[tokio::test]
    async fn cancelled_before_decision_leaves_no_trace() {
        let collaborators = Collaborators::new(StdDuration::from_secs(5))
            .with_watchlist(Arc::new(SlowScreener(StdDuration::from_secs(5))));
        let mut burst = make_rule(
            "burst",
            Severity::Low,
            RuleAction::Review,
            RuleConditions::Velocity {
                transaction_count: 1,
                time_window_minutes: 5,
                volume_min: None,
            },
        );
        burst.auto_create_case = true;
        let h = harness(
            vec![
                burst,
                make_rule(
                    "sanctions",
                    Severity::High,
                    RuleAction::Flag,
                    RuleConditions::Watchlist { min_confidence: 0.0 },
                ),
            ],
            collaborators,
            FailClosed::Match,
        );
        let err = h
            .screener
            .screen_until(
                raw("t1", "acct-1", 5.0, t0()),
                tokio::time::sleep(StdDuration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ScreeningError::Cancelled);
        assert!(h.cases.is_empty());
        assert!(h.audit.for_subject("t1").is_empty());
    }

    #[tokio::test]
    async fn malformed_rule_is_reported_and_skipped() {
        let h = simple(vec![amount_rule("big", 10.0, Severity::High, RuleAction::Flag)]);
        // Built directly so the store's activation checks are bypassed.
        let broken = make_rule(
            "broken",
            Severity::Critical,
            RuleAction::Block,
            RuleConditions::Velocity {
                transaction_count: 0,
                time_window_minutes: 0,
                volume_min: None,
            },
        );
        let snapshot = RuleSnapshot::new(9, vec![broken, amount_rule("big", 10.0, Severity::High, RuleAction::Flag)]);
        let tx = raw("t1", "acct-1", 50.0, t0()).validate().unwrap();
        let out = h.screener.commit(&tx, &snapshot, &CollaboratorInputs::none());
        assert_eq!(out.action, Action::Flag);
        assert_eq!(out.skipped_rule_ids, vec!["broken".to_string()]);
        assert!(
            h.audit
                .for_subject("t1")
                .iter()
                .any(|e| e.kind == AuditKind::RuleSkipped)
        );
    }

    #[test]
    fn case_policy() {
        let m = |auto| RuleMatch {
            rule_id: "r".into(),
            matched: true,
            severity: Severity::High,
            action: RuleAction::Flag,
            auto_create_case: auto,
            evidence: serde_json::Value::Null,
        };
        assert!(needs_case(Action::Review, &[]));
        assert!(!needs_case(Action::Approve, &[m(true)]));
        assert!(needs_case(Action::Flag, &[m(true)]));
        assert!(!needs_case(Action::Block, &[m(false)]));
    }

    #[test]
    fn output_lines_are_flat_json() {
        let line = serde_json::to_value(PipelineOutput::Rejected {
            transaction_id: Some("t1".into()),
            error: "bad".into(),
        })
        .unwrap();
        assert_eq!(line, json!({ "transaction_id": "t1", "error": "bad" }));
        let line = serde_json::to_value(PipelineOutput::Screened(ScreeningOutcome {
            transaction_id: "t2".into(),
            action: Action::Approve,
            risk_score: 0,
            matched_rule_ids: vec![],
            case_id: None,
            skipped_rule_ids: vec![],
        }))
        .unwrap();
        assert_eq!(
            line,
            json!({ "transaction_id": "t2", "action": "approve", "risk_score": 0, "matched_rule_ids": [] })
        );
    }

    #[tokio::test]
    async fn pipeline_screens_lines_and_reports_bad_ones() {
        let h = simple(vec![amount_rule("big", 10_000.0, Severity::High, RuleAction::Flag)]);
        let (line_tx, line_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let lines = [
            r#"{"id":"a","amount":20000,"currency":"usd","timestamp":"2026-06-01T09:00:00Z","origin_entity_id":"e1"}"#,
            r#"{"id":"b","amount":5,"currency":"USD","timestamp":"2026-06-01T09:01:00Z","origin_entity_id":"e2"}"#,
            r#"{"id":"c","amount":5,"currency":"USD"}"#,
            "not json",
        ];
        for l in lines {
            line_tx.send(l.to_string()).await.unwrap();
        }
        drop(line_tx);

        run_pipeline(line_rx, out_tx, h.screener.clone(), 4, stop_rx).await;

        let mut outputs = Vec::new();
        while let Ok(o) = out_rx.try_recv() {
            outputs.push(o);
        }
        assert_eq!(outputs.len(), 4);
        let flagged = outputs.iter().any(|o| {
            matches!(o, PipelineOutput::Screened(s) if s.transaction_id == "a" && s.action == Action::Flag)
        });
        assert!(flagged);
        let rejected = outputs
            .iter()
            .filter(|o| matches!(o, PipelineOutput::Rejected { .. }))
            .count();
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_screenings() {
        let collaborators = Collaborators::new(StdDuration::from_secs(10))
            .with_watchlist(Arc::new(SlowScreener(StdDuration::from_secs(10))));
        let h = harness(
            vec![make_rule(
                "sanctions",
                Severity::High,
                RuleAction::Flag,
                RuleConditions::Watchlist { min_confidence: 0.0 },
            )],
            collaborators,
            FailClosed::Match,
        );
        let (line_tx, line_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        line_tx
            .send(
                r#"{"id":"slow","amount":1,"currency":"USD","timestamp":"2026-06-01T09:00:00Z","origin_entity_id":"e1"}"#
                    .to_string(),
            )
            .await
            .unwrap();

        let pipeline = tokio::spawn(run_pipeline(line_rx, out_tx, h.screener.clone(), 2, stop_rx));
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        pipeline.await.unwrap();

        assert_eq!(
            out_rx.try_recv().unwrap(),
            PipelineOutput::Cancelled {
                transaction_id: Some("slow".into()),
                cancelled: true,
            }
        );
        assert!(h.cases.is_empty());
    }
}
