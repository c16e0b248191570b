//! External screening services the engine consumes.
//!
//! Watchlist/sanctions screening and device/behavioral enrichment are
//! best-effort services. Every call is bounded by a timeout; a failed or
//! late answer is reported as [`Lookup::Failed`] and the rule evaluators fail
//! closed on it.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::Transaction;
use crate::error::CollaboratorError;
use crate::rules::RuleType;
use crate::rules::store::RuleSnapshot;

/// Identifying fields sent to the watchlist service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningSubject {
    pub entity_id: String,
    pub counterparty_id: Option<String>,
    pub counterparty_name: Option<String>,
}

impl From<&Transaction> for ScreeningSubject {
    fn from(tx: &Transaction) -> Self {
        Self {
            entity_id: tx.origin_entity_id.clone(),
            counterparty_id: tx.counterparty_id.clone(),
            counterparty_name: tx.counterparty_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistResult {
    pub hit: bool,
    pub confidence: f64,
    #[serde(default)]
    pub list: Option<String>,
}

#[async_trait]
pub trait WatchlistScreener: Send + Sync {
    async fn screen(&self, subject: &ScreeningSubject) -> Result<WatchlistResult, CollaboratorError>;
}

/// Scored signals keyed by name (device risk, behavioral anomaly, ...).
pub type Signals = HashMap<String, f64>;

#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    async fn enrich(&self, tx: &Transaction) -> Result<Signals, CollaboratorError>;
}

/// Result of asking a collaborator for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// No active rule needed the answer.
    NotRequested,
    Answered(T),
    Failed(String),
}

impl<T> Lookup<T> {
    pub fn answer(&self) -> Option<&T> {
        match self {
            Lookup::Answered(v) => Some(v),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Lookup::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Everything the engine needs from outside for one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CollaboratorInputs {
    pub watchlist: Lookup<WatchlistResult>,
    pub enrichment: Lookup<Signals>,
}

impl CollaboratorInputs {
    pub fn none() -> Self {
        Self {
            watchlist: Lookup::NotRequested,
            enrichment: Lookup::NotRequested,
        }
    }
}

/// Configured collaborators plus the call timeout.
#[derive(Clone)]
pub struct Collaborators {
    watchlist: Option<Arc<dyn WatchlistScreener>>,
    enrichment: Option<Arc<dyn EnrichmentProvider>>,
    timeout: Duration,
}

impl Collaborators {
    pub fn new(timeout: Duration) -> Self {
        Self {
            watchlist: None,
            enrichment: None,
            timeout,
        }
    }

    pub fn with_watchlist(mut self, screener: Arc<dyn WatchlistScreener>) -> Self {
        self.watchlist = Some(screener);
        self
    }

    pub fn with_enrichment(mut self, provider: Arc<dyn EnrichmentProvider>) -> Self {
        self.enrichment = Some(provider);
        self
    }

    /// Query the collaborators the active rules need, concurrently.
    pub async fn gather(&self, tx: &Transaction, snapshot: &RuleSnapshot) -> CollaboratorInputs {
        let need_watchlist = snapshot.has_type(RuleType::Watchlist);
        let need_enrichment =
            snapshot.has_type(RuleType::Pattern) || snapshot.has_type(RuleType::Behavioral);

        let watchlist = async {
            if !need_watchlist {
                return Lookup::NotRequested;
            }
            // An active watchlist rule with nobody to ask must not pass silently.
            let Some(screener) = &self.watchlist else {
                return Lookup::Failed(
                    CollaboratorError::Unavailable { service: "watchlist" }.to_string(),
                );
            };
            let subject = ScreeningSubject::from(tx);
            self.bounded("watchlist", screener.screen(&subject)).await
        };

        let enrichment = async {
            if !need_enrichment {
                return Lookup::NotRequested;
            }
            // Without a provider, pattern rules read the transaction's own attributes.
            let Some(provider) = &self.enrichment else {
                return Lookup::NotRequested;
            };
            self.bounded("enrichment", provider.enrich(tx)).await
        };

        let (watchlist, enrichment) = tokio::join!(watchlist, enrichment);
        CollaboratorInputs {
            watchlist,
            enrichment,
        }
    }

    async fn bounded<T>(
        &self,
        service: &'static str,
        call: impl std::future::Future<Output = Result<T, CollaboratorError>>,
    ) -> Lookup<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Lookup::Answered(value),
            Ok(Err(e)) => {
                warn!(service, "Collaborator call failed: {e}");
                Lookup::Failed(e.to_string())
            }
            Err(_) => {
                let e = CollaboratorError::Timeout {
                    service,
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                warn!(service, "{e}");
                Lookup::Failed(e.to_string())
            }
        }
    }
}
