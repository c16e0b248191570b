use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use super::{EnrichmentProvider, ScreeningSubject, Signals, WatchlistResult, WatchlistScreener};
use crate::core::Transaction;
use crate::error::CollaboratorError;

/// Minimal JSON-over-HTTP client for a screening service.
#[derive(Clone)]
pub struct JsonClient {
    service: &'static str,
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
}

impl JsonClient {
    pub fn new(service: &'static str, url: &str, user: Option<&str>, pass: Option<&str>) -> Self {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = match (user, pass) {
            (Some(user), Some(pass)) => Some(STANDARD.encode(format!("{user}:{pass}"))),
            _ => None,
        };
        Self {
            service,
            url: url.to_string(),
            client: Client::new(),
            auth,
        }
    }

    pub async fn post(&self, body: &Value) -> Result<Value, CollaboratorError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(auth) = &self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }

        let resp = req.send().await.map_err(|source| CollaboratorError::Http {
            service: self.service,
            source,
        })?;
        let resp = resp.error_for_status().map_err(|source| CollaboratorError::Http {
            service: self.service,
            source,
        })?;
        resp.json().await.map_err(|source| CollaboratorError::Http {
            service: self.service,
            source,
        })
    }
}

/// Sanctions/PEP screening service reached over HTTP.
pub struct HttpWatchlist {
    client: JsonClient,
}

impl HttpWatchlist {
    pub fn new(client: JsonClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchlistScreener for HttpWatchlist {
    async fn screen(&self, subject: &ScreeningSubject) -> Result<WatchlistResult, CollaboratorError> {
        let body = json!({
            "entity_id": subject.entity_id,
            "counterparty_id": subject.counterparty_id,
            "counterparty_name": subject.counterparty_name,
        });
        let resp = self.client.post(&body).await?;
        parse_watchlist_response(&resp)
    }
}

/// Device / behavioral intelligence service reached over HTTP.
pub struct HttpEnrichment {
    client: JsonClient,
}

impl HttpEnrichment {
    pub fn new(client: JsonClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EnrichmentProvider for HttpEnrichment {
    async fn enrich(&self, tx: &Transaction) -> Result<Signals, CollaboratorError> {
        let body = json!({
            "transaction_id": tx.id,
            "entity_id": tx.origin_entity_id,
            "device_fingerprint": tx.device_fingerprint,
            "ip_address": tx.ip_address,
            "amount": tx.amount,
            "currency": tx.currency,
        });
        let resp = self.client.post(&body).await?;
        parse_enrichment_response(&resp)
    }
}

/// Expects `{"hit": bool, "confidence": number, "list": string?}`.
pub fn parse_watchlist_response(resp: &Value) -> Result<WatchlistResult, CollaboratorError> {
    let protocol = |reason: &str| CollaboratorError::Protocol {
        service: "watchlist",
        reason: reason.to_string(),
    };
    let hit = resp
        .get("hit")
        .and_then(Value::as_bool)
        .ok_or_else(|| protocol("missing boolean `hit`"))?;
    let confidence = resp
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(if hit { 1.0 } else { 0.0 });
    if !(0.0..=1.0).contains(&confidence) {
        return Err(protocol("confidence outside 0..=1"));
    }
    Ok(WatchlistResult {
        hit,
        confidence,
        list: resp.get("list").and_then(Value::as_str).map(str::to_string),
    })
}

/// Expects `{"signals": {"name": number | bool, ...}}`.
pub fn parse_enrichment_response(resp: &Value) -> Result<Signals, CollaboratorError> {
    let signals = resp
        .get("signals")
        .and_then(Value::as_object)
        .ok_or_else(|| CollaboratorError::Protocol {
            service: "enrichment",
            reason: "missing object `signals`".into(),
        })?;
    Ok(signals
        .iter()
        .filter_map(|(k, v)| crate::core::signal_value(v).map(|s| (k.clone(), s)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchlist_hit_parses() {
        let r = parse_watchlist_response(&json!({"hit": true, "confidence": 0.82, "list": "EU"})).unwrap();
        assert!(r.hit);
        assert_eq!(r.confidence, 0.82);
        assert_eq!(r.list.as_deref(), Some("EU"));
    }

    #[test]
    fn watchlist_confidence_defaults_from_hit() {
        let r = parse_watchlist_response(&json!({"hit": true})).unwrap();
        assert_eq!(r.confidence, 1.0);
        let r = parse_watchlist_response(&json!({"hit": false})).unwrap();
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn watchlist_without_hit_is_protocol_error() {
        let e = parse_watchlist_response(&json!({"confidence": 0.2})).unwrap_err();
        assert!(matches!(e, CollaboratorError::Protocol { .. }));
    }

    #[test]
    fn watchlist_bad_confidence_rejected() {
        assert!(parse_watchlist_response(&json!({"hit": true, "confidence": 3.0})).is_err());
    }

    #[test]
    fn enrichment_keeps_numeric_and_bool_signals() {
        let s = parse_enrichment_response(&json!({
            "signals": {"device_risk": 0.7, "emulator": true, "note": "ignored"}
        }))
        .unwrap();
        assert_eq!(s.get("device_risk"), Some(&0.7));
        assert_eq!(s.get("emulator"), Some(&1.0));
        assert!(!s.contains_key("note"));
    }

    #[test]
    fn enrichment_without_signals_is_protocol_error() {
        assert!(parse_enrichment_response(&json!({})).is_err());
    }

    #[test]
    fn basic_auth_only_with_both_credentials() {
        let c = JsonClient::new("watchlist", "http://localhost:1", Some("u"), None);
        assert!(c.auth.is_none());
        let c = JsonClient::new("watchlist", "http://localhost:1", Some("u"), Some("p"));
        assert_eq!(c.auth.as_deref(), Some("dTpw"));
    }
}
