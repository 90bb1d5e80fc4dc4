//! HTTP binding of [`DisputeSource`] against the gateway's chargeback search.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::domain::chargeback::DisputePage;
use crate::domain::gateway::{FailureCategory, GatewayFailure};
use crate::domain::{ChargebackStatus, RemoteDispute};
use crate::ports::DisputeSource;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    disputes: Vec<serde_json::Value>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDispute {
    case_number: String,
    #[serde(default)]
    merchant_id: Option<String>,
    #[serde(default)]
    transaction_reference: Option<String>,
    amount: BigDecimal,
    currency: String,
    #[serde(default)]
    reason_code: Option<String>,
    status: String,
}

/// Gateway dispute vocabulary to local chargeback status.
pub fn map_status(raw: &str) -> Option<ChargebackStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "new" | "open" => Some(ChargebackStatus::New),
        "pending" | "under_review" | "in_review" => Some(ChargebackStatus::Pending),
        "won" | "reversed" => Some(ChargebackStatus::Won),
        "lost" | "accepted" => Some(ChargebackStatus::Lost),
        _ => None,
    }
}

#[derive(Clone)]
pub struct HttpDisputeSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDisputeSource {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn normalize(&self, merchant_id: &str, raw: serde_json::Value) -> Option<RemoteDispute> {
        let wire: WireDispute = match serde_json::from_value(raw.clone()) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!(merchant_id, error = %e, "Skipping malformed dispute record");
                return None;
            }
        };
        let Some(status) = map_status(&wire.status) else {
            tracing::warn!(
                case_number = %wire.case_number,
                status = %wire.status,
                "Skipping dispute with unknown status"
            );
            return None;
        };

        Some(RemoteDispute {
            case_number: wire.case_number,
            merchant_id: wire.merchant_id.unwrap_or_else(|| merchant_id.to_string()),
            transaction_reference: wire.transaction_reference,
            amount: wire.amount,
            currency: wire.currency.to_ascii_uppercase(),
            reason_code: wire.reason_code.unwrap_or_default(),
            status,
            raw,
        })
    }
}

#[async_trait]
impl DisputeSource for HttpDisputeSource {
    async fn search_disputes(
        &self,
        since: DateTime<Utc>,
        merchant_id: &str,
        cursor: Option<&str>,
    ) -> Result<DisputePage, GatewayFailure> {
        let url = format!("{}/v1/disputes", self.base_url.trim_end_matches('/'));
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut query = vec![("merchant_id", merchant_id), ("since", since.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let mut request = self.client.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            let category = if e.is_timeout() {
                FailureCategory::Timeout
            } else {
                FailureCategory::Network
            };
            GatewayFailure::retriable(category, format!("dispute search failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(if status.is_client_error() && status.as_u16() != 429 {
                GatewayFailure::terminal(
                    FailureCategory::InvalidRequest,
                    Some(status.as_str()),
                    "dispute search rejected",
                )
            } else {
                GatewayFailure::retriable(
                    FailureCategory::Upstream,
                    format!("dispute search returned {}", status),
                )
            });
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            GatewayFailure::retriable(
                FailureCategory::Upstream,
                format!("unreadable dispute search response: {}", e),
            )
        })?;

        Ok(DisputePage {
            records: body
                .disputes
                .into_iter()
                .filter_map(|raw| self.normalize(merchant_id, raw))
                .collect(),
            next_cursor: body.next_cursor.filter(|c| !c.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(map_status("OPEN"), Some(ChargebackStatus::New));
        assert_eq!(map_status("under_review"), Some(ChargebackStatus::Pending));
        assert_eq!(map_status("reversed"), Some(ChargebackStatus::Won));
        assert_eq!(map_status("accepted"), Some(ChargebackStatus::Lost));
        assert_eq!(map_status("archived"), None);
    }

    #[tokio::test]
    async fn test_search_pages_and_keeps_raw_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/disputes")
            .match_query(Matcher::UrlEncoded("merchant_id".into(), "m-1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "disputes": [
                        {"case_number": "CB-1", "transaction_reference": "bric-1", "amount": "12.50",
                         "currency": "usd", "reason_code": "10.4", "status": "open", "extra": 1},
                        {"case_number": "CB-2", "amount": "1.00", "currency": "USD", "status": "archived"}
                    ],
                    "next_cursor": "page-2"
                }"#,
            )
            .create_async()
            .await;

        let source = HttpDisputeSource::new(server.url(), None, Duration::from_secs(5));
        let page = source
            .search_disputes(Utc::now(), "m-1", None)
            .await
            .unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
        let record = &page.records[0];
        assert_eq!(record.merchant_id, "m-1");
        assert_eq!(record.currency, "USD");
        assert_eq!(record.status, ChargebackStatus::New);
        assert_eq!(record.raw["extra"], 1);
    }
}
