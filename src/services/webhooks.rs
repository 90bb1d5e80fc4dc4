//! Signed webhook fan-out with bounded, backoff-governed retries.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use super::record_audit;
use crate::domain::{AuditEntry, DeliveryStatus, WebhookDelivery, WebhookEndpoint, WebhookEvent};
use crate::error::PaymentError;
use crate::ports::{AuditRepository, RepositoryError, WebhookRepository};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Attempts after which a delivery is marked failed and never retried.
pub const MAX_ATTEMPTS: i32 = 5;

/// Delay before attempt `n + 1`, indexed by attempts made so far.
pub const BACKOFF_MINUTES: [i64; 5] = [0, 5, 15, 25, 35];

const ENTITY_WEBHOOK_DELIVERY: &str = "webhook_delivery";
const ACTOR: &str = "webhook_dispatcher";

pub fn retry_delay(attempts: i32) -> ChronoDuration {
    let index = attempts.clamp(0, BACKOFF_MINUTES.len() as i32 - 1) as usize;
    ChronoDuration::minutes(BACKOFF_MINUTES[index])
}

/// Hex HMAC-SHA256 of `body` keyed by the endpoint secret.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, PaymentError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature, for receivers.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub errors: usize,
}

struct AttemptResult {
    status_code: Option<i32>,
    error: Option<String>,
}

impl AttemptResult {
    fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct WebhookDispatcher {
    repo: Arc<dyn WebhookRepository>,
    audit: Arc<dyn AuditRepository>,
    client: Client,
    concurrency: usize,
    batch_size: i64,
    lease: ChronoDuration,
}

impl WebhookDispatcher {
    pub fn new(
        repo: Arc<dyn WebhookRepository>,
        audit: Arc<dyn AuditRepository>,
        timeout: Duration,
        concurrency: usize,
        batch_size: i64,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let lease = ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(30))
            + ChronoDuration::seconds(60);

        Self {
            repo,
            audit,
            client,
            concurrency: concurrency.max(1),
            batch_size,
            lease,
        }
    }

    pub async fn register_endpoint(
        &self,
        merchant_id: &str,
        url: &str,
        secret: &str,
        event_types: Vec<String>,
    ) -> Result<WebhookEndpoint, PaymentError> {
        if merchant_id.trim().is_empty() {
            return Err(PaymentError::InvalidInput("merchant_id is required".to_string()));
        }
        let parsed = Url::parse(url)
            .map_err(|e| PaymentError::InvalidInput(format!("invalid webhook url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PaymentError::InvalidInput(format!(
                "unsupported webhook url scheme '{}'",
                parsed.scheme()
            )));
        }
        if secret.is_empty() {
            return Err(PaymentError::InvalidInput("webhook secret is required".to_string()));
        }

        let endpoint = WebhookEndpoint::new(merchant_id, url, secret, event_types);
        let endpoint = self.repo.insert_endpoint(&endpoint).await?;
        tracing::info!(endpoint_id = %endpoint.id, merchant_id, "Webhook endpoint registered");
        Ok(endpoint)
    }

    /// Creates one pending delivery per subscribed endpoint of the event's merchant.
    pub async fn enqueue(&self, event: WebhookEvent) -> Result<Vec<WebhookDelivery>, PaymentError> {
        let endpoints = self.repo.list_endpoints(&event.agent_id).await?;
        let payload = serde_json::to_value(&event)?;

        let mut deliveries = Vec::new();
        for endpoint in endpoints.iter().filter(|ep| ep.accepts(&event.event_type)) {
            let delivery = WebhookDelivery::new(endpoint.id, &event, payload.clone());
            match self.repo.insert_delivery(&delivery).await {
                Ok(stored) => deliveries.push(stored),
                Err(RepositoryError::Duplicate(_)) => {
                    tracing::debug!(
                        endpoint_id = %endpoint.id,
                        dedup_key = ?event.dedup_key,
                        "Webhook event already queued for endpoint"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            event_type = %event.event_type,
            agent_id = %event.agent_id,
            deliveries = deliveries.len(),
            "Webhook event enqueued"
        );
        Ok(deliveries)
    }

    /// Attempts every due delivery once, concurrently.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport, PaymentError> {
        let claimed = self
            .repo
            .claim_due(now, now + self.lease, self.batch_size)
            .await?;

        let mut report = DeliveryReport {
            claimed: claimed.len(),
            ..DeliveryReport::default()
        };

        let outcomes: Vec<Result<WebhookDelivery, PaymentError>> = stream::iter(claimed)
            .map(|delivery| self.attempt(delivery, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(delivery) => match delivery.status {
                    DeliveryStatus::Delivered => report.delivered += 1,
                    DeliveryStatus::Failed => report.failed += 1,
                    DeliveryStatus::Pending => report.retrying += 1,
                },
                Err(e) => {
                    tracing::error!(error = %e, "Webhook delivery bookkeeping failed");
                    report.errors += 1;
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retrying = report.retrying,
                failed = report.failed,
                "Webhook delivery run finished"
            );
        }
        Ok(report)
    }

    pub async fn failed_deliveries(&self, limit: i64) -> Result<Vec<WebhookDelivery>, PaymentError> {
        Ok(self.repo.list_failed(limit).await?)
    }

    pub async fn get_delivery(&self, id: Uuid) -> Result<WebhookDelivery, PaymentError> {
        self.repo.get_delivery(id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => PaymentError::NotFound(format!("webhook delivery {}", id)),
            other => other.into(),
        })
    }

    async fn attempt(
        &self,
        mut delivery: WebhookDelivery,
        now: DateTime<Utc>,
    ) -> Result<WebhookDelivery, PaymentError> {
        let result = match self.repo.get_endpoint(delivery.endpoint_id).await {
            Ok(endpoint) => self.post(&endpoint, &delivery, now).await,
            Err(RepositoryError::NotFound(_)) => AttemptResult {
                status_code: None,
                error: Some("endpoint no longer exists".to_string()),
            },
            Err(e) => return Err(e.into()),
        };

        delivery.attempts += 1;
        delivery.last_status_code = result.status_code;
        delivery.last_error = result.error.clone();

        if result.succeeded() {
            delivery.status = DeliveryStatus::Delivered;
            delivery.next_retry_at = None;
        } else if delivery.attempts >= MAX_ATTEMPTS {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at = None;
        } else {
            delivery.next_retry_at = Some(now + retry_delay(delivery.attempts));
        }

        let delivery = self.repo.update_delivery(&delivery).await?;

        match delivery.status {
            DeliveryStatus::Delivered => {
                tracing::info!(delivery_id = %delivery.id, attempts = delivery.attempts, "Webhook delivered")
            }
            DeliveryStatus::Failed => tracing::error!(
                delivery_id = %delivery.id,
                attempts = delivery.attempts,
                last_error = ?delivery.last_error,
                "Webhook delivery failed permanently"
            ),
            DeliveryStatus::Pending => tracing::warn!(
                delivery_id = %delivery.id,
                attempts = delivery.attempts,
                next_retry_at = ?delivery.next_retry_at,
                last_error = ?delivery.last_error,
                "Webhook delivery will be retried"
            ),
        }

        let entry = AuditEntry::new(delivery.id, ENTITY_WEBHOOK_DELIVERY, "delivery_attempt", ACTOR)
            .with_change(
                None,
                Some(serde_json::json!({
                    "attempt": delivery.attempts,
                    "status": delivery.status,
                    "status_code": delivery.last_status_code,
                    "error": delivery.last_error,
                    "next_retry_at": delivery.next_retry_at,
                })),
            );
        record_audit(self.audit.as_ref(), entry).await;

        Ok(delivery)
    }

    async fn post(&self, endpoint: &WebhookEndpoint, delivery: &WebhookDelivery, now: DateTime<Utc>) -> AttemptResult {
        let body = match serde_json::to_vec(&delivery.payload) {
            Ok(body) => body,
            Err(e) => {
                return AttemptResult {
                    status_code: None,
                    error: Some(format!("payload serialization failed: {}", e)),
                }
            }
        };
        let signature = match sign(&endpoint.secret, &body) {
            Ok(signature) => signature,
            Err(e) => {
                return AttemptResult {
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let response = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_TYPE_HEADER, &delivery.event_type)
            .header(TIMESTAMP_HEADER, now.timestamp().to_string())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => AttemptResult {
                status_code: Some(i32::from(response.status().as_u16())),
                error: None,
            },
            Ok(response) => AttemptResult {
                status_code: Some(i32::from(response.status().as_u16())),
                error: Some(format!("endpoint responded {}", response.status())),
            },
            Err(e) => AttemptResult {
                status_code: None,
                error: Some(if e.is_timeout() {
                    format!("request timed out: {}", e)
                } else {
                    format!("request failed: {}", e)
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(retry_delay(0), ChronoDuration::zero());
        assert_eq!(retry_delay(1), ChronoDuration::minutes(5));
        assert_eq!(retry_delay(2), ChronoDuration::minutes(15));
        assert_eq!(retry_delay(3), ChronoDuration::minutes(25));
        assert_eq!(retry_delay(4), ChronoDuration::minutes(35));
        assert_eq!(retry_delay(9), ChronoDuration::minutes(35));
    }

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"event_type":"chargeback.created"}"#;
        let signature = sign("whsec_test", body).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(verify_signature("whsec_test", body, &signature));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("whsec_test", b"tampered", &signature));
        assert!(!verify_signature("whsec_test", body, "not-hex"));
    }
}
