use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub const EVENT_CHARGEBACK_CREATED: &str = "chargeback.created";
pub const EVENT_CHARGEBACK_UPDATED: &str = "chargeback.updated";
pub const EVENT_SUBSCRIPTION_PAYMENT_FAILED: &str = "subscription.payment_failed";

/// A merchant's registered receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub merchant_id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Empty means every event type.
    pub event_types: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn new(merchant_id: &str, url: &str, secret: &str, event_types: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            merchant_id: merchant_id.to_string(),
            url: url.to_string(),
            secret: secret.to_string(),
            event_types,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        self.active && (self.event_types.is_empty() || self.event_types.iter().any(|e| e == event_type))
    }
}

/// Notification produced by the engine, before fan-out to endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    /// Identifies the change being announced. At most one delivery per
    /// endpoint is ever queued for a given key.
    #[serde(skip)]
    pub dedup_key: Option<String>,
}

impl WebhookEvent {
    pub fn new(event_type: &str, agent_id: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            data,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn new(endpoint_id: Uuid, event: &WebhookEvent, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            endpoint_id,
            event_type: event.event_type.clone(),
            payload,
            dedup_key: event.dedup_key.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_retry_at: Some(now),
            last_status_code: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }
}
