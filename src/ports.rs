//! Boundaries between the payment core and the outside world.
//!
//! Repositories own persistence; `PaymentGateway` and `DisputeSource` are the
//! two external systems the engine consumes. Every repository `update` is a
//! compare-and-swap on the record's `version` and fails with
//! [`RepositoryError::Conflict`] when another writer got there first.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::chargeback::DisputePage;
use crate::domain::gateway::{CaptureCall, GatewayFailure, GatewayResult, PaymentCall, RefundCall, VoidCall};
use crate::domain::{
    AuditEntry, BeginOutcome, Chargeback, IdempotencyRecord, Subscription, Transaction,
    WebhookDelivery, WebhookEndpoint,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Duplicate(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Fails with `Duplicate` when the idempotency key is already taken.
    async fn insert(&self, tx: &Transaction) -> RepositoryResult<Transaction>;

    async fn update(&self, tx: &Transaction) -> RepositoryResult<Transaction>;

    async fn get(&self, id: Uuid) -> RepositoryResult<Transaction>;

    async fn find_by_idempotency_key(&self, key: &str) -> RepositoryResult<Option<Transaction>>;

    /// The authorization or sale row that opened the group.
    async fn find_primary(&self, group_id: Uuid) -> RepositoryResult<Transaction>;

    /// All rows of a group, oldest first.
    async fn list_group(&self, group_id: Uuid) -> RepositoryResult<Vec<Transaction>>;

    async fn find_by_gateway_reference(&self, reference: &str) -> RepositoryResult<Option<Transaction>>;

    /// Distinct merchant ids that own at least one transaction.
    async fn merchants(&self) -> RepositoryResult<Vec<String>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn insert(&self, sub: &Subscription) -> RepositoryResult<Subscription>;

    async fn update(&self, sub: &Subscription) -> RepositoryResult<Subscription>;

    async fn get(&self, id: Uuid) -> RepositoryResult<Subscription>;

    /// Active subscriptions whose next billing date is on or before `today`.
    async fn list_due(&self, today: NaiveDate) -> RepositoryResult<Vec<Subscription>>;
}

#[async_trait]
pub trait ChargebackRepository: Send + Sync {
    /// Fails with `Duplicate` when the case number already exists.
    async fn insert(&self, chargeback: &Chargeback) -> RepositoryResult<Chargeback>;

    async fn update(&self, chargeback: &Chargeback) -> RepositoryResult<Chargeback>;

    async fn find_by_case_number(&self, case_number: &str) -> RepositoryResult<Option<Chargeback>>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> RepositoryResult<WebhookEndpoint>;

    async fn get_endpoint(&self, id: Uuid) -> RepositoryResult<WebhookEndpoint>;

    async fn list_endpoints(&self, merchant_id: &str) -> RepositoryResult<Vec<WebhookEndpoint>>;

    /// Fails with `Duplicate` when the endpoint already has a delivery with
    /// the same dedup key.
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> RepositoryResult<WebhookDelivery>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> RepositoryResult<WebhookDelivery>;

    async fn get_delivery(&self, id: Uuid) -> RepositoryResult<WebhookDelivery>;

    /// Claims up to `limit` due pending deliveries by pushing their
    /// `next_retry_at` to `lease_until`, so no other worker picks them up
    /// while the attempt is in flight. Returned rows carry the bumped version.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookDelivery>>;

    async fn list_failed(&self, limit: i64) -> RepositoryResult<Vec<WebhookDelivery>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts `record` unless a live (unexpired) record exists for its key.
    async fn try_begin(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> RepositoryResult<BeginOutcome>;

    /// Stores the outcome for `key` if `holder` still owns the claim;
    /// `Conflict` once another claim has taken the key over.
    async fn complete(
        &self,
        key: &str,
        holder: Uuid,
        outcome: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    /// Deletes the claim for `key` if `holder` still owns it.
    async fn release(&self, key: &str, holder: Uuid) -> RepositoryResult<()>;

    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>>;

    /// Deletes expired records, returning how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> RepositoryResult<u64>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> RepositoryResult<()>;

    async fn list_for_entity(&self, entity_id: Uuid) -> RepositoryResult<Vec<AuditEntry>>;
}

#[async_trait]
pub trait JobLockRepository: Send + Sync {
    /// Takes the run marker for `job` unless another holder's marker is still live.
    async fn try_acquire(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    async fn release(&self, job: &str, holder: &str) -> RepositoryResult<()>;
}

/// The third-party card/ACH processor.
///
/// Implementations classify every failure as retriable or terminal; callers
/// never see raw gateway response codes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize(&self, call: &PaymentCall) -> GatewayResult;

    async fn sale(&self, call: &PaymentCall) -> GatewayResult;

    async fn capture(&self, call: &CaptureCall) -> GatewayResult;

    async fn void(&self, call: &VoidCall) -> GatewayResult;

    async fn refund(&self, call: &RefundCall) -> GatewayResult;
}

/// Paged search over the gateway's chargeback records.
#[async_trait]
pub trait DisputeSource: Send + Sync {
    async fn search_disputes(
        &self,
        since: DateTime<Utc>,
        merchant_id: &str,
        cursor: Option<&str>,
    ) -> Result<DisputePage, GatewayFailure>;
}
