//! In-process implementations of every repository port.
//!
//! Used by the test suite and for running the service without Postgres. Each
//! store is an `Arc<RwLock<HashMap>>`; mutations happen under the write lock,
//! which gives the same atomicity the SQL adapters get from constraints.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::idempotency::IdempotencyState;
use crate::domain::{
    AuditEntry, BeginOutcome, Chargeback, DeliveryStatus, IdempotencyRecord, Subscription,
    SubscriptionStatus, Transaction, WebhookDelivery, WebhookEndpoint,
};
use crate::ports::{
    AuditRepository, ChargebackRepository, IdempotencyStore, JobLockRepository, RepositoryError,
    RepositoryResult, SubscriptionRepository, TransactionRepository, WebhookRepository,
};

fn conflict(kind: &str, id: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Conflict(format!("{} {}", kind, id))
}

#[derive(Clone, Default)]
pub struct InMemoryTransactionRepository {
    rows: Arc<RwLock<HashMap<Uuid, Transaction>>>,
}

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn insert(&self, tx: &Transaction) -> RepositoryResult<Transaction> {
        let mut rows = self.rows.write().await;
        if rows.values().any(|row| row.idempotency_key == tx.idempotency_key) {
            return Err(RepositoryError::Duplicate(format!(
                "idempotency key {}",
                tx.idempotency_key
            )));
        }
        rows.insert(tx.id, tx.clone());
        Ok(tx.clone())
    }

    async fn update(&self, tx: &Transaction) -> RepositoryResult<Transaction> {
        let mut rows = self.rows.write().await;
        let current = rows
            .get_mut(&tx.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", tx.id)))?;
        if current.version != tx.version {
            return Err(conflict("transaction", tx.id));
        }
        let mut updated = tx.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *current = updated.clone();
        Ok(updated)
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Transaction> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", id)))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> RepositoryResult<Option<Transaction>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.idempotency_key == key)
            .cloned())
    }

    async fn find_primary(&self, group_id: Uuid) -> RepositoryResult<Transaction> {
        self.rows
            .read()
            .await
            .values()
            .find(|row| row.group_id == group_id && row.parent_id.is_none())
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("transaction group {}", group_id)))
    }

    async fn list_group(&self, group_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        let mut rows: Vec<Transaction> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.group_id == group_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn find_by_gateway_reference(&self, reference: &str) -> RepositoryResult<Option<Transaction>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|row| row.gateway_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn merchants(&self) -> RepositoryResult<Vec<String>> {
        let merchants: BTreeSet<String> = self
            .rows
            .read()
            .await
            .values()
            .map(|row| row.merchant_id.clone())
            .collect();
        Ok(merchants.into_iter().collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemorySubscriptionRepository {
    rows: Arc<RwLock<HashMap<Uuid, Subscription>>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn insert(&self, sub: &Subscription) -> RepositoryResult<Subscription> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&sub.id) {
            return Err(RepositoryError::Duplicate(format!("subscription {}", sub.id)));
        }
        rows.insert(sub.id, sub.clone());
        Ok(sub.clone())
    }

    async fn update(&self, sub: &Subscription) -> RepositoryResult<Subscription> {
        let mut rows = self.rows.write().await;
        let current = rows
            .get_mut(&sub.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", sub.id)))?;
        if current.version != sub.version {
            return Err(conflict("subscription", sub.id));
        }
        let mut updated = sub.clone();
        updated.version += 1;
        *current = updated.clone();
        Ok(updated)
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Subscription> {
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", id)))
    }

    async fn list_due(&self, today: NaiveDate) -> RepositoryResult<Vec<Subscription>> {
        let mut due: Vec<Subscription> = self
            .rows
            .read()
            .await
            .values()
            .filter(|sub| sub.status == SubscriptionStatus::Active && sub.next_billing_date <= today)
            .cloned()
            .collect();
        due.sort_by_key(|sub| (sub.next_billing_date, sub.created_at));
        Ok(due)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryChargebackRepository {
    rows: Arc<RwLock<HashMap<String, Chargeback>>>,
}

impl InMemoryChargebackRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Chargeback> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ChargebackRepository for InMemoryChargebackRepository {
    async fn insert(&self, chargeback: &Chargeback) -> RepositoryResult<Chargeback> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&chargeback.case_number) {
            return Err(RepositoryError::Duplicate(format!(
                "chargeback case {}",
                chargeback.case_number
            )));
        }
        rows.insert(chargeback.case_number.clone(), chargeback.clone());
        Ok(chargeback.clone())
    }

    async fn update(&self, chargeback: &Chargeback) -> RepositoryResult<Chargeback> {
        let mut rows = self.rows.write().await;
        let current = rows.get_mut(&chargeback.case_number).ok_or_else(|| {
            RepositoryError::NotFound(format!("chargeback case {}", chargeback.case_number))
        })?;
        if current.version != chargeback.version {
            return Err(conflict("chargeback case", &chargeback.case_number));
        }
        let mut updated = chargeback.clone();
        updated.version += 1;
        *current = updated.clone();
        Ok(updated)
    }

    async fn find_by_case_number(&self, case_number: &str) -> RepositoryResult<Option<Chargeback>> {
        Ok(self.rows.read().await.get(case_number).cloned())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryWebhookRepository {
    endpoints: Arc<RwLock<HashMap<Uuid, WebhookEndpoint>>>,
    deliveries: Arc<RwLock<HashMap<Uuid, WebhookDelivery>>>,
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<WebhookDelivery> {
        self.deliveries.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> RepositoryResult<WebhookEndpoint> {
        self.endpoints
            .write()
            .await
            .insert(endpoint.id, endpoint.clone());
        Ok(endpoint.clone())
    }

    async fn get_endpoint(&self, id: Uuid) -> RepositoryResult<WebhookEndpoint> {
        self.endpoints
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook endpoint {}", id)))
    }

    async fn list_endpoints(&self, merchant_id: &str) -> RepositoryResult<Vec<WebhookEndpoint>> {
        let mut endpoints: Vec<WebhookEndpoint> = self
            .endpoints
            .read()
            .await
            .values()
            .filter(|ep| ep.merchant_id == merchant_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|ep| ep.created_at);
        Ok(endpoints)
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> RepositoryResult<WebhookDelivery> {
        let mut deliveries = self.deliveries.write().await;
        if let Some(key) = &delivery.dedup_key {
            let seen = deliveries.values().any(|existing| {
                existing.endpoint_id == delivery.endpoint_id && existing.dedup_key.as_ref() == Some(key)
            });
            if seen {
                return Err(RepositoryError::Duplicate(format!("webhook delivery {}", key)));
            }
        }
        deliveries.insert(delivery.id, delivery.clone());
        Ok(delivery.clone())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> RepositoryResult<WebhookDelivery> {
        let mut deliveries = self.deliveries.write().await;
        let current = deliveries
            .get_mut(&delivery.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook delivery {}", delivery.id)))?;
        if current.version != delivery.version {
            return Err(conflict("webhook delivery", delivery.id));
        }
        let mut updated = delivery.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *current = updated.clone();
        Ok(updated)
    }

    async fn get_delivery(&self, id: Uuid) -> RepositoryResult<WebhookDelivery> {
        self.deliveries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook delivery {}", id)))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookDelivery>> {
        let mut deliveries = self.deliveries.write().await;
        let mut due: Vec<&mut WebhookDelivery> = deliveries
            .values_mut()
            .filter(|d| d.is_due(now))
            .collect();
        due.sort_by_key(|d| (d.next_retry_at, d.created_at));

        let limit = usize::try_from(limit).unwrap_or(0);
        let mut claimed = Vec::new();
        for delivery in due.into_iter().take(limit) {
            delivery.next_retry_at = Some(lease_until);
            delivery.version += 1;
            claimed.push(delivery.clone());
        }
        Ok(claimed)
    }

    async fn list_failed(&self, limit: i64) -> RepositoryResult<Vec<WebhookDelivery>> {
        let mut failed: Vec<WebhookDelivery> = self
            .deliveries
            .read()
            .await
            .values()
            .filter(|d| d.status == DeliveryStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_begin(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> RepositoryResult<BeginOutcome> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.key) {
            if !existing.is_expired(now) {
                return Ok(BeginOutcome::Existing(existing.clone()));
            }
        }
        records.insert(record.key.clone(), record.clone());
        Ok(BeginOutcome::Started)
    }

    async fn complete(
        &self,
        key: &str,
        holder: Uuid,
        outcome: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(format!("idempotency key {}", key)))?;
        if record.holder != holder {
            return Err(conflict("idempotency key", key));
        }
        record.state = IdempotencyState::Completed;
        record.outcome = Some(outcome);
        record.expires_at = expires_at;
        Ok(())
    }

    async fn release(&self, key: &str, holder: Uuid) -> RepositoryResult<()> {
        let mut records = self.records.write().await;
        if records.get(key).is_some_and(|record| record.holder == holder) {
            records.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditRepository {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn record(&self, entry: &AuditEntry) -> RepositoryResult<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list_for_entity(&self, entity_id: Uuid) -> RepositoryResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryJobLockRepository {
    locks: Arc<RwLock<HashMap<String, (String, DateTime<Utc>)>>>,
}

impl InMemoryJobLockRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLockRepository for InMemoryJobLockRepository {
    async fn try_acquire(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut locks = self.locks.write().await;
        if let Some((_, held_until)) = locks.get(job) {
            if *held_until > now {
                return Ok(false);
            }
        }
        locks.insert(job.to_string(), (holder.to_string(), expires_at));
        Ok(true)
    }

    async fn release(&self, job: &str, holder: &str) -> RepositoryResult<()> {
        let mut locks = self.locks.write().await;
        if matches!(locks.get(job), Some((current, _)) if current == holder) {
            locks.remove(job);
        }
        Ok(())
    }
}
