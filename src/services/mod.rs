pub mod billing;
pub mod disputes;
pub mod idempotency;
pub mod jobs;
pub mod transactions;
pub mod webhooks;

pub use billing::{BillingReport, BillingScheduler, NewSubscription};
pub use disputes::{DisputeReconciler, DriftNotice, ReconcileReport};
pub use idempotency::{fingerprint_of, IdempotencyGuard};
pub use jobs::{JobGuard, JOB_BILLING, JOB_DISPUTE_SYNC, JOB_WEBHOOK_DELIVERY};
pub use transactions::{CaptureRequest, ChargeRequest, RefundRequest, TransactionService, VoidRequest};
pub use webhooks::{DeliveryReport, WebhookDispatcher};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::memory::{
    InMemoryAuditRepository, InMemoryChargebackRepository, InMemoryIdempotencyStore,
    InMemoryJobLockRepository, InMemorySubscriptionRepository, InMemoryTransactionRepository,
    InMemoryWebhookRepository,
};
use crate::adapters::postgres::{
    PostgresAuditRepository, PostgresChargebackRepository, PostgresIdempotencyStore,
    PostgresJobLockRepository, PostgresSubscriptionRepository, PostgresTransactionRepository,
    PostgresWebhookRepository,
};
use crate::domain::AuditEntry;
use crate::error::PaymentError;
use crate::ports::{
    AuditRepository, ChargebackRepository, DisputeSource, IdempotencyStore, JobLockRepository,
    PaymentGateway, SubscriptionRepository, TransactionRepository, WebhookRepository,
};

/// Tunables for the engine's services.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub gateway_timeout: Duration,
    pub idempotency_ttl: ChronoDuration,
    /// How long a duplicate request waits for the in-flight original.
    pub idempotency_wait: Duration,
    pub idempotency_poll_interval: Duration,
    pub billing_max_retries: i32,
    pub dispute_lookback: ChronoDuration,
    pub dispute_max_pages: usize,
    pub webhook_timeout: Duration,
    pub webhook_concurrency: usize,
    pub webhook_batch_size: i64,
    pub job_lock_timeout: ChronoDuration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(30),
            idempotency_ttl: ChronoDuration::hours(24),
            idempotency_wait: Duration::from_secs(35),
            idempotency_poll_interval: Duration::from_millis(100),
            billing_max_retries: 3,
            dispute_lookback: ChronoDuration::hours(48),
            dispute_max_pages: 100,
            webhook_timeout: Duration::from_secs(10),
            webhook_concurrency: 8,
            webhook_batch_size: 100,
            job_lock_timeout: ChronoDuration::minutes(15),
        }
    }
}

/// The set of persistence ports the engine writes through.
#[derive(Clone)]
pub struct Repositories {
    pub transactions: Arc<dyn TransactionRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub chargebacks: Arc<dyn ChargebackRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub audit: Arc<dyn AuditRepository>,
    pub job_locks: Arc<dyn JobLockRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            transactions: Arc::new(PostgresTransactionRepository::new(pool.clone())),
            subscriptions: Arc::new(PostgresSubscriptionRepository::new(pool.clone())),
            chargebacks: Arc::new(PostgresChargebackRepository::new(pool.clone())),
            webhooks: Arc::new(PostgresWebhookRepository::new(pool.clone())),
            idempotency: Arc::new(PostgresIdempotencyStore::new(pool.clone())),
            audit: Arc::new(PostgresAuditRepository::new(pool.clone())),
            job_locks: Arc::new(PostgresJobLockRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            transactions: Arc::new(InMemoryTransactionRepository::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
            chargebacks: Arc::new(InMemoryChargebackRepository::new()),
            webhooks: Arc::new(InMemoryWebhookRepository::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            audit: Arc::new(InMemoryAuditRepository::new()),
            job_locks: Arc::new(InMemoryJobLockRepository::new()),
        }
    }
}

/// All services wired over one set of repositories.
#[derive(Clone)]
pub struct Engine {
    pub transactions: Arc<TransactionService>,
    pub billing: Arc<BillingScheduler>,
    pub disputes: Arc<DisputeReconciler>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub idempotency: IdempotencyGuard,
    pub jobs: JobGuard,
}

impl Engine {
    pub fn new(
        repos: Repositories,
        gateway: Arc<dyn PaymentGateway>,
        dispute_source: Arc<dyn DisputeSource>,
        settings: EngineSettings,
    ) -> Self {
        let idempotency = IdempotencyGuard::new(
            repos.idempotency.clone(),
            settings.idempotency_ttl,
            settings.idempotency_wait,
            settings.idempotency_poll_interval,
        );
        let webhooks = Arc::new(WebhookDispatcher::new(
            repos.webhooks.clone(),
            repos.audit.clone(),
            settings.webhook_timeout,
            settings.webhook_concurrency,
            settings.webhook_batch_size,
        ));
        let transactions = Arc::new(TransactionService::new(
            repos.transactions.clone(),
            repos.audit.clone(),
            gateway,
            idempotency.clone(),
            settings.gateway_timeout,
        ));
        let billing = Arc::new(BillingScheduler::new(
            repos.subscriptions.clone(),
            transactions.clone(),
            webhooks.clone(),
            repos.audit.clone(),
            settings.billing_max_retries,
        ));
        let disputes = Arc::new(DisputeReconciler::new(
            dispute_source,
            repos.chargebacks.clone(),
            repos.transactions.clone(),
            webhooks.clone(),
            repos.audit.clone(),
            settings.dispute_lookback,
            settings.dispute_max_pages,
        ));
        let jobs = JobGuard::new(repos.job_locks.clone(), settings.job_lock_timeout);

        Self {
            transactions,
            billing,
            disputes,
            webhooks,
            idempotency,
            jobs,
        }
    }

    pub async fn run_billing(&self, now: DateTime<Utc>) -> Result<BillingReport, PaymentError> {
        self.jobs.run(JOB_BILLING, || self.billing.run(now)).await
    }

    pub async fn run_dispute_sync(&self, now: DateTime<Utc>) -> Result<ReconcileReport, PaymentError> {
        self.jobs.run(JOB_DISPUTE_SYNC, || self.disputes.run(now)).await
    }

    pub async fn deliver_webhooks(&self, now: DateTime<Utc>) -> Result<DeliveryReport, PaymentError> {
        self.jobs
            .run(JOB_WEBHOOK_DELIVERY, || self.webhooks.deliver_due(now))
            .await
    }

    pub async fn purge_idempotency(&self) -> Result<u64, PaymentError> {
        self.idempotency.purge_expired().await
    }
}

/// Writes an audit entry. Failures are logged; they never undo the change
/// being audited.
pub(crate) async fn record_audit(audit: &dyn AuditRepository, entry: AuditEntry) {
    if let Err(e) = audit.record(&entry).await {
        tracing::error!(
            entity_id = %entry.entity_id,
            action = %entry.action,
            error = %e,
            "Failed to write audit entry"
        );
    }
}
