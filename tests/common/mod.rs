#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use payflow_core::adapters::memory::{
    InMemoryAuditRepository, InMemoryChargebackRepository, InMemoryIdempotencyStore,
    InMemoryJobLockRepository, InMemorySubscriptionRepository, InMemoryTransactionRepository,
    InMemoryWebhookRepository,
};
use payflow_core::domain::gateway::{
    CaptureCall, FailureCategory, GatewayApproval, GatewayFailure, GatewayResult, PaymentCall,
    RefundCall, VoidCall,
};
use payflow_core::domain::{AuditEntry, ChargebackStatus, DisputePage, RemoteDispute, Transaction};
use payflow_core::ports::{AuditRepository, DisputeSource, PaymentGateway, TransactionRepository};
use payflow_core::services::{ChargeRequest, Engine, EngineSettings, Repositories};

pub fn dec(value: &str) -> BigDecimal {
    value.parse().unwrap()
}

pub fn charge_request(merchant_id: &str, amount: &str) -> ChargeRequest {
    ChargeRequest {
        merchant_id: merchant_id.to_string(),
        customer_id: "cust-1".to_string(),
        amount: dec(amount),
        currency: "USD".to_string(),
        payment_token: "tok_visa".to_string(),
    }
}

pub fn approval(reference: &str) -> GatewayResult {
    Ok(GatewayApproval {
        reference: reference.to_string(),
        response_code: "00".to_string(),
        message: "approved".to_string(),
    })
}

pub fn decline() -> GatewayResult {
    Err(GatewayFailure::terminal(
        FailureCategory::Declined,
        Some("05"),
        "do not honor",
    ))
}

pub fn upstream_error() -> GatewayResult {
    Err(GatewayFailure::retriable(
        FailureCategory::Upstream,
        "gateway returned 503",
    ))
}

/// Scripted gateway. Queued results are consumed in call order; once the
/// queue is empty every call is approved with a fresh reference.
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<VecDeque<GatewayResult>>,
    operations: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, result: GatewayResult) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Drops scripted results the last request never consumed.
    pub fn clear(&self) {
        self.script.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    async fn respond(&self, operation: &str) -> GatewayResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.operations.lock().unwrap().push(operation.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| approval(&format!("ref-{}", n)))
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn authorize(&self, _call: &PaymentCall) -> GatewayResult {
        self.respond("authorize").await
    }

    async fn sale(&self, _call: &PaymentCall) -> GatewayResult {
        self.respond("sale").await
    }

    async fn capture(&self, _call: &CaptureCall) -> GatewayResult {
        self.respond("capture").await
    }

    async fn void(&self, _call: &VoidCall) -> GatewayResult {
        self.respond("void").await
    }

    async fn refund(&self, _call: &RefundCall) -> GatewayResult {
        self.respond("refund").await
    }
}

/// Dispute source serving fixed pages per merchant; the cursor is the page index.
#[derive(Default)]
pub struct FakeDisputeSource {
    pages: Mutex<HashMap<String, Vec<Vec<RemoteDispute>>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeDisputeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pages(&self, merchant_id: &str, pages: Vec<Vec<RemoteDispute>>) {
        self.pages
            .lock()
            .unwrap()
            .insert(merchant_id.to_string(), pages);
    }

    pub fn fail_for(&self, merchant_id: &str) {
        self.failing.lock().unwrap().insert(merchant_id.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisputeSource for FakeDisputeSource {
    async fn search_disputes(
        &self,
        _since: DateTime<Utc>,
        merchant_id: &str,
        cursor: Option<&str>,
    ) -> Result<DisputePage, GatewayFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(merchant_id) {
            return Err(GatewayFailure::retriable(
                FailureCategory::Network,
                "dispute search unreachable",
            ));
        }

        let index: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let pages = self.pages.lock().unwrap();
        let Some(merchant_pages) = pages.get(merchant_id) else {
            return Ok(DisputePage::default());
        };
        let records = merchant_pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < merchant_pages.len()).then(|| (index + 1).to_string());
        Ok(DisputePage {
            records,
            next_cursor,
        })
    }
}

pub fn remote_dispute(
    case_number: &str,
    merchant_id: &str,
    reference: Option<&str>,
    amount: &str,
    status: ChargebackStatus,
) -> RemoteDispute {
    RemoteDispute {
        case_number: case_number.to_string(),
        merchant_id: merchant_id.to_string(),
        transaction_reference: reference.map(str::to_string),
        amount: dec(amount),
        currency: "USD".to_string(),
        reason_code: "4837".to_string(),
        status,
        raw: serde_json::json!({ "case_number": case_number, "status": status }),
    }
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        gateway_timeout: Duration::from_secs(2),
        idempotency_wait: Duration::from_secs(5),
        idempotency_poll_interval: Duration::from_millis(5),
        billing_max_retries: 3,
        dispute_lookback: ChronoDuration::hours(48),
        dispute_max_pages: 10,
        webhook_timeout: Duration::from_secs(2),
        webhook_concurrency: 4,
        ..EngineSettings::default()
    }
}

/// An engine over in-memory adapters with typed handles for assertions.
pub struct Harness {
    pub engine: Engine,
    pub gateway: Arc<FakeGateway>,
    pub disputes: Arc<FakeDisputeSource>,
    pub transactions: Arc<InMemoryTransactionRepository>,
    pub subscriptions: Arc<InMemorySubscriptionRepository>,
    pub chargebacks: Arc<InMemoryChargebackRepository>,
    pub webhooks: Arc<InMemoryWebhookRepository>,
    pub audit: Arc<InMemoryAuditRepository>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gateway(FakeGateway::new())
    }

    pub fn with_gateway(gateway: FakeGateway) -> Self {
        Self::with_settings(gateway, test_settings())
    }

    pub fn with_settings(gateway: FakeGateway, settings: EngineSettings) -> Self {
        let gateway = Arc::new(gateway);
        let disputes = Arc::new(FakeDisputeSource::new());
        let transactions = Arc::new(InMemoryTransactionRepository::new());
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        let chargebacks = Arc::new(InMemoryChargebackRepository::new());
        let webhooks = Arc::new(InMemoryWebhookRepository::new());
        let audit = Arc::new(InMemoryAuditRepository::new());

        let repos = Repositories {
            transactions: transactions.clone(),
            subscriptions: subscriptions.clone(),
            chargebacks: chargebacks.clone(),
            webhooks: webhooks.clone(),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            audit: audit.clone(),
            job_locks: Arc::new(InMemoryJobLockRepository::new()),
        };
        let engine = Engine::new(repos, gateway.clone(), disputes.clone(), settings);

        Self {
            engine,
            gateway,
            disputes,
            transactions,
            subscriptions,
            chargebacks,
            webhooks,
            audit,
        }
    }

    /// Registers an endpoint so emitted events become observable deliveries.
    pub async fn listen(&self, merchant_id: &str, url: &str) {
        self.engine
            .webhooks
            .register_endpoint(merchant_id, url, "whsec_test", Vec::new())
            .await
            .unwrap();
    }

    pub async fn transaction_by_key(&self, key: &str) -> Transaction {
        self.transactions
            .find_by_idempotency_key(key)
            .await
            .unwrap()
            .expect("no transaction for key")
    }

    pub async fn audit_for(&self, entity_id: uuid::Uuid) -> Vec<AuditEntry> {
        self.audit.list_for_entity(entity_id).await.unwrap()
    }

    pub async fn events(&self) -> Vec<String> {
        let mut deliveries = self.webhooks.deliveries().await;
        deliveries.sort_by_key(|d| d.created_at);
        deliveries.into_iter().map(|d| d.event_type).collect()
    }
}
