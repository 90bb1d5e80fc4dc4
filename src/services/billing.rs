//! Recurring billing over due subscriptions.
//!
//! `run` is re-entrant: each charge uses the key `sub_{id}_{next_billing_date}`,
//! so running twice for the same date replays the first outcome instead of
//! charging again.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::record_audit;
use super::transactions::{ChargeRequest, TransactionService};
use super::webhooks::WebhookDispatcher;
use crate::domain::webhook::EVENT_SUBSCRIPTION_PAYMENT_FAILED;
use crate::domain::{
    Amount, AuditEntry, Currency, FailureOption, Frequency, GatewayFailure, RetryDecision,
    Subscription, SubscriptionStatus, WebhookEvent,
};
use crate::error::PaymentError;
use crate::ports::{AuditRepository, RepositoryError, SubscriptionRepository};

const ENTITY_SUBSCRIPTION: &str = "subscription";
const ACTOR: &str = "billing_scheduler";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub merchant_id: String,
    pub customer_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub frequency: Frequency,
    pub payment_method_token: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_failure_option")]
    pub failure_option: FailureOption,
}

fn default_failure_option() -> FailureOption {
    FailureOption::Skip
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BillingReport {
    pub due: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub paused: usize,
    pub expired: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BillingOutcome {
    Succeeded,
    Retried,
    Paused,
    Expired,
    Skipped,
}

pub struct BillingScheduler {
    subscriptions: Arc<dyn SubscriptionRepository>,
    transactions: Arc<TransactionService>,
    webhooks: Arc<WebhookDispatcher>,
    audit: Arc<dyn AuditRepository>,
    max_retries: i32,
}

impl BillingScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        transactions: Arc<TransactionService>,
        webhooks: Arc<WebhookDispatcher>,
        audit: Arc<dyn AuditRepository>,
        max_retries: i32,
    ) -> Self {
        Self {
            subscriptions,
            transactions,
            webhooks,
            audit,
            max_retries: max_retries.max(1),
        }
    }

    pub async fn create(&self, request: NewSubscription) -> Result<Subscription, PaymentError> {
        if request.merchant_id.trim().is_empty() || request.customer_id.trim().is_empty() {
            return Err(PaymentError::InvalidInput(
                "merchant_id and customer_id are required".to_string(),
            ));
        }
        if request.payment_method_token.trim().is_empty() {
            return Err(PaymentError::InvalidInput(
                "payment_method_token is required".to_string(),
            ));
        }
        if matches!(request.end_date, Some(end) if end < request.start_date) {
            return Err(PaymentError::InvalidInput(
                "end_date is before start_date".to_string(),
            ));
        }
        let currency = Currency::new(&request.currency)?;
        let amount = Amount::new(request.amount, &currency)?;

        let sub = Subscription::new(
            request.merchant_id,
            request.customer_id,
            amount.into_inner(),
            currency.code().to_string(),
            request.frequency,
            request.payment_method_token,
            request.start_date,
            request.end_date,
            request.failure_option,
        );
        let sub = self.subscriptions.insert(&sub).await?;
        self.audit_change(&sub, "created", None).await;
        tracing::info!(subscription_id = %sub.id, next_billing_date = %sub.next_billing_date, "Subscription created");
        Ok(sub)
    }

    pub async fn get(&self, id: Uuid) -> Result<Subscription, PaymentError> {
        self.subscriptions.get(id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => PaymentError::NotFound(format!("subscription {}", id)),
            other => other.into(),
        })
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Subscription, PaymentError> {
        let mut sub = self.get(id).await?;
        let before = sub.status;
        sub.cancel()?;
        let sub = self.subscriptions.update(&sub).await?;
        self.audit_change(&sub, "cancelled", Some(before)).await;
        Ok(sub)
    }

    pub async fn resume(&self, id: Uuid, today: NaiveDate) -> Result<Subscription, PaymentError> {
        let mut sub = self.get(id).await?;
        let before = sub.status;
        sub.resume(today)?;
        let sub = self.subscriptions.update(&sub).await?;
        self.audit_change(&sub, "resumed", Some(before)).await;
        Ok(sub)
    }

    /// Bills every active subscription due on or before `now`'s date.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<BillingReport, PaymentError> {
        let today = now.date_naive();
        let due = self.subscriptions.list_due(today).await?;
        let mut report = BillingReport {
            due: due.len(),
            ..BillingReport::default()
        };
        tracing::info!(due = report.due, %today, "Billing run started");

        for sub in due {
            let id = sub.id;
            match self.bill(sub).await {
                Ok(BillingOutcome::Succeeded) => report.succeeded += 1,
                Ok(BillingOutcome::Retried) => report.retried += 1,
                Ok(BillingOutcome::Paused) => report.paused += 1,
                Ok(BillingOutcome::Expired) => report.expired += 1,
                Ok(BillingOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(subscription_id = %id, error = %e, "Billing failed for subscription");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            due = report.due,
            succeeded = report.succeeded,
            retried = report.retried,
            paused = report.paused,
            expired = report.expired,
            errors = report.errors,
            "Billing run finished"
        );
        Ok(report)
    }

    async fn bill(&self, mut sub: Subscription) -> Result<BillingOutcome, PaymentError> {
        let before = sub.status;

        if sub.has_lapsed() {
            sub.expire();
            return self
                .save(sub, "expired", before, BillingOutcome::Expired)
                .await;
        }

        let key = sub.billing_key();
        let billing_date = sub.next_billing_date;
        let request = ChargeRequest {
            merchant_id: sub.merchant_id.clone(),
            customer_id: sub.customer_id.clone(),
            amount: sub.amount.clone(),
            currency: sub.currency.clone(),
            payment_token: sub.payment_method_token.clone(),
        };

        match self.transactions.sale(&key, request).await {
            Ok(tx) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    transaction_id = %tx.id,
                    %billing_date,
                    "Subscription charged"
                );
                sub.record_success()?;
                self.save(sub, "charged", before, BillingOutcome::Succeeded)
                    .await
            }
            Err(PaymentError::RetriableGatewayFailure(failure)) => {
                let decision = sub.record_retriable_failure(self.max_retries)?;
                tracing::warn!(
                    subscription_id = %sub.id,
                    retry_count = sub.retry_count,
                    failure_option = sub.failure_option.as_str(),
                    ?decision,
                    failure = %failure,
                    "Subscription charge failed; will retry"
                );
                match decision {
                    RetryDecision::Paused => {
                        self.notify_failure(&sub, billing_date, &failure).await?;
                        self.save(sub, "paused", before, BillingOutcome::Paused).await
                    }
                    RetryDecision::Advanced | RetryDecision::Retained => {
                        self.save(sub, "retry_scheduled", before, BillingOutcome::Retried)
                            .await
                    }
                }
            }
            Err(PaymentError::TerminalGatewayFailure(failure)) => {
                sub.record_terminal_failure();
                tracing::warn!(subscription_id = %sub.id, failure = %failure, "Subscription charge declined");
                self.notify_failure(&sub, billing_date, &failure).await?;
                self.save(sub, "paused", before, BillingOutcome::Paused).await
            }
            Err(PaymentError::RequestInProgress(_)) => {
                tracing::info!(subscription_id = %sub.id, "Charge already in flight; skipping");
                Ok(BillingOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn notify_failure(
        &self,
        sub: &Subscription,
        billing_date: NaiveDate,
        failure: &GatewayFailure,
    ) -> Result<(), PaymentError> {
        let event = WebhookEvent::new(
            EVENT_SUBSCRIPTION_PAYMENT_FAILED,
            &sub.merchant_id,
            serde_json::json!({
                "subscription_id": sub.id,
                "customer_id": sub.customer_id,
                "amount": sub.amount.to_string(),
                "currency": sub.currency,
                "billing_date": billing_date,
                "retry_count": sub.retry_count,
                "status": sub.status,
                "failure": failure,
            }),
        );
        self.webhooks.enqueue(event).await?;
        Ok(())
    }

    async fn save(
        &self,
        sub: Subscription,
        action: &str,
        before: SubscriptionStatus,
        outcome: BillingOutcome,
    ) -> Result<BillingOutcome, PaymentError> {
        match self.subscriptions.update(&sub).await {
            Ok(saved) => {
                self.audit_change(&saved, action, Some(before)).await;
                Ok(outcome)
            }
            Err(RepositoryError::Conflict(_)) => {
                tracing::warn!(subscription_id = %sub.id, "Subscription modified concurrently; skipping");
                Ok(BillingOutcome::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn audit_change(&self, sub: &Subscription, action: &str, before: Option<SubscriptionStatus>) {
        let entry = AuditEntry::new(sub.id, ENTITY_SUBSCRIPTION, action, ACTOR).with_change(
            before.map(|status| serde_json::json!({ "status": status })),
            Some(serde_json::json!({
                "status": sub.status,
                "next_billing_date": sub.next_billing_date,
                "retry_count": sub.retry_count,
            })),
        );
        record_audit(self.audit.as_ref(), entry).await;
    }
}
