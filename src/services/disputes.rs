//! Mirrors the gateway's chargeback records into local state.
//!
//! The reconciler is re-entrant: a case number is the natural key, unchanged
//! records are left alone, and every insert or update emits exactly one
//! webhook event. The event is queued before the row is written and carries
//! a dedup key derived from the case and the row version it replaces, so a
//! run interrupted between the two steps re-emits nothing when it is
//! repeated. Suspicious remote data is reported as drift and never silently
//! corrected.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::record_audit;
use super::webhooks::WebhookDispatcher;
use crate::domain::webhook::{EVENT_CHARGEBACK_CREATED, EVENT_CHARGEBACK_UPDATED};
use crate::domain::{AuditEntry, Chargeback, RemoteDispute, WebhookEvent};
use crate::error::PaymentError;
use crate::ports::{AuditRepository, ChargebackRepository, DisputeSource, TransactionRepository};

const ENTITY_CHARGEBACK: &str = "chargeback";
const ACTOR: &str = "dispute_reconciler";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftNotice {
    pub case_number: String,
    pub merchant_id: String,
    pub detail: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub merchants: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub drift: Vec<DriftNotice>,
    pub errors: usize,
}

pub struct DisputeReconciler {
    source: Arc<dyn DisputeSource>,
    chargebacks: Arc<dyn ChargebackRepository>,
    transactions: Arc<dyn TransactionRepository>,
    webhooks: Arc<WebhookDispatcher>,
    audit: Arc<dyn AuditRepository>,
    lookback: ChronoDuration,
    max_pages: usize,
}

impl DisputeReconciler {
    pub fn new(
        source: Arc<dyn DisputeSource>,
        chargebacks: Arc<dyn ChargebackRepository>,
        transactions: Arc<dyn TransactionRepository>,
        webhooks: Arc<WebhookDispatcher>,
        audit: Arc<dyn AuditRepository>,
        lookback: ChronoDuration,
        max_pages: usize,
    ) -> Self {
        Self {
            source,
            chargebacks,
            transactions,
            webhooks,
            audit,
            lookback,
            max_pages: max_pages.max(1),
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReconcileReport, PaymentError> {
        let since = now - self.lookback;
        let merchants = self.transactions.merchants().await?;
        let mut report = ReconcileReport {
            merchants: merchants.len(),
            ..ReconcileReport::default()
        };
        tracing::info!(merchants = report.merchants, %since, "Dispute sync started");

        for merchant_id in &merchants {
            if let Err(e) = self.sync_merchant(merchant_id, since, &mut report).await {
                tracing::warn!(merchant_id = %merchant_id, error = %e, "Dispute fetch failed for merchant");
                report.errors += 1;
            }
        }

        tracing::info!(
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            drift = report.drift.len(),
            errors = report.errors,
            "Dispute sync finished"
        );
        Ok(report)
    }

    async fn sync_merchant(
        &self,
        merchant_id: &str,
        since: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<(), PaymentError> {
        let mut cursor: Option<String> = None;

        for _ in 0..self.max_pages {
            let page = self
                .source
                .search_disputes(since, merchant_id, cursor.as_deref())
                .await
                .map_err(PaymentError::from_gateway)?;

            for record in page.records {
                report.fetched += 1;
                let case_number = record.case_number.clone();
                if let Err(e) = self.reconcile(record, report).await {
                    tracing::error!(case_number = %case_number, error = %e, "Failed to reconcile dispute");
                    report.errors += 1;
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }

        tracing::warn!(merchant_id, max_pages = self.max_pages, "Dispute search truncated at page limit");
        Ok(())
    }

    async fn reconcile(&self, remote: RemoteDispute, report: &mut ReconcileReport) -> Result<(), PaymentError> {
        let group_id = self.resolve_group(&remote, report).await?;

        match self.chargebacks.find_by_case_number(&remote.case_number).await? {
            None => {
                let chargeback = Chargeback::from_remote(&remote, group_id);
                let dedup_key = format!("{}:{}", EVENT_CHARGEBACK_CREATED, chargeback.case_number);
                self.emit(EVENT_CHARGEBACK_CREATED, &chargeback, dedup_key).await?;
                let chargeback = self.chargebacks.insert(&chargeback).await?;
                self.audit_change(&chargeback, "created", None).await;
                tracing::info!(
                    case_number = %chargeback.case_number,
                    status = chargeback.status.as_str(),
                    "Chargeback recorded"
                );
                report.created += 1;
            }
            Some(existing) if !existing.differs_from(&remote) => {
                report.unchanged += 1;
            }
            Some(mut existing) => {
                if existing.is_regressed_by(&remote) {
                    self.drift(
                        report,
                        &remote,
                        format!(
                            "decided case reported as {} after {}",
                            remote.status.as_str(),
                            existing.status.as_str()
                        ),
                    );
                }
                let before = existing.clone();
                existing.apply_remote(&remote, group_id);
                let dedup_key = format!(
                    "{}:{}:v{}",
                    EVENT_CHARGEBACK_UPDATED, existing.case_number, existing.version
                );
                self.emit(EVENT_CHARGEBACK_UPDATED, &existing, dedup_key).await?;
                let chargeback = self.chargebacks.update(&existing).await?;
                self.audit_change(&chargeback, "updated", Some(&before)).await;
                tracing::info!(
                    case_number = %chargeback.case_number,
                    from = before.status.as_str(),
                    to = chargeback.status.as_str(),
                    "Chargeback updated"
                );
                report.updated += 1;
            }
        }
        Ok(())
    }

    async fn resolve_group(
        &self,
        remote: &RemoteDispute,
        report: &mut ReconcileReport,
    ) -> Result<Option<Uuid>, PaymentError> {
        let Some(reference) = remote.transaction_reference.as_deref() else {
            return Ok(None);
        };
        match self.transactions.find_by_gateway_reference(reference).await? {
            Some(tx) => Ok(Some(tx.group_id)),
            None => {
                self.drift(
                    report,
                    remote,
                    format!("references unknown transaction {}", reference),
                );
                Ok(None)
            }
        }
    }

    fn drift(&self, report: &mut ReconcileReport, remote: &RemoteDispute, detail: String) {
        let error = PaymentError::ReconciliationDrift {
            case_number: remote.case_number.clone(),
            detail: detail.clone(),
        };
        tracing::warn!(merchant_id = %remote.merchant_id, error = %error, "Reconciliation drift");
        report.drift.push(DriftNotice {
            case_number: remote.case_number.clone(),
            merchant_id: remote.merchant_id.clone(),
            detail,
        });
    }

    async fn emit(&self, event_type: &str, chargeback: &Chargeback, dedup_key: String) -> Result<(), PaymentError> {
        let event = WebhookEvent::new(
            event_type,
            &chargeback.merchant_id,
            serde_json::json!({
                "case_number": chargeback.case_number,
                "group_id": chargeback.group_id,
                "amount": chargeback.amount.to_string(),
                "currency": chargeback.currency,
                "reason_code": chargeback.reason_code,
                "status": chargeback.status,
            }),
        )
        .with_dedup_key(dedup_key);
        self.webhooks.enqueue(event).await?;
        Ok(())
    }

    async fn audit_change(&self, chargeback: &Chargeback, action: &str, before: Option<&Chargeback>) {
        let snapshot = |cb: &Chargeback| {
            serde_json::json!({
                "status": cb.status,
                "amount": cb.amount.to_string(),
                "reason_code": cb.reason_code,
            })
        };
        let entry = AuditEntry::new(chargeback.id, ENTITY_CHARGEBACK, action, ACTOR)
            .with_change(before.map(snapshot), Some(snapshot(chargeback)));
        record_audit(self.audit.as_ref(), entry).await;
    }
}
