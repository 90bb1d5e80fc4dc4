//! Authorize, sale, capture, void and refund against the gateway.
//!
//! Every operation runs under the idempotency guard and writes a pending row
//! before the gateway is called. A retriable failure leaves that row pending
//! so a resubmission with the same key drives the same row again; a terminal
//! failure marks it failed. Each row stores the fingerprint of the request
//! that created it, so a key reused with a different request conflicts even
//! after the idempotency record was released or expired.
//!
//! Capture and void reserve the primary row with a version compare-and-swap
//! before the gateway is called; refunds reserve their amount the same way.
//! The group lock is per process; the reservation holds across workers.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::idempotency::{fingerprint_of, IdempotencyGuard};
use super::record_audit;
use crate::domain::gateway::{
    CaptureCall, GatewayFailure, GatewayResult, PaymentCall, RefundCall, VoidCall,
};
use crate::domain::{
    Amount, AuditEntry, Currency, Transaction, TransactionKind, TransactionStatus,
};
use crate::error::PaymentError;
use crate::ports::{AuditRepository, PaymentGateway, RepositoryError, TransactionRepository};

/// Attempts at a version-checked update of the primary row before giving up.
const MAX_VERSION_RETRIES: usize = 5;

const ENTITY_TRANSACTION: &str = "transaction";
const ACTOR: &str = "payment_engine";

/// Authorization or sale request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub merchant_id: String,
    pub customer_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_token: String,
}

impl ChargeRequest {
    fn validate(&self) -> Result<(Amount, Currency), PaymentError> {
        for (field, value) in [
            ("merchant_id", &self.merchant_id),
            ("customer_id", &self.customer_id),
            ("payment_token", &self.payment_token),
        ] {
            if value.trim().is_empty() {
                return Err(PaymentError::InvalidInput(format!("{} is required", field)));
            }
        }
        let currency = Currency::new(&self.currency)?;
        let amount = Amount::new(self.amount.clone(), &currency)?;
        Ok((amount, currency))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub group_id: Uuid,
    /// Defaults to the full authorized amount.
    pub amount: Option<BigDecimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidRequest {
    pub group_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub group_id: Uuid,
    pub amount: BigDecimal,
}

/// In-process keyed mutex, one per transaction group.
#[derive(Default)]
pub struct GroupLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    pub async fn lock(&self, group_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(group_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct TransactionService {
    transactions: Arc<dyn TransactionRepository>,
    audit: Arc<dyn AuditRepository>,
    gateway: Arc<dyn PaymentGateway>,
    guard: IdempotencyGuard,
    locks: GroupLocks,
    gateway_timeout: Duration,
}

impl TransactionService {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        audit: Arc<dyn AuditRepository>,
        gateway: Arc<dyn PaymentGateway>,
        guard: IdempotencyGuard,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            transactions,
            audit,
            gateway,
            guard,
            locks: GroupLocks::default(),
            gateway_timeout,
        }
    }

    pub async fn authorize(&self, key: &str, request: ChargeRequest) -> Result<Transaction, PaymentError> {
        self.charge(TransactionKind::Authorization, key, request).await
    }

    /// Authorize and capture in one gateway call.
    pub async fn sale(&self, key: &str, request: ChargeRequest) -> Result<Transaction, PaymentError> {
        self.charge(TransactionKind::Sale, key, request).await
    }

    pub async fn capture(&self, key: &str, request: CaptureRequest) -> Result<Transaction, PaymentError> {
        let fingerprint = fingerprint_of("capture", &request)?;
        self.guard
            .execute(key, &fingerprint, || self.run_capture(key, &fingerprint, request))
            .await
    }

    pub async fn void(&self, key: &str, request: VoidRequest) -> Result<Transaction, PaymentError> {
        let fingerprint = fingerprint_of("void", &request)?;
        self.guard
            .execute(key, &fingerprint, || self.run_void(key, &fingerprint, request))
            .await
    }

    pub async fn refund(&self, key: &str, request: RefundRequest) -> Result<Transaction, PaymentError> {
        let fingerprint = fingerprint_of("refund", &request)?;
        self.guard
            .execute(key, &fingerprint, || self.run_refund(key, &fingerprint, request))
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Transaction, PaymentError> {
        self.transactions.get(id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => PaymentError::NotFound(format!("transaction {}", id)),
            other => other.into(),
        })
    }

    /// Every row of a group, primary first.
    pub async fn group(&self, group_id: Uuid) -> Result<Vec<Transaction>, PaymentError> {
        let mut rows = self.transactions.list_group(group_id).await?;
        if rows.is_empty() {
            return Err(PaymentError::NotFound(format!("transaction group {}", group_id)));
        }
        rows.sort_by_key(|row| (row.parent_id.is_some(), row.created_at));
        Ok(rows)
    }

    async fn charge(
        &self,
        kind: TransactionKind,
        key: &str,
        request: ChargeRequest,
    ) -> Result<Transaction, PaymentError> {
        let (amount, currency) = request.validate()?;
        let fingerprint = fingerprint_of(kind.as_str(), &request)?;
        let row_fingerprint = fingerprint.as_str();

        self.guard
            .execute(key, &fingerprint, || async move {
                let tx = match self.transactions.find_by_idempotency_key(key).await? {
                    Some(existing) => {
                        if existing.kind != kind
                            || !existing.is_primary()
                            || existing.request_fingerprint != row_fingerprint
                        {
                            return Err(PaymentError::IdempotencyConflict(key.to_string()));
                        }
                        if existing.status != TransactionStatus::Pending {
                            return settled(existing);
                        }
                        tracing::info!(
                            transaction_id = %existing.id,
                            "Re-driving pending {} with unknown outcome",
                            kind
                        );
                        existing
                    }
                    None => {
                        let tx = Transaction::new_primary(
                            kind,
                            request.merchant_id.clone(),
                            request.customer_id.clone(),
                            amount.into_inner(),
                            currency.code().to_string(),
                            key.to_string(),
                            row_fingerprint.to_string(),
                        );
                        let tx = self.transactions.insert(&tx).await?;
                        self.audit_change(&tx, "created", None).await;
                        tx
                    }
                };

                let call = PaymentCall {
                    merchant_id: tx.merchant_id.clone(),
                    customer_id: tx.customer_id.clone(),
                    amount: tx.amount.clone(),
                    currency: tx.currency.clone(),
                    payment_token: request.payment_token.clone(),
                    reference: key.to_string(),
                };
                let result = match kind {
                    TransactionKind::Sale => self.call_gateway("sale", self.gateway.sale(&call)).await,
                    _ => self.call_gateway("authorize", self.gateway.authorize(&call)).await,
                };

                self.settle_primary(tx, result).await
            })
            .await
    }

    async fn settle_primary(&self, mut tx: Transaction, result: GatewayResult) -> Result<Transaction, PaymentError> {
        let before = tx.status;
        match result {
            Ok(approval) => {
                tx.transition(tx.kind.approved_status())?;
                tx.record_approval(&approval);
                if tx.kind == TransactionKind::Sale {
                    tx.captured_amount = Some(tx.amount.clone());
                }
                let tx = self.transactions.update(&tx).await?;
                tracing::info!(
                    transaction_id = %tx.id,
                    group_id = %tx.group_id,
                    status = %tx.status,
                    "Gateway approved {}",
                    tx.kind
                );
                self.audit_change(&tx, "gateway_approved", Some(before)).await;
                Ok(tx)
            }
            Err(failure) => Err(self.fail_row(tx, failure).await),
        }
    }

    async fn run_capture(
        &self,
        key: &str,
        fingerprint: &str,
        request: CaptureRequest,
    ) -> Result<Transaction, PaymentError> {
        let _group = self.locks.lock(request.group_id).await;
        let primary = self.primary(request.group_id).await?;

        let child = match self.find_child(key, fingerprint, &primary, TransactionKind::Capture).await? {
            ChildLookup::Settled(result) => return result,
            ChildLookup::Pending(child) => {
                self.reserve(request.group_id, key, TransactionStatus::Captured).await?;
                child
            }
            ChildLookup::Absent => {
                ensure_transition(&primary, TransactionStatus::Captured)?;
                let currency = Currency::new(&primary.currency)?;
                let amount = match &request.amount {
                    Some(amount) => Amount::new(amount.clone(), &currency)?.into_inner(),
                    None => primary.amount.clone(),
                };
                if amount > primary.amount {
                    return Err(PaymentError::InvalidInput(format!(
                        "capture amount {} exceeds authorized amount {}",
                        amount, primary.amount
                    )));
                }
                self.reserve(request.group_id, key, TransactionStatus::Captured).await?;
                self.insert_reserved_child(&primary, TransactionKind::Capture, amount, key, fingerprint)
                    .await?
            }
        };

        let call = CaptureCall {
            merchant_id: primary.merchant_id.clone(),
            original_reference: gateway_reference(&primary)?,
            amount: child.amount.clone(),
            currency: child.currency.clone(),
            reference: key.to_string(),
        };
        let result = self.call_gateway("capture", self.gateway.capture(&call)).await;

        let child = self.settle_reserved_child(request.group_id, child, result).await?;
        let captured = child.amount.clone();
        let before = primary.status;
        let primary = self
            .update_primary(request.group_id, |p| {
                p.transition(TransactionStatus::Captured)?;
                p.captured_amount = Some(captured.clone());
                p.in_flight_key = None;
                Ok(())
            })
            .await?;
        self.audit_change(&primary, "captured", Some(before)).await;
        Ok(primary)
    }

    async fn run_void(
        &self,
        key: &str,
        fingerprint: &str,
        request: VoidRequest,
    ) -> Result<Transaction, PaymentError> {
        let _group = self.locks.lock(request.group_id).await;
        let primary = self.primary(request.group_id).await?;

        let child = match self.find_child(key, fingerprint, &primary, TransactionKind::Void).await? {
            ChildLookup::Settled(result) => return result,
            ChildLookup::Pending(child) => {
                self.reserve(request.group_id, key, TransactionStatus::Voided).await?;
                child
            }
            ChildLookup::Absent => {
                ensure_transition(&primary, TransactionStatus::Voided)?;
                self.reserve(request.group_id, key, TransactionStatus::Voided).await?;
                self.insert_reserved_child(
                    &primary,
                    TransactionKind::Void,
                    primary.amount.clone(),
                    key,
                    fingerprint,
                )
                .await?
            }
        };

        let call = VoidCall {
            merchant_id: primary.merchant_id.clone(),
            original_reference: primary.gateway_reference.clone(),
            original_request_reference: primary.idempotency_key.clone(),
            reference: key.to_string(),
        };
        let result = self.call_gateway("void", self.gateway.void(&call)).await;

        self.settle_reserved_child(request.group_id, child, result).await?;
        let before = primary.status;
        let primary = self
            .update_primary(request.group_id, |p| {
                p.transition(TransactionStatus::Voided)?;
                p.in_flight_key = None;
                Ok(())
            })
            .await?;
        self.audit_change(&primary, "voided", Some(before)).await;
        Ok(primary)
    }

    /// Claims the primary row for the capture or void running under `key`.
    /// The compare-and-swap fails for every other key until the holder
    /// settles, so only one worker reaches the gateway.
    async fn reserve(&self, group_id: Uuid, key: &str, next: TransactionStatus) -> Result<Transaction, PaymentError> {
        self.update_primary(group_id, |p| {
            if let Some(holder) = p.in_flight_key.as_deref() {
                if holder != key {
                    return Err(PaymentError::RequestInProgress(holder.to_string()));
                }
            }
            ensure_transition(p, next)?;
            p.in_flight_key = Some(key.to_string());
            Ok(())
        })
        .await
    }

    async fn release_in_flight(&self, group_id: Uuid, key: &str) {
        let released = self
            .update_primary(group_id, |p| {
                if p.in_flight_key.as_deref() == Some(key) {
                    p.in_flight_key = None;
                }
                Ok(())
            })
            .await;
        if let Err(e) = released {
            tracing::error!(group_id = %group_id, error = %e, "Failed to release in-flight reservation");
        }
    }

    async fn insert_reserved_child(
        &self,
        primary: &Transaction,
        kind: TransactionKind,
        amount: BigDecimal,
        key: &str,
        fingerprint: &str,
    ) -> Result<Transaction, PaymentError> {
        match self.insert_child(primary, kind, amount, key, fingerprint).await {
            Ok(child) => Ok(child),
            Err(e) => {
                self.release_in_flight(primary.group_id, key).await;
                Err(e)
            }
        }
    }

    /// Settles a capture or void child. A terminal failure lifts the
    /// reservation; a retriable one keeps it for the re-drive.
    async fn settle_reserved_child(
        &self,
        group_id: Uuid,
        child: Transaction,
        result: GatewayResult,
    ) -> Result<Transaction, PaymentError> {
        let key = child.idempotency_key.clone();
        match self.settle_child(child, result).await {
            Err(e @ PaymentError::TerminalGatewayFailure(_)) => {
                self.release_in_flight(group_id, &key).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn run_refund(
        &self,
        key: &str,
        fingerprint: &str,
        request: RefundRequest,
    ) -> Result<Transaction, PaymentError> {
        let _group = self.locks.lock(request.group_id).await;
        let primary = self.primary(request.group_id).await?;

        let child = match self.find_child(key, fingerprint, &primary, TransactionKind::Refund).await? {
            ChildLookup::Settled(result) => return result,
            // The reservation made by the first attempt is still held.
            ChildLookup::Pending(child) => child,
            ChildLookup::Absent => {
                if primary.is_terminal() || !primary.can_transition_to(TransactionStatus::Refunded) {
                    return Err(PaymentError::InvalidStateTransition {
                        from: primary.status,
                        to: TransactionStatus::Refunded,
                    });
                }
                let currency = Currency::new(&primary.currency)?;
                let amount = Amount::new(request.amount.clone(), &currency)?.into_inner();

                let reserved = amount.clone();
                self.update_primary(request.group_id, |p| {
                    let available = p.refundable_amount();
                    if reserved > available {
                        return Err(PaymentError::RefundExceedsCaptured {
                            requested: reserved.clone(),
                            available,
                        });
                    }
                    p.pending_refund_amount = &p.pending_refund_amount + &reserved;
                    Ok(())
                })
                .await?;

                match self
                    .insert_child(&primary, TransactionKind::Refund, amount.clone(), key, fingerprint)
                    .await
                {
                    Ok(child) => child,
                    Err(e) => {
                        self.release_reservation(request.group_id, &amount).await;
                        return Err(e);
                    }
                }
            }
        };

        let call = RefundCall {
            merchant_id: primary.merchant_id.clone(),
            original_reference: gateway_reference(&primary)?,
            amount: child.amount.clone(),
            currency: child.currency.clone(),
            reference: key.to_string(),
        };
        let result = self.call_gateway("refund", self.gateway.refund(&call)).await;
        let amount = child.amount.clone();

        match self.settle_child(child, result).await {
            Ok(_) => {
                let before = primary.status;
                let primary = self
                    .update_primary(request.group_id, |p| {
                        p.transition(TransactionStatus::Refunded)?;
                        p.pending_refund_amount = &p.pending_refund_amount - &amount;
                        p.refunded_amount = &p.refunded_amount + &amount;
                        Ok(())
                    })
                    .await?;
                tracing::info!(
                    group_id = %primary.group_id,
                    refunded = %primary.refunded_amount,
                    "Refund settled"
                );
                self.audit_change(&primary, "refunded", Some(before)).await;
                Ok(primary)
            }
            Err(e @ PaymentError::TerminalGatewayFailure(_)) => {
                self.release_reservation(request.group_id, &amount).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn release_reservation(&self, group_id: Uuid, amount: &BigDecimal) {
        let released = self
            .update_primary(group_id, |p| {
                p.pending_refund_amount = &p.pending_refund_amount - amount;
                Ok(())
            })
            .await;
        if let Err(e) = released {
            tracing::error!(group_id = %group_id, error = %e, "Failed to release refund reservation");
        }
    }

    async fn primary(&self, group_id: Uuid) -> Result<Transaction, PaymentError> {
        self.transactions.find_primary(group_id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => {
                PaymentError::NotFound(format!("transaction group {}", group_id))
            }
            other => other.into(),
        })
    }

    async fn find_child(
        &self,
        key: &str,
        fingerprint: &str,
        primary: &Transaction,
        kind: TransactionKind,
    ) -> Result<ChildLookup, PaymentError> {
        let Some(child) = self.transactions.find_by_idempotency_key(key).await? else {
            return Ok(ChildLookup::Absent);
        };
        if child.kind != kind
            || child.group_id != primary.group_id
            || child.request_fingerprint != fingerprint
        {
            return Err(PaymentError::IdempotencyConflict(key.to_string()));
        }
        Ok(match child.status {
            TransactionStatus::Pending => ChildLookup::Pending(child),
            TransactionStatus::Failed => ChildLookup::Settled(Err(
                PaymentError::TerminalGatewayFailure(child.stored_failure()),
            )),
            _ => ChildLookup::Settled(Ok(primary.clone())),
        })
    }

    async fn insert_child(
        &self,
        primary: &Transaction,
        kind: TransactionKind,
        amount: BigDecimal,
        key: &str,
        fingerprint: &str,
    ) -> Result<Transaction, PaymentError> {
        let child = Transaction::new_child(primary, kind, amount, key.to_string(), fingerprint.to_string());
        let child = self.transactions.insert(&child).await?;
        self.audit_change(&child, "created", None).await;
        Ok(child)
    }

    /// Applies a gateway result to a pending child row.
    async fn settle_child(&self, mut child: Transaction, result: GatewayResult) -> Result<Transaction, PaymentError> {
        match result {
            Ok(approval) => {
                child.transition(child.kind.approved_status())?;
                child.record_approval(&approval);
                let child = self.transactions.update(&child).await?;
                self.audit_change(&child, "gateway_approved", Some(TransactionStatus::Pending))
                    .await;
                Ok(child)
            }
            Err(failure) => Err(self.fail_row(child, failure).await),
        }
    }

    /// Records a gateway failure on a pending row and returns the error to
    /// surface. Retriable failures leave the row pending.
    async fn fail_row(&self, mut tx: Transaction, failure: GatewayFailure) -> PaymentError {
        if failure.retriable {
            tracing::warn!(
                transaction_id = %tx.id,
                category = failure.category.as_str(),
                "Retriable gateway failure on {}; row left pending",
                tx.kind
            );
            return PaymentError::RetriableGatewayFailure(failure);
        }

        if let Err(e) = tx.transition(TransactionStatus::Failed) {
            return e;
        }
        tx.record_failure(&failure);
        let tx = match self.transactions.update(&tx).await {
            Ok(tx) => tx,
            Err(e) => return e.into(),
        };
        tracing::warn!(
            transaction_id = %tx.id,
            group_id = %tx.group_id,
            failure = %failure,
            "Gateway declined {}",
            tx.kind
        );
        self.audit_change(&tx, "gateway_declined", Some(TransactionStatus::Pending))
            .await;
        PaymentError::TerminalGatewayFailure(failure)
    }

    /// Version-checked read-modify-write of a group's primary row.
    async fn update_primary<F>(&self, group_id: Uuid, mut mutate: F) -> Result<Transaction, PaymentError>
    where
        F: FnMut(&mut Transaction) -> Result<(), PaymentError>,
    {
        for attempt in 1..=MAX_VERSION_RETRIES {
            let mut primary = self.primary(group_id).await?;
            mutate(&mut primary)?;
            match self.transactions.update(&primary).await {
                Ok(updated) => return Ok(updated),
                Err(RepositoryError::Conflict(_)) => {
                    tracing::debug!(group_id = %group_id, attempt, "Primary row changed underneath; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RepositoryError::Conflict(format!("transaction group {}", group_id)).into())
    }

    async fn call_gateway<F>(&self, operation: &str, call: F) -> GatewayResult
    where
        F: Future<Output = GatewayResult>,
    {
        match tokio::time::timeout(self.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.gateway_timeout, "Gateway call timed out");
                Err(GatewayFailure::timeout(operation))
            }
        }
    }

    async fn audit_change(&self, tx: &Transaction, action: &str, before: Option<TransactionStatus>) {
        let entry = AuditEntry::new(tx.id, ENTITY_TRANSACTION, action, ACTOR).with_change(
            before.map(|status| serde_json::json!({ "status": status })),
            Some(serde_json::json!({
                "status": tx.status,
                "kind": tx.kind,
                "amount": tx.amount.to_string(),
                "captured_amount": tx.captured_amount.as_ref().map(|a| a.to_string()),
                "refunded_amount": tx.refunded_amount.to_string(),
                "gateway_reference": tx.gateway_reference,
            })),
        );
        record_audit(self.audit.as_ref(), entry).await;
    }
}

enum ChildLookup {
    Absent,
    Pending(Transaction),
    Settled(Result<Transaction, PaymentError>),
}

fn settled(tx: Transaction) -> Result<Transaction, PaymentError> {
    match tx.status {
        TransactionStatus::Failed => Err(PaymentError::TerminalGatewayFailure(tx.stored_failure())),
        _ => Ok(tx),
    }
}

fn ensure_transition(primary: &Transaction, next: TransactionStatus) -> Result<(), PaymentError> {
    if primary.can_transition_to(next) {
        Ok(())
    } else {
        Err(PaymentError::InvalidStateTransition {
            from: primary.status,
            to: next,
        })
    }
}

fn gateway_reference(primary: &Transaction) -> Result<String, PaymentError> {
    primary.gateway_reference.clone().ok_or_else(|| {
        PaymentError::Internal(format!("transaction {} has no gateway reference", primary.id))
    })
}
