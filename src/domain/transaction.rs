//! Transaction domain entity and its lifecycle rules.
//!
//! A group is one primary row (authorization or sale) plus the capture, void
//! and refund rows issued against it. The primary row carries the group's
//! running totals; child rows record each individual gateway operation.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::gateway::{FailureCategory, GatewayApproval, GatewayFailure};
use crate::error::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Authorized,
    Captured,
    Voided,
    Refunded,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Authorized => "authorized",
            TransactionStatus::Captured => "captured",
            TransactionStatus::Voided => "voided",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "authorized" => Ok(TransactionStatus::Authorized),
            "captured" => Ok(TransactionStatus::Captured),
            "voided" => Ok(TransactionStatus::Voided),
            "refunded" => Ok(TransactionStatus::Refunded),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Authorization,
    Capture,
    Sale,
    Void,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Authorization => "authorization",
            TransactionKind::Capture => "capture",
            TransactionKind::Sale => "sale",
            TransactionKind::Void => "void",
            TransactionKind::Refund => "refund",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, TransactionKind::Authorization | TransactionKind::Sale)
    }

    /// Status a successful gateway call moves a pending row of this kind to.
    pub fn approved_status(&self) -> TransactionStatus {
        match self {
            TransactionKind::Authorization => TransactionStatus::Authorized,
            TransactionKind::Capture | TransactionKind::Sale => TransactionStatus::Captured,
            TransactionKind::Void => TransactionStatus::Voided,
            TransactionKind::Refund => TransactionStatus::Refunded,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization" => Ok(TransactionKind::Authorization),
            "capture" => Ok(TransactionKind::Capture),
            "sale" => Ok(TransactionKind::Sale),
            "void" => Ok(TransactionKind::Void),
            "refund" => Ok(TransactionKind::Refund),
            other => Err(format!("unknown transaction kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundState {
    None,
    Partial,
    Full,
}

/// Whether a row of `kind` may move from `from` to `to`.
pub fn transition_allowed(kind: TransactionKind, from: TransactionStatus, to: TransactionStatus) -> bool {
    use TransactionStatus::*;

    match (from, to) {
        (Pending, Failed) => true,
        (Pending, next) => next == kind.approved_status() || (kind.is_primary() && next == Voided),
        (Authorized, Captured | Voided | Failed) => kind == TransactionKind::Authorization,
        (Captured, Refunded) | (Refunded, Refunded) => kind.is_primary(),
        _ => false,
    }
}

/// One money-movement record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub group_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub merchant_id: String,
    pub customer_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub kind: TransactionKind,
    pub gateway_reference: Option<String>,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub idempotency_key: String,
    /// Fingerprint of the request that created the row; a key reused with a
    /// different request never drives it.
    pub request_fingerprint: String,
    pub captured_amount: Option<BigDecimal>,
    pub refunded_amount: BigDecimal,
    pub pending_refund_amount: BigDecimal,
    /// Key of the capture or void currently reserved on this primary row.
    pub in_flight_key: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A new pending authorization or sale opening its own group.
    pub fn new_primary(
        kind: TransactionKind,
        merchant_id: String,
        customer_id: String,
        amount: BigDecimal,
        currency: String,
        idempotency_key: String,
        request_fingerprint: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            parent_id: None,
            merchant_id,
            customer_id,
            amount,
            currency,
            status: TransactionStatus::Pending,
            kind,
            gateway_reference: None,
            response_code: None,
            response_message: None,
            failure_category: None,
            idempotency_key,
            request_fingerprint,
            captured_amount: None,
            refunded_amount: BigDecimal::from(0),
            pending_refund_amount: BigDecimal::from(0),
            in_flight_key: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A new pending capture, void or refund row in `parent`'s group.
    pub fn new_child(
        parent: &Transaction,
        kind: TransactionKind,
        amount: BigDecimal,
        idempotency_key: String,
        request_fingerprint: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            group_id: parent.group_id,
            parent_id: Some(parent.id),
            merchant_id: parent.merchant_id.clone(),
            customer_id: parent.customer_id.clone(),
            amount,
            currency: parent.currency.clone(),
            status: TransactionStatus::Pending,
            kind,
            gateway_reference: None,
            response_code: None,
            response_message: None,
            failure_category: None,
            idempotency_key,
            request_fingerprint,
            captured_amount: None,
            refunded_amount: BigDecimal::from(0),
            pending_refund_amount: BigDecimal::from(0),
            in_flight_key: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        transition_allowed(self.kind, self.status, next)
    }

    /// Moves to `next`, rejecting out-of-order transitions without touching the record.
    pub fn transition(&mut self, next: TransactionStatus) -> Result<(), PaymentError> {
        if !self.can_transition_to(next) {
            return Err(PaymentError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn refund_state(&self) -> RefundState {
        let zero = BigDecimal::from(0);
        if self.refunded_amount <= zero {
            return RefundState::None;
        }
        match &self.captured_amount {
            Some(captured) if &self.refunded_amount >= captured => RefundState::Full,
            _ => RefundState::Partial,
        }
    }

    /// Captured amount not yet refunded or reserved by an in-flight refund.
    pub fn refundable_amount(&self) -> BigDecimal {
        match &self.captured_amount {
            Some(captured) => captured - &self.refunded_amount - &self.pending_refund_amount,
            None => BigDecimal::from(0),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            TransactionStatus::Voided | TransactionStatus::Failed => true,
            TransactionStatus::Refunded => self.refund_state() == RefundState::Full,
            _ => false,
        }
    }

    pub fn record_approval(&mut self, approval: &GatewayApproval) {
        self.gateway_reference = Some(approval.reference.clone());
        self.response_code = Some(approval.response_code.clone());
        self.response_message = Some(approval.message.clone());
        self.failure_category = None;
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, failure: &GatewayFailure) {
        self.response_code = failure.code.clone();
        self.response_message = Some(failure.message.clone());
        self.failure_category = Some(failure.category);
        self.updated_at = Utc::now();
    }

    /// Rebuilds the terminal failure stored on a `failed` row.
    pub fn stored_failure(&self) -> GatewayFailure {
        GatewayFailure::terminal(
            self.failure_category.unwrap_or(FailureCategory::Unknown),
            self.response_code.as_deref(),
            self.response_message
                .clone()
                .unwrap_or_else(|| "transaction failed".to_string()),
        )
    }
}
