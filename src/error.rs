use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bigdecimal::BigDecimal;
use serde_json::json;
use thiserror::Error;

use crate::domain::gateway::GatewayFailure;
use crate::domain::transaction::TransactionStatus;
use crate::ports::RepositoryError;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Idempotency key '{0}' was already used for a different request")]
    IdempotencyConflict(String),

    #[error("A request with idempotency key '{0}' is still being processed")]
    RequestInProgress(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Refund of {requested} exceeds refundable amount {available}")]
    RefundExceedsCaptured {
        requested: BigDecimal,
        available: BigDecimal,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Retriable gateway failure: {0}")]
    RetriableGatewayFailure(GatewayFailure),

    #[error("Terminal gateway failure: {0}")]
    TerminalGatewayFailure(GatewayFailure),

    #[error("Reconciliation drift on case {case_number}: {detail}")]
    ReconciliationDrift { case_number: String, detail: String },

    #[error("Job '{0}' is already running")]
    JobInProgress(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Splits a classified gateway failure into the matching taxonomy entry.
    pub fn from_gateway(failure: GatewayFailure) -> Self {
        if failure.retriable {
            PaymentError::RetriableGatewayFailure(failure)
        } else {
            PaymentError::TerminalGatewayFailure(failure)
        }
    }

    /// Whether resubmitting the same request with the same idempotency key may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            PaymentError::RetriableGatewayFailure(_) | PaymentError::RequestInProgress(_) => true,
            PaymentError::Repository(RepositoryError::Conflict(_)) => true,
            _ => false,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PaymentError::IdempotencyConflict(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PaymentError::RequestInProgress(_) => StatusCode::CONFLICT,
            PaymentError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            PaymentError::RefundExceedsCaptured { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::RetriableGatewayFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::TerminalGatewayFailure(_) => StatusCode::PAYMENT_REQUIRED,
            PaymentError::ReconciliationDrift { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            PaymentError::JobInProgress(_) => StatusCode::CONFLICT,
            PaymentError::Repository(RepositoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            PaymentError::Repository(RepositoryError::Conflict(_)) => StatusCode::CONFLICT,
            PaymentError::Repository(_) | PaymentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PaymentError::InvalidInput(_) => "invalid_input",
            PaymentError::IdempotencyConflict(_) => "idempotency_conflict",
            PaymentError::RequestInProgress(_) => "request_in_progress",
            PaymentError::InvalidStateTransition { .. } => "invalid_state_transition",
            PaymentError::RefundExceedsCaptured { .. } => "refund_exceeds_captured",
            PaymentError::NotFound(_) => "not_found",
            PaymentError::RetriableGatewayFailure(_) => "retriable_gateway_failure",
            PaymentError::TerminalGatewayFailure(_) => "terminal_gateway_failure",
            PaymentError::ReconciliationDrift { .. } => "reconciliation_drift",
            PaymentError::JobInProgress(_) => "job_in_progress",
            PaymentError::Repository(_) => "repository",
            PaymentError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::Internal(format!("serialization failed: {}", err))
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "status": status.as_u16(),
            "retriable": self.is_retriable(),
        });
        if let PaymentError::RetriableGatewayFailure(failure)
        | PaymentError::TerminalGatewayFailure(failure) = &self
        {
            body["category"] = json!(failure.category);
            body["code"] = json!(failure.code);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway::FailureCategory;

    #[test]
    fn test_invalid_input_status_code() {
        let error = PaymentError::InvalidInput("amount must be positive".to_string());
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert!(!error.is_retriable());
    }

    #[test]
    fn test_state_transition_status_code() {
        let error = PaymentError::InvalidStateTransition {
            from: TransactionStatus::Captured,
            to: TransactionStatus::Voided,
        };
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            error.to_string(),
            "Invalid state transition from captured to voided"
        );
    }

    #[test]
    fn test_gateway_failures_split_by_retriability() {
        let timeout = GatewayFailure::retriable(FailureCategory::Timeout, "timed out");
        let declined = GatewayFailure::terminal(FailureCategory::Declined, Some("05"), "do not honor");

        let retriable = PaymentError::from_gateway(timeout);
        let terminal = PaymentError::from_gateway(declined);

        assert!(matches!(retriable, PaymentError::RetriableGatewayFailure(_)));
        assert!(retriable.is_retriable());
        assert_eq!(retriable.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        assert!(matches!(terminal, PaymentError::TerminalGatewayFailure(_)));
        assert!(!terminal.is_retriable());
        assert_eq!(terminal.status_code(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_repository_not_found_maps_to_404() {
        let error = PaymentError::from(RepositoryError::NotFound("tx".to_string()));
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refund_exceeds_response() {
        let error = PaymentError::RefundExceedsCaptured {
            requested: "30".parse().unwrap(),
            available: "20".parse().unwrap(),
        };
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_job_in_progress_response() {
        let response = PaymentError::JobInProgress("billing".to_string()).into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
