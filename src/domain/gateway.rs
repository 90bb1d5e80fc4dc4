//! Normalized request/response shapes exchanged with the payment gateway.
//!
//! Gateway-specific wire formats never leave the adapter; everything the core
//! sees is one of the typed calls below and a [`GatewayResult`].

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Network,
    Timeout,
    Upstream,
    RateLimited,
    Declined,
    InsufficientFunds,
    Fraud,
    InvalidRequest,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Network => "network",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Upstream => "upstream",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Declined => "declined",
            FailureCategory::InsufficientFunds => "insufficient_funds",
            FailureCategory::Fraud => "fraud",
            FailureCategory::InvalidRequest => "invalid_request",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(FailureCategory::Network),
            "timeout" => Ok(FailureCategory::Timeout),
            "upstream" => Ok(FailureCategory::Upstream),
            "rate_limited" => Ok(FailureCategory::RateLimited),
            "declined" => Ok(FailureCategory::Declined),
            "insufficient_funds" => Ok(FailureCategory::InsufficientFunds),
            "fraud" => Ok(FailureCategory::Fraud),
            "invalid_request" => Ok(FailureCategory::InvalidRequest),
            "unknown" => Ok(FailureCategory::Unknown),
            other => Err(format!("unknown failure category '{}'", other)),
        }
    }
}

/// A failure already classified by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFailure {
    pub retriable: bool,
    pub category: FailureCategory,
    pub code: Option<String>,
    pub message: String,
}

impl GatewayFailure {
    pub fn retriable(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            category,
            code: None,
            message: message.into(),
        }
    }

    pub fn terminal(category: FailureCategory, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            category,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// The call did not finish in time; its outcome is unknown.
    pub fn timeout(operation: &str) -> Self {
        Self::retriable(
            FailureCategory::Timeout,
            format!("gateway {} timed out; outcome unknown", operation),
        )
    }
}

impl fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.category.as_str(), code, self.message),
            None => write!(f, "{}: {}", self.category.as_str(), self.message),
        }
    }
}

/// A successful gateway response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayApproval {
    /// Gateway-issued token (BRIC) for follow-up operations.
    pub reference: String,
    pub response_code: String,
    pub message: String,
}

pub type GatewayResult = Result<GatewayApproval, GatewayFailure>;

/// Authorization or sale against a stored payment method token.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentCall {
    pub merchant_id: String,
    pub customer_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_token: String,
    /// Caller reference the gateway uses to deduplicate resubmissions.
    pub reference: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureCall {
    pub merchant_id: String,
    pub original_reference: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoidCall {
    pub merchant_id: String,
    pub original_reference: Option<String>,
    /// Reference of the original authorization, used when no token was issued yet.
    pub original_request_reference: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundCall {
    pub merchant_id: String,
    pub original_reference: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub reference: String,
}
