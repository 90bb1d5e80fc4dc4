use bigdecimal::BigDecimal;
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }

    /// The billing date one cycle after `date`. Month ends are clamped
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, date: NaiveDate) -> Result<NaiveDate, PaymentError> {
        let next = match self {
            Frequency::Weekly => date.checked_add_days(Days::new(7)),
            Frequency::Biweekly => date.checked_add_days(Days::new(14)),
            Frequency::Monthly => date.checked_add_months(Months::new(1)),
            Frequency::Yearly => date.checked_add_months(Months::new(12)),
        };
        next.ok_or_else(|| PaymentError::InvalidInput(format!("billing date overflow after {}", date)))
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" => Ok(Frequency::Biweekly),
            "monthly" => Ok(Frequency::Monthly),
            "yearly" => Ok(Frequency::Yearly),
            other => Err(format!("unknown frequency '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "paused" => Ok(SubscriptionStatus::Paused),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

/// What to do with the billing date after a retriable charge failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOption {
    /// Give up on the missed charge and move to the next cycle.
    Forward,
    /// Try the same billing date again on the next run.
    Skip,
    /// Stop billing until someone resumes the subscription.
    Pause,
}

impl FailureOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOption::Forward => "forward",
            FailureOption::Skip => "skip",
            FailureOption::Pause => "pause",
        }
    }
}

impl FromStr for FailureOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(FailureOption::Forward),
            "skip" => Ok(FailureOption::Skip),
            "pause" => Ok(FailureOption::Pause),
            other => Err(format!("unknown failure option '{}'", other)),
        }
    }
}

/// Outcome of applying a failed billing attempt to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Advanced,
    Retained,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub merchant_id: String,
    pub customer_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub frequency: Frequency,
    pub status: SubscriptionStatus,
    pub payment_method_token: String,
    pub next_billing_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub retry_count: i32,
    pub failure_option: FailureOption,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        merchant_id: String,
        customer_id: String,
        amount: BigDecimal,
        currency: String,
        frequency: Frequency,
        payment_method_token: String,
        next_billing_date: NaiveDate,
        end_date: Option<NaiveDate>,
        failure_option: FailureOption,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            merchant_id,
            customer_id,
            amount,
            currency,
            frequency,
            status: SubscriptionStatus::Active,
            payment_method_token,
            next_billing_date,
            end_date,
            retry_count: 0,
            failure_option,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Idempotency key for the charge of the current billing date. Re-running
    /// the same cycle derives the same key.
    pub fn billing_key(&self) -> String {
        format!("sub_{}_{}", self.id, self.next_billing_date)
    }

    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Active && self.next_billing_date <= today
    }

    /// True when the contract ended before the pending billing date.
    pub fn has_lapsed(&self) -> bool {
        matches!(self.end_date, Some(end) if self.next_billing_date > end)
    }

    pub fn record_success(&mut self) -> Result<(), PaymentError> {
        self.next_billing_date = self.frequency.advance(self.next_billing_date)?;
        self.retry_count = 0;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Applies a retriable failure under the configured failure option.
    pub fn record_retriable_failure(&mut self, max_retries: i32) -> Result<RetryDecision, PaymentError> {
        self.retry_count += 1;
        self.updated_at = Utc::now();

        if self.retry_count >= max_retries {
            self.status = SubscriptionStatus::Paused;
            return Ok(RetryDecision::Paused);
        }

        match self.failure_option {
            FailureOption::Forward => {
                self.next_billing_date = self.frequency.advance(self.next_billing_date)?;
                Ok(RetryDecision::Advanced)
            }
            FailureOption::Skip => Ok(RetryDecision::Retained),
            FailureOption::Pause => {
                self.status = SubscriptionStatus::Paused;
                Ok(RetryDecision::Paused)
            }
        }
    }

    /// Terminal failures pause regardless of policy.
    pub fn record_terminal_failure(&mut self) {
        self.retry_count += 1;
        self.status = SubscriptionStatus::Paused;
        self.updated_at = Utc::now();
    }

    pub fn cancel(&mut self) -> Result<(), PaymentError> {
        if self.status.is_terminal() {
            return Err(PaymentError::InvalidInput(format!(
                "subscription {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = SubscriptionStatus::Cancelled;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reactivates a paused subscription; missed dates are not billed retroactively.
    pub fn resume(&mut self, today: NaiveDate) -> Result<(), PaymentError> {
        if self.status != SubscriptionStatus::Paused {
            return Err(PaymentError::InvalidInput(format!(
                "only paused subscriptions can be resumed (status: {})",
                self.status.as_str()
            )));
        }
        self.status = SubscriptionStatus::Active;
        self.retry_count = 0;
        if self.next_billing_date < today {
            self.next_billing_date = today;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn expire(&mut self) {
        self.status = SubscriptionStatus::Expired;
        self.updated_at = Utc::now();
    }
}
