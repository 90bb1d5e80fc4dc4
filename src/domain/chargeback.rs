use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargebackStatus {
    New,
    Pending,
    Won,
    Lost,
}

impl ChargebackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargebackStatus::New => "new",
            ChargebackStatus::Pending => "pending",
            ChargebackStatus::Won => "won",
            ChargebackStatus::Lost => "lost",
        }
    }

    /// Won and lost cases have a final decision.
    pub fn is_decided(&self) -> bool {
        matches!(self, ChargebackStatus::Won | ChargebackStatus::Lost)
    }
}

impl FromStr for ChargebackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ChargebackStatus::New),
            "pending" => Ok(ChargebackStatus::Pending),
            "won" => Ok(ChargebackStatus::Won),
            "lost" => Ok(ChargebackStatus::Lost),
            other => Err(format!("unknown chargeback status '{}'", other)),
        }
    }
}

/// A dispute as reported by the gateway, already normalized by the source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDispute {
    pub case_number: String,
    pub merchant_id: String,
    /// Gateway reference of the disputed transaction, when the source reports one.
    pub transaction_reference: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub reason_code: String,
    pub status: ChargebackStatus,
    pub raw: serde_json::Value,
}

/// One page of dispute search results.
#[derive(Debug, Clone, Default)]
pub struct DisputePage {
    pub records: Vec<RemoteDispute>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chargeback {
    pub id: Uuid,
    pub case_number: String,
    pub merchant_id: String,
    pub group_id: Option<Uuid>,
    pub amount: BigDecimal,
    pub currency: String,
    pub reason_code: String,
    pub status: ChargebackStatus,
    pub raw_payload: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chargeback {
    pub fn from_remote(remote: &RemoteDispute, group_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            case_number: remote.case_number.clone(),
            merchant_id: remote.merchant_id.clone(),
            group_id,
            amount: remote.amount.clone(),
            currency: remote.currency.clone(),
            reason_code: remote.reason_code.clone(),
            status: remote.status,
            raw_payload: remote.raw.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when any field the reconciler mirrors has changed remotely.
    pub fn differs_from(&self, remote: &RemoteDispute) -> bool {
        self.status != remote.status
            || self.amount != remote.amount
            || self.reason_code != remote.reason_code
    }

    /// A decided case reported as undecided again.
    pub fn is_regressed_by(&self, remote: &RemoteDispute) -> bool {
        self.status.is_decided() && !remote.status.is_decided()
    }

    pub fn apply_remote(&mut self, remote: &RemoteDispute, group_id: Option<Uuid>) {
        self.status = remote.status;
        self.amount = remote.amount.clone();
        self.currency = remote.currency.clone();
        self.reason_code = remote.reason_code.clone();
        self.raw_payload = remote.raw.clone();
        if group_id.is_some() {
            self.group_id = group_id;
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(status: ChargebackStatus) -> RemoteDispute {
        RemoteDispute {
            case_number: "CB-1001".to_string(),
            merchant_id: "merchant-1".to_string(),
            transaction_reference: Some("bric-1".to_string()),
            amount: "49.99".parse().unwrap(),
            currency: "USD".to_string(),
            reason_code: "10.4".to_string(),
            status,
            raw: serde_json::json!({"caseNumber": "CB-1001"}),
        }
    }

    #[test]
    fn test_unchanged_record_does_not_differ() {
        let cb = Chargeback::from_remote(&remote(ChargebackStatus::New), None);
        assert!(!cb.differs_from(&remote(ChargebackStatus::New)));
        assert!(cb.differs_from(&remote(ChargebackStatus::Pending)));
    }

    #[test]
    fn test_regression_detection() {
        let cb = Chargeback::from_remote(&remote(ChargebackStatus::Won), None);
        assert!(cb.is_regressed_by(&remote(ChargebackStatus::Pending)));
        assert!(!cb.is_regressed_by(&remote(ChargebackStatus::Lost)));

        let open = Chargeback::from_remote(&remote(ChargebackStatus::New), None);
        assert!(!open.is_regressed_by(&remote(ChargebackStatus::Pending)));
    }

    #[test]
    fn test_apply_keeps_known_group() {
        let group = Uuid::new_v4();
        let mut cb = Chargeback::from_remote(&remote(ChargebackStatus::New), Some(group));
        cb.apply_remote(&remote(ChargebackStatus::Lost), None);
        assert_eq!(cb.group_id, Some(group));
        assert_eq!(cb.status, ChargebackStatus::Lost);
    }
}
