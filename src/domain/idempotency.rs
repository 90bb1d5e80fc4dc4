use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// How long an in-progress claim survives a crashed holder.
pub const IN_PROGRESS_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress,
    Completed,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyState::InProgress => "in_progress",
            IdempotencyState::Completed => "completed",
        }
    }
}

impl FromStr for IdempotencyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(IdempotencyState::InProgress),
            "completed" => Ok(IdempotencyState::Completed),
            other => Err(format!("unknown idempotency state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    /// Token of the claim that wrote the record. Completing or releasing a
    /// key only touches the record while this token still matches.
    pub holder: Uuid,
    pub state: IdempotencyState,
    pub outcome: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn in_progress(key: &str, fingerprint: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            holder: Uuid::new_v4(),
            state: IdempotencyState::InProgress,
            outcome: None,
            created_at: now,
            expires_at: now + Duration::seconds(IN_PROGRESS_TTL_SECS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of atomically claiming a key.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller owns the key and must complete or release it.
    Started,
    /// A live record already exists for the key.
    Existing(IdempotencyRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_claim_expires() {
        let now = Utc::now();
        let record = IdempotencyRecord::in_progress("k", "f", now);
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::seconds(IN_PROGRESS_TTL_SECS)));
    }

    #[test]
    fn test_each_claim_gets_its_own_holder() {
        let now = Utc::now();
        let a = IdempotencyRecord::in_progress("k", "f", now);
        let b = IdempotencyRecord::in_progress("k", "f", now);
        assert_ne!(a.holder, b.holder);
    }
}
