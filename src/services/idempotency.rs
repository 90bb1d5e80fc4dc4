//! Exactly-once execution of money-moving operations keyed by a
//! client-supplied idempotency key.
//!
//! A key is claimed atomically before the operation runs. Terminal outcomes
//! (success or a terminal gateway decline) are cached and replayed for every
//! later request with the same key and fingerprint; retriable failures and
//! local errors release the key so the client can resubmit. Every claim
//! carries a holder token; a worker whose claim expired and was taken over
//! can neither release nor complete the new claim.

use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::gateway::GatewayFailure;
use crate::domain::idempotency::IdempotencyState;
use crate::domain::{BeginOutcome, IdempotencyRecord};
use crate::error::PaymentError;
use crate::ports::IdempotencyStore;

pub const MAX_KEY_LENGTH: usize = 255;

/// Hex SHA-256 over the JSON form of `(operation, request)`.
pub fn fingerprint_of<T: Serialize>(operation: &str, request: &T) -> Result<String, PaymentError> {
    let bytes = serde_json::to_vec(&(operation, request))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum CachedOutcome {
    Completed { body: serde_json::Value },
    Rejected { failure: GatewayFailure },
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: ChronoDuration,
    wait: Duration,
    poll_interval: Duration,
}

impl IdempotencyGuard {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        ttl: ChronoDuration,
        wait: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            ttl,
            wait,
            poll_interval,
        }
    }

    /// Runs `operation` at most once per key, or replays its cached outcome.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        operation: F,
    ) -> Result<T, PaymentError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PaymentError>>,
    {
        validate_key(key)?;
        let deadline = Instant::now() + self.wait;

        loop {
            let now = Utc::now();
            let claim = IdempotencyRecord::in_progress(key, fingerprint, now);

            match self.store.try_begin(&claim, now).await? {
                BeginOutcome::Started => return self.run_claimed(key, claim.holder, operation).await,
                BeginOutcome::Existing(record) => {
                    if record.fingerprint != fingerprint {
                        return Err(PaymentError::IdempotencyConflict(key.to_string()));
                    }
                    if record.state == IdempotencyState::Completed {
                        tracing::debug!(idempotency_key = %key, "Replaying cached outcome");
                        return replay(key, record);
                    }
                    if Instant::now() >= deadline {
                        return Err(PaymentError::RequestInProgress(key.to_string()));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn run_claimed<T, F, Fut>(&self, key: &str, holder: Uuid, operation: F) -> Result<T, PaymentError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PaymentError>>,
    {
        let result = operation().await;

        let cached = match &result {
            Ok(value) => serde_json::to_value(value)
                .map(|body| CachedOutcome::Completed { body })
                .map_err(PaymentError::from),
            Err(PaymentError::TerminalGatewayFailure(failure)) => Ok(CachedOutcome::Rejected {
                failure: failure.clone(),
            }),
            Err(_) => {
                self.release(key, holder).await;
                return result;
            }
        };

        let stored = match cached {
            Ok(outcome) => match serde_json::to_value(&outcome) {
                Ok(value) => self
                    .store
                    .complete(key, holder, value, Utc::now() + self.ttl)
                    .await
                    .map_err(PaymentError::from),
                Err(e) => Err(PaymentError::from(e)),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = stored {
            tracing::error!(idempotency_key = %key, error = %e, "Failed to cache idempotent outcome");
            self.release(key, holder).await;
        }

        result
    }

    async fn release(&self, key: &str, holder: Uuid) {
        if let Err(e) = self.store.release(key, holder).await {
            tracing::error!(idempotency_key = %key, error = %e, "Failed to release idempotency key");
        }
    }

    /// Deletes expired records.
    pub async fn purge_expired(&self) -> Result<u64, PaymentError> {
        let purged = self.store.purge_expired(Utc::now()).await?;
        tracing::info!(purged, "Purged expired idempotency records");
        Ok(purged)
    }
}

fn validate_key(key: &str) -> Result<(), PaymentError> {
    if key.trim().is_empty() {
        return Err(PaymentError::InvalidInput(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(PaymentError::InvalidInput(format!(
            "idempotency key longer than {} characters",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

fn replay<T: DeserializeOwned>(key: &str, record: IdempotencyRecord) -> Result<T, PaymentError> {
    let outcome = record.outcome.ok_or_else(|| {
        PaymentError::Internal(format!("completed idempotency key '{}' has no outcome", key))
    })?;

    match serde_json::from_value::<CachedOutcome>(outcome)? {
        CachedOutcome::Completed { body } => Ok(serde_json::from_value(body)?),
        CachedOutcome::Rejected { failure } => Err(PaymentError::TerminalGatewayFailure(failure)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryIdempotencyStore;
    use crate::domain::gateway::FailureCategory;
    use crate::domain::idempotency::IN_PROGRESS_TTL_SECS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            ChronoDuration::hours(24),
            Duration::from_millis(500),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_fingerprint_depends_on_operation_and_body() {
        let a = fingerprint_of("sale", &serde_json::json!({"amount": "10.00"})).unwrap();
        let b = fingerprint_of("sale", &serde_json::json!({"amount": "10.00"})).unwrap();
        let c = fingerprint_of("authorize", &serde_json::json!({"amount": "10.00"})).unwrap();
        let d = fingerprint_of("sale", &serde_json::json!({"amount": "10.01"})).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn test_success_is_replayed() {
        let guard = guard();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u32 = guard
                .execute("key-1", "fp", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_replayed() {
        let guard = guard();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let err = guard
                .execute::<u32, _, _>("key-1", "fp", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PaymentError::TerminalGatewayFailure(GatewayFailure::terminal(
                        FailureCategory::Declined,
                        Some("05"),
                        "do not honor",
                    )))
                })
                .await
                .unwrap_err();
            assert!(matches!(err, PaymentError::TerminalGatewayFailure(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retriable_failure_releases_key() {
        let guard = guard();
        let calls = AtomicUsize::new(0);

        let first = guard
            .execute::<u32, _, _>("key-1", "fp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PaymentError::RetriableGatewayFailure(GatewayFailure::timeout("sale")))
            })
            .await;
        assert!(first.unwrap_err().is_retriable());

        let second: u32 = guard
            .execute("key-1", "fp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        assert_eq!(second, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_conflicts() {
        let guard = guard();
        let _: u32 = guard.execute("key-1", "fp-a", || async { Ok(1) }).await.unwrap();

        let err = guard
            .execute::<u32, _, _>("key-1", "fp-b", || async { Ok(2) })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_in_progress_times_out() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let now = Utc::now();
        store
            .try_begin(&IdempotencyRecord::in_progress("key-1", "fp", now), now)
            .await
            .unwrap();

        let guard = IdempotencyGuard::new(
            store,
            ChronoDuration::hours(24),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        let err = guard
            .execute::<u32, _, _>("key-1", "fp", || async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::RequestInProgress(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_expired_claim_holder_cannot_release_takeover() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let guard = IdempotencyGuard::new(
            store.clone(),
            ChronoDuration::hours(24),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        // A claim older than the in-progress TTL, as left by a stalled worker.
        let stalled_at = Utc::now() - ChronoDuration::seconds(IN_PROGRESS_TTL_SECS + 1);
        let stalled = IdempotencyRecord::in_progress("key-1", "fp", stalled_at);
        store.try_begin(&stalled, stalled_at).await.unwrap();
        let stalled_holder = stalled.holder;

        let takeover = guard.clone();
        let store_inside = store.clone();
        let value: u32 = guard
            .execute("key-1", "fp", || async move {
                // The stalled worker wakes up and gives up on its claim.
                store_inside.release("key-1", stalled_holder).await.unwrap();
                let duplicate = takeover
                    .execute::<u32, _, _>("key-1", "fp", || async { Ok(99) })
                    .await
                    .unwrap_err();
                assert!(matches!(duplicate, PaymentError::RequestInProgress(_)));
                Ok(5)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);

        let record = store.get("key-1").await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Completed);
        assert_ne!(record.holder, stalled_holder);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let err = guard()
            .execute::<u32, _, _>("  ", "fp", || async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidInput(_)));
    }
}
