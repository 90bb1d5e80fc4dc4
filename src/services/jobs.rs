use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::ports::JobLockRepository;

pub const JOB_BILLING: &str = "billing";
pub const JOB_DISPUTE_SYNC: &str = "dispute_sync";
pub const JOB_WEBHOOK_DELIVERY: &str = "webhook_delivery";

/// Keeps externally triggered jobs from overlapping.
///
/// The run marker expires after `timeout` so a crashed run cannot block the
/// job forever.
#[derive(Clone)]
pub struct JobGuard {
    locks: Arc<dyn JobLockRepository>,
    timeout: ChronoDuration,
}

impl JobGuard {
    pub fn new(locks: Arc<dyn JobLockRepository>, timeout: ChronoDuration) -> Self {
        Self { locks, timeout }
    }

    pub async fn run<T, F, Fut>(&self, job: &str, work: F) -> Result<T, PaymentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PaymentError>>,
    {
        let holder = Uuid::new_v4().to_string();
        let now = Utc::now();
        if !self
            .locks
            .try_acquire(job, &holder, now, now + self.timeout)
            .await?
        {
            tracing::warn!(job, "Job trigger rejected; a run is already in progress");
            return Err(PaymentError::JobInProgress(job.to_string()));
        }

        tracing::info!(job, "Job started");
        let result = work().await;
        if let Err(e) = self.locks.release(job, &holder).await {
            tracing::error!(job, error = %e, "Failed to release job lock");
        }

        match &result {
            Ok(_) => tracing::info!(job, "Job finished"),
            Err(e) => tracing::error!(job, error = %e, "Job failed"),
        }
        result
    }
}
