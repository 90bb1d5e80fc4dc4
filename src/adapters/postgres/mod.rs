//! Postgres implementations of the repository ports.
//!
//! Row structs stay private to each module and convert into domain types via
//! `into_domain`. Enum columns are stored as text.

mod audit;
mod chargebacks;
mod idempotency;
mod jobs;
mod subscriptions;
mod transactions;
mod webhooks;

pub use audit::PostgresAuditRepository;
pub use chargebacks::PostgresChargebackRepository;
pub use idempotency::PostgresIdempotencyStore;
pub use jobs::PostgresJobLockRepository;
pub use subscriptions::PostgresSubscriptionRepository;
pub use transactions::PostgresTransactionRepository;
pub use webhooks::PostgresWebhookRepository;

use std::str::FromStr;

use crate::ports::{RepositoryError, RepositoryResult};

fn parse_column<T>(column: &str, value: &str) -> RepositoryResult<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| RepositoryError::Database(format!("column {}: {}", column, e)))
}

/// Distinguishes a stale version from a missing row after a CAS update matched nothing.
async fn missed_update(pool: &sqlx::PgPool, table: &str, key_column: &str, key: &str) -> RepositoryError {
    let query = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE {}::text = $1)", table, key_column);
    match sqlx::query_scalar::<_, bool>(&query).bind(key).fetch_one(pool).await {
        Ok(true) => RepositoryError::Conflict(format!("{} {}", table, key)),
        Ok(false) => RepositoryError::NotFound(format!("{} {}", table, key)),
        Err(e) => RepositoryError::from(e),
    }
}
