use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::parse_column;
use crate::domain::idempotency::IdempotencyState;
use crate::domain::{BeginOutcome, IdempotencyRecord};
use crate::ports::{IdempotencyStore, RepositoryError, RepositoryResult};

const COLUMNS: &str = "key, fingerprint, holder, state, outcome, created_at, expires_at";

/// Attempts before giving up on a key that keeps being released underneath us.
const BEGIN_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn try_begin(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> RepositoryResult<BeginOutcome> {
        for _ in 0..BEGIN_ATTEMPTS {
            // Expired rows are taken over in place; live rows are left alone.
            let claimed = sqlx::query_scalar::<_, String>(
                r#"
                INSERT INTO idempotency_records (key, fingerprint, holder, state, outcome, created_at, expires_at)
                VALUES ($1, $2, $3, $4, NULL, $5, $6)
                ON CONFLICT (key) DO UPDATE SET
                    fingerprint = EXCLUDED.fingerprint,
                    holder = EXCLUDED.holder,
                    state = EXCLUDED.state,
                    outcome = NULL,
                    created_at = EXCLUDED.created_at,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_records.expires_at <= $7
                RETURNING key
                "#,
            )
            .bind(&record.key)
            .bind(&record.fingerprint)
            .bind(record.holder)
            .bind(record.state.as_str())
            .bind(record.created_at)
            .bind(record.expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

            if claimed.is_some() {
                return Ok(BeginOutcome::Started);
            }

            if let Some(existing) = self.get(&record.key).await? {
                return Ok(BeginOutcome::Existing(existing));
            }
        }

        Err(RepositoryError::Conflict(format!("idempotency key {}", record.key)))
    }

    async fn complete(
        &self,
        key: &str,
        holder: Uuid,
        outcome: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records SET state = $3, outcome = $4, expires_at = $5
            WHERE key = $1 AND holder = $2
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(IdempotencyState::Completed.as_str())
        .bind(outcome)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!("idempotency key {}", key)));
        }
        Ok(())
    }

    async fn release(&self, key: &str, holder: Uuid) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> RepositoryResult<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRow>(&format!(
            "SELECT {COLUMNS} FROM idempotency_records WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .map(IdempotencyRow::into_domain)
        .transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    fingerprint: String,
    holder: Uuid,
    state: String,
    outcome: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl IdempotencyRow {
    fn into_domain(self) -> RepositoryResult<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            key: self.key,
            fingerprint: self.fingerprint,
            holder: self.holder,
            state: parse_column("state", &self.state)?,
            outcome: self.outcome,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}
