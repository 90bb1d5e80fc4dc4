use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::ports::{JobLockRepository, RepositoryError, RepositoryResult};

#[derive(Clone)]
pub struct PostgresJobLockRepository {
    pool: PgPool,
}

impl PostgresJobLockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLockRepository for PostgresJobLockRepository {
    async fn try_acquire(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let acquired = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO job_locks (job, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job) DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE job_locks.expires_at <= $3
            RETURNING holder
            "#,
        )
        .bind(job)
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(acquired.is_some())
    }

    async fn release(&self, job: &str, holder: &str) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM job_locks WHERE job = $1 AND holder = $2")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }
}
