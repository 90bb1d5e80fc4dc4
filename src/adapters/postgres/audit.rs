use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::AuditEntry;
use crate::ports::{AuditRepository, RepositoryError, RepositoryResult};

#[derive(Clone)]
pub struct PostgresAuditRepository {
    pool: PgPool,
}

impl PostgresAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PostgresAuditRepository {
    async fn record(&self, entry: &AuditEntry) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, entity_id, entity_type, action, old_val, new_val, actor, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.entity_id)
        .bind(&entry.entity_type)
        .bind(&entry.action)
        .bind(&entry.old_val)
        .bind(&entry.new_val)
        .bind(&entry.actor)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }

    async fn list_for_entity(&self, entity_id: Uuid) -> RepositoryResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, entity_id, entity_type, action, old_val, new_val, actor, timestamp
            FROM audit_logs
            WHERE entity_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(AuditRow::into_domain).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    entity_id: Uuid,
    entity_type: String,
    action: String,
    old_val: Option<serde_json::Value>,
    new_val: Option<serde_json::Value>,
    actor: String,
    timestamp: DateTime<Utc>,
}

impl AuditRow {
    fn into_domain(self) -> AuditEntry {
        AuditEntry {
            id: self.id,
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            action: self.action,
            old_val: self.old_val,
            new_val: self.new_val,
            actor: self.actor,
            timestamp: self.timestamp,
        }
    }
}
