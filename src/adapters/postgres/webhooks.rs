use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{missed_update, parse_column};
use crate::domain::{WebhookDelivery, WebhookEndpoint};
use crate::ports::{RepositoryError, RepositoryResult, WebhookRepository};

const ENDPOINT_COLUMNS: &str = "id, merchant_id, url, secret, event_types, active, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, endpoint_id, event_type, payload, dedup_key, status, attempts, \
    next_retry_at, last_status_code, last_error, version, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresWebhookRepository {
    pool: PgPool,
}

impl PostgresWebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookRepository for PostgresWebhookRepository {
    async fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> RepositoryResult<WebhookEndpoint> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            r#"
            INSERT INTO webhook_endpoints ({ENDPOINT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {ENDPOINT_COLUMNS}
            "#
        ))
        .bind(endpoint.id)
        .bind(&endpoint.merchant_id)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(&endpoint.event_types)
        .bind(endpoint.active)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.into_domain())
    }

    async fn get_endpoint(&self, id: Uuid) -> RepositoryResult<WebhookEndpoint> {
        let row = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.map(EndpointRow::into_domain)
            .ok_or_else(|| RepositoryError::NotFound(format!("webhook endpoint {}", id)))
    }

    async fn list_endpoints(&self, merchant_id: &str) -> RepositoryResult<Vec<WebhookEndpoint>> {
        let rows = sqlx::query_as::<_, EndpointRow>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE merchant_id = $1 ORDER BY created_at ASC"
        ))
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(EndpointRow::into_domain).collect())
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> RepositoryResult<WebhookDelivery> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            INSERT INTO webhook_deliveries ({DELIVERY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (endpoint_id, dedup_key) DO NOTHING
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(delivery.id)
        .bind(delivery.endpoint_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(&delivery.dedup_key)
        .bind(delivery.status.as_str())
        .bind(delivery.attempts)
        .bind(delivery.next_retry_at)
        .bind(delivery.last_status_code)
        .bind(&delivery.last_error)
        .bind(delivery.version)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(RepositoryError::Duplicate(format!(
                "webhook delivery {}",
                delivery.dedup_key.as_deref().unwrap_or_default()
            ))),
        }
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> RepositoryResult<WebhookDelivery> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            UPDATE webhook_deliveries SET
                status = $2, attempts = $3, next_retry_at = $4, last_status_code = $5,
                last_error = $6, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $7
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(delivery.id)
        .bind(delivery.status.as_str())
        .bind(delivery.attempts)
        .bind(delivery.next_retry_at)
        .bind(delivery.last_status_code)
        .bind(&delivery.last_error)
        .bind(delivery.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(missed_update(&self.pool, "webhook_deliveries", "id", &delivery.id.to_string()).await),
        }
    }

    async fn get_delivery(&self, id: Uuid) -> RepositoryResult<WebhookDelivery> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("webhook delivery {}", id)))?
            .into_domain()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            WITH due AS (
                SELECT id FROM webhook_deliveries
                WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_deliveries d SET
                next_retry_at = $2, version = d.version + 1, updated_at = NOW()
            FROM due
            WHERE d.id = due.id
            RETURNING d.id, d.endpoint_id, d.event_type, d.payload, d.dedup_key, d.status, d.attempts,
                d.next_retry_at, d.last_status_code, d.last_error, d.version, d.created_at, d.updated_at
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter().map(DeliveryRow::into_domain).collect()
    }

    async fn list_failed(&self, limit: i64) -> RepositoryResult<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE status = 'failed' ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter().map(DeliveryRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EndpointRow {
    id: Uuid,
    merchant_id: String,
    url: String,
    secret: String,
    event_types: Vec<String>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EndpointRow {
    fn into_domain(self) -> WebhookEndpoint {
        WebhookEndpoint {
            id: self.id,
            merchant_id: self.merchant_id,
            url: self.url,
            secret: self.secret,
            event_types: self.event_types,
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    endpoint_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    status: String,
    attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_status_code: Option<i32>,
    last_error: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DeliveryRow {
    fn into_domain(self) -> RepositoryResult<WebhookDelivery> {
        Ok(WebhookDelivery {
            id: self.id,
            endpoint_id: self.endpoint_id,
            event_type: self.event_type,
            payload: self.payload,
            dedup_key: self.dedup_key,
            status: parse_column("status", &self.status)?,
            attempts: self.attempts,
            next_retry_at: self.next_retry_at,
            last_status_code: self.last_status_code,
            last_error: self.last_error,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
