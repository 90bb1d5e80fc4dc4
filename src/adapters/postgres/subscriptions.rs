use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{missed_update, parse_column};
use crate::domain::Subscription;
use crate::ports::{RepositoryError, RepositoryResult, SubscriptionRepository};

const COLUMNS: &str = "id, merchant_id, customer_id, amount, currency, frequency, status, \
    payment_method_token, next_billing_date, end_date, retry_count, failure_option, version, \
    created_at, updated_at";

#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn insert(&self, sub: &Subscription) -> RepositoryResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            INSERT INTO subscriptions ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(sub.id)
        .bind(&sub.merchant_id)
        .bind(&sub.customer_id)
        .bind(&sub.amount)
        .bind(&sub.currency)
        .bind(sub.frequency.as_str())
        .bind(sub.status.as_str())
        .bind(&sub.payment_method_token)
        .bind(sub.next_billing_date)
        .bind(sub.end_date)
        .bind(sub.retry_count)
        .bind(sub.failure_option.as_str())
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.into_domain()
    }

    async fn update(&self, sub: &Subscription) -> RepositoryResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            UPDATE subscriptions SET
                status = $2, next_billing_date = $3, end_date = $4, retry_count = $5,
                failure_option = $6, payment_method_token = $7,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $8
            RETURNING {COLUMNS}
            "#
        ))
        .bind(sub.id)
        .bind(sub.status.as_str())
        .bind(sub.next_billing_date)
        .bind(sub.end_date)
        .bind(sub.retry_count)
        .bind(sub.failure_option.as_str())
        .bind(&sub.payment_method_token)
        .bind(sub.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(missed_update(&self.pool, "subscriptions", "id", &sub.id.to_string()).await),
        }
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Subscription> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("subscription {}", id)))?
            .into_domain()
    }

    async fn list_due(&self, today: NaiveDate) -> RepositoryResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM subscriptions
            WHERE status = 'active' AND next_billing_date <= $1
            ORDER BY next_billing_date ASC, created_at ASC
            "#
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter().map(SubscriptionRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    merchant_id: String,
    customer_id: String,
    amount: BigDecimal,
    currency: String,
    frequency: String,
    status: String,
    payment_method_token: String,
    next_billing_date: NaiveDate,
    end_date: Option<NaiveDate>,
    retry_count: i32,
    failure_option: String,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_domain(self) -> RepositoryResult<Subscription> {
        Ok(Subscription {
            id: self.id,
            merchant_id: self.merchant_id,
            customer_id: self.customer_id,
            amount: self.amount,
            currency: self.currency,
            frequency: parse_column("frequency", &self.frequency)?,
            status: parse_column("status", &self.status)?,
            payment_method_token: self.payment_method_token,
            next_billing_date: self.next_billing_date,
            end_date: self.end_date,
            retry_count: self.retry_count,
            failure_option: parse_column("failure_option", &self.failure_option)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
