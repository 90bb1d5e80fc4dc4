use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{missed_update, parse_column};
use crate::domain::Transaction;
use crate::ports::{RepositoryError, RepositoryResult, TransactionRepository};

const COLUMNS: &str = "id, group_id, parent_id, merchant_id, customer_id, amount, currency, status, kind, \
    gateway_reference, response_code, response_message, failure_category, idempotency_key, \
    request_fingerprint, captured_amount, refunded_amount, pending_refund_amount, in_flight_key, version, \
    created_at, updated_at";

#[derive(Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn insert(&self, tx: &Transaction) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO transactions ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(tx.id)
        .bind(tx.group_id)
        .bind(tx.parent_id)
        .bind(&tx.merchant_id)
        .bind(&tx.customer_id)
        .bind(&tx.amount)
        .bind(&tx.currency)
        .bind(tx.status.as_str())
        .bind(tx.kind.as_str())
        .bind(&tx.gateway_reference)
        .bind(&tx.response_code)
        .bind(&tx.response_message)
        .bind(tx.failure_category.map(|c| c.as_str()))
        .bind(&tx.idempotency_key)
        .bind(&tx.request_fingerprint)
        .bind(&tx.captured_amount)
        .bind(&tx.refunded_amount)
        .bind(&tx.pending_refund_amount)
        .bind(&tx.in_flight_key)
        .bind(tx.version)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.into_domain()
    }

    async fn update(&self, tx: &Transaction) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE transactions SET
                status = $2, gateway_reference = $3, response_code = $4, response_message = $5,
                failure_category = $6, captured_amount = $7, refunded_amount = $8,
                pending_refund_amount = $9, in_flight_key = $10, version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $11
            RETURNING {COLUMNS}
            "#
        ))
        .bind(tx.id)
        .bind(tx.status.as_str())
        .bind(&tx.gateway_reference)
        .bind(&tx.response_code)
        .bind(&tx.response_message)
        .bind(tx.failure_category.map(|c| c.as_str()))
        .bind(&tx.captured_amount)
        .bind(&tx.refunded_amount)
        .bind(&tx.pending_refund_amount)
        .bind(&tx.in_flight_key)
        .bind(tx.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(missed_update(&self.pool, "transactions", "id", &tx.id.to_string()).await),
        }
    }

    async fn get(&self, id: Uuid) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("transaction {}", id)))?
            .into_domain()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> RepositoryResult<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM transactions WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .map(TransactionRow::into_domain)
        .transpose()
    }

    async fn find_primary(&self, group_id: Uuid) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM transactions WHERE group_id = $1 AND parent_id IS NULL"
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("transaction group {}", group_id)))?
            .into_domain()
    }

    async fn list_group(&self, group_id: Uuid) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM transactions WHERE group_id = $1 ORDER BY created_at ASC"
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter().map(TransactionRow::into_domain).collect()
    }

    async fn find_by_gateway_reference(&self, reference: &str) -> RepositoryResult<Option<Transaction>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM transactions WHERE gateway_reference = $1 ORDER BY parent_id NULLS FIRST LIMIT 1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .map(TransactionRow::into_domain)
        .transpose()
    }

    async fn merchants(&self) -> RepositoryResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT merchant_id FROM transactions ORDER BY merchant_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    group_id: Uuid,
    parent_id: Option<Uuid>,
    merchant_id: String,
    customer_id: String,
    amount: BigDecimal,
    currency: String,
    status: String,
    kind: String,
    gateway_reference: Option<String>,
    response_code: Option<String>,
    response_message: Option<String>,
    failure_category: Option<String>,
    idempotency_key: String,
    request_fingerprint: String,
    captured_amount: Option<BigDecimal>,
    refunded_amount: BigDecimal,
    pending_refund_amount: BigDecimal,
    in_flight_key: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> RepositoryResult<Transaction> {
        Ok(Transaction {
            id: self.id,
            group_id: self.group_id,
            parent_id: self.parent_id,
            merchant_id: self.merchant_id,
            customer_id: self.customer_id,
            amount: self.amount,
            currency: self.currency,
            status: parse_column("status", &self.status)?,
            kind: parse_column("kind", &self.kind)?,
            gateway_reference: self.gateway_reference,
            response_code: self.response_code,
            response_message: self.response_message,
            failure_category: self
                .failure_category
                .as_deref()
                .map(|c| parse_column("failure_category", c))
                .transpose()?,
            idempotency_key: self.idempotency_key,
            request_fingerprint: self.request_fingerprint,
            captured_amount: self.captured_amount,
            refunded_amount: self.refunded_amount,
            pending_refund_amount: self.pending_refund_amount,
            in_flight_key: self.in_flight_key,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
