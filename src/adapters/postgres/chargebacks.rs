use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{missed_update, parse_column};
use crate::domain::Chargeback;
use crate::ports::{ChargebackRepository, RepositoryError, RepositoryResult};

const COLUMNS: &str = "id, case_number, merchant_id, group_id, amount, currency, reason_code, status, \
    raw_payload, version, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresChargebackRepository {
    pool: PgPool,
}

impl PostgresChargebackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChargebackRepository for PostgresChargebackRepository {
    async fn insert(&self, chargeback: &Chargeback) -> RepositoryResult<Chargeback> {
        let row = sqlx::query_as::<_, ChargebackRow>(&format!(
            r#"
            INSERT INTO chargebacks ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(chargeback.id)
        .bind(&chargeback.case_number)
        .bind(&chargeback.merchant_id)
        .bind(chargeback.group_id)
        .bind(&chargeback.amount)
        .bind(&chargeback.currency)
        .bind(&chargeback.reason_code)
        .bind(chargeback.status.as_str())
        .bind(&chargeback.raw_payload)
        .bind(chargeback.version)
        .bind(chargeback.created_at)
        .bind(chargeback.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        row.into_domain()
    }

    async fn update(&self, chargeback: &Chargeback) -> RepositoryResult<Chargeback> {
        let row = sqlx::query_as::<_, ChargebackRow>(&format!(
            r#"
            UPDATE chargebacks SET
                group_id = $2, amount = $3, currency = $4, reason_code = $5, status = $6,
                raw_payload = $7, version = version + 1, updated_at = NOW()
            WHERE case_number = $1 AND version = $8
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&chargeback.case_number)
        .bind(chargeback.group_id)
        .bind(&chargeback.amount)
        .bind(&chargeback.currency)
        .bind(&chargeback.reason_code)
        .bind(chargeback.status.as_str())
        .bind(&chargeback.raw_payload)
        .bind(chargeback.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(row) => row.into_domain(),
            None => Err(missed_update(&self.pool, "chargebacks", "case_number", &chargeback.case_number).await),
        }
    }

    async fn find_by_case_number(&self, case_number: &str) -> RepositoryResult<Option<Chargeback>> {
        sqlx::query_as::<_, ChargebackRow>(&format!(
            "SELECT {COLUMNS} FROM chargebacks WHERE case_number = $1"
        ))
        .bind(case_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .map(ChargebackRow::into_domain)
        .transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChargebackRow {
    id: Uuid,
    case_number: String,
    merchant_id: String,
    group_id: Option<Uuid>,
    amount: BigDecimal,
    currency: String,
    reason_code: String,
    status: String,
    raw_payload: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ChargebackRow {
    fn into_domain(self) -> RepositoryResult<Chargeback> {
        Ok(Chargeback {
            id: self.id,
            case_number: self.case_number,
            merchant_id: self.merchant_id,
            group_id: self.group_id,
            amount: self.amount,
            currency: self.currency,
            reason_code: self.reason_code,
            status: parse_column("status", &self.status)?,
            raw_payload: self.raw_payload,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
