use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::services::{CaptureRequest, ChargeRequest, RefundRequest, VoidRequest};
use crate::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
pub struct CaptureBody {
    pub amount: Option<BigDecimal>,
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub amount: BigDecimal,
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, PaymentError> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            PaymentError::InvalidInput(format!("{} header is required", IDEMPOTENCY_KEY_HEADER))
        })
}

pub async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChargeRequest>,
) -> Result<impl IntoResponse, PaymentError> {
    let key = idempotency_key(&headers)?;
    let tx = state.engine.transactions.authorize(&key, request).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

pub async fn sale(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChargeRequest>,
) -> Result<impl IntoResponse, PaymentError> {
    let key = idempotency_key(&headers)?;
    let tx = state.engine.transactions.sale(&key, request).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

pub async fn capture(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<CaptureBody>>,
) -> Result<impl IntoResponse, PaymentError> {
    let key = idempotency_key(&headers)?;
    let amount = body.and_then(|Json(body)| body.amount);
    let tx = state
        .engine
        .transactions
        .capture(&key, CaptureRequest { group_id, amount })
        .await?;
    Ok(Json(tx))
}

pub async fn void(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, PaymentError> {
    let key = idempotency_key(&headers)?;
    let tx = state
        .engine
        .transactions
        .void(&key, VoidRequest { group_id })
        .await?;
    Ok(Json(tx))
}

pub async fn refund(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<RefundBody>,
) -> Result<impl IntoResponse, PaymentError> {
    let key = idempotency_key(&headers)?;
    let tx = state
        .engine
        .transactions
        .refund(&key, RefundRequest { group_id, amount: body.amount })
        .await?;
    Ok(Json(tx))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PaymentError> {
    let tx = state.engine.transactions.get(id).await?;
    Ok(Json(tx))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, PaymentError> {
    let rows = state.engine.transactions.group(group_id).await?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_idempotency_key_is_required() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            idempotency_key(&headers),
            Err(PaymentError::InvalidInput(_))
        ));

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("  "));
        assert!(idempotency_key(&headers).is_err());

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("order-42"));
        assert_eq!(idempotency_key(&headers).unwrap(), "order-42");
    }
}
