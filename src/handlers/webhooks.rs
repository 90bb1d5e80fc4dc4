use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::error::PaymentError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterEndpoint {
    pub merchant_id: String,
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub event_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
}

pub async fn register_endpoint(
    State(state): State<AppState>,
    Json(request): Json<RegisterEndpoint>,
) -> Result<impl IntoResponse, PaymentError> {
    let endpoint = state
        .engine
        .webhooks
        .register_endpoint(
            &request.merchant_id,
            &request.url,
            &request.secret,
            request.event_types,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub async fn failed_deliveries(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Result<impl IntoResponse, PaymentError> {
    let limit = pagination.limit.unwrap_or(100).clamp(1, 1000);
    let deliveries = state.engine.webhooks.failed_deliveries(limit).await?;
    Ok(Json(deliveries))
}
