use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::services::NewSubscription;
use crate::AppState;

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(request): Json<NewSubscription>,
) -> Result<impl IntoResponse, PaymentError> {
    let sub = state.engine.billing.create(request).await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PaymentError> {
    Ok(Json(state.engine.billing.get(id).await?))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PaymentError> {
    Ok(Json(state.engine.billing.cancel(id).await?))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, PaymentError> {
    let today = Utc::now().date_naive();
    Ok(Json(state.engine.billing.resume(id, today).await?))
}
