//! Trigger endpoints for the scheduled jobs. An external scheduler calls
//! these; a trigger that arrives while the same job is running gets a 409.

use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;

use crate::error::PaymentError;
use crate::AppState;

pub async fn run_billing(State(state): State<AppState>) -> Result<impl IntoResponse, PaymentError> {
    let report = state.engine.run_billing(Utc::now()).await?;
    Ok(Json(report))
}

pub async fn run_dispute_sync(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, PaymentError> {
    let report = state.engine.run_dispute_sync(Utc::now()).await?;
    Ok(Json(report))
}

pub async fn deliver_webhooks(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, PaymentError> {
    let report = state.engine.deliver_webhooks(Utc::now()).await?;
    Ok(Json(report))
}
