pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod ports;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::services::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// `None` when running over the in-memory adapters.
    pub db: Option<sqlx::PgPool>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/transactions/authorize", post(handlers::transactions::authorize))
        .route("/transactions/sale", post(handlers::transactions::sale))
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .route("/transactions/:id/capture", post(handlers::transactions::capture))
        .route("/transactions/:id/void", post(handlers::transactions::void))
        .route("/transactions/:id/refund", post(handlers::transactions::refund))
        .route("/groups/:group_id", get(handlers::transactions::get_group))
        .route("/subscriptions", post(handlers::subscriptions::create_subscription))
        .route("/subscriptions/:id", get(handlers::subscriptions::get_subscription))
        .route("/subscriptions/:id/cancel", post(handlers::subscriptions::cancel_subscription))
        .route("/subscriptions/:id/resume", post(handlers::subscriptions::resume_subscription))
        .route("/webhooks/endpoints", post(handlers::webhooks::register_endpoint))
        .route("/webhooks/deliveries/failed", get(handlers::webhooks::failed_deliveries))
        .route("/jobs/billing/run", post(handlers::jobs::run_billing))
        .route("/jobs/disputes/run", post(handlers::jobs::run_dispute_sync))
        .route("/jobs/webhooks/deliver", post(handlers::jobs::deliver_webhooks))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
