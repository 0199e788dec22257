pub mod health;
pub mod payment_webhooks;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::db::DbPool;
use crate::services::SettlementServices;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub services: SettlementServices,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(health::metrics))
        .route("/webhooks/payments", post(payment_webhooks::payment_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
