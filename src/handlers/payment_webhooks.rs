use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::errors::ServiceError;

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// POST /webhooks/payments
///
/// The signature covers the raw body, so the payload is handed to the
/// service untouched.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    else {
        warn!("Payment webhook without signature header");
        return Err(ServiceError::Unauthorized(
            "Missing webhook signature".to_string(),
        ));
    };

    let outcome = state
        .services
        .payments
        .handle_webhook(&body, signature)
        .await?;
    info!(%outcome, "Payment webhook handled");
    Ok((StatusCode::OK, Json(json!({ "status": outcome.to_string() }))))
}
