use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use std::sync::Arc;

use crate::{error::ApiError, payments, AppState};

/// Signature header set by the gateway on every notification.
const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// POST /api/payments/webhook — signed gateway notifications.
///
/// The body is taken raw so the signature covers exactly the delivered
/// bytes. Any uncertainty (storage down, unknown reservation) surfaces as
/// a non-2xx so the gateway redelivers; the handler is idempotent, so
/// redelivery is harmless.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::BadSignature)?;

    if !payments::verify_signature(&state.gateway.webhook_secret, &body, signature) {
        tracing::warn!("webhook signature verification failed");
        return Err(ApiError::BadSignature);
    }

    let event = payments::parse_event(&body)?;
    tracing::info!(
        event = %event.event,
        payment = %event.object.id,
        status = %event.object.status,
        "gateway webhook received"
    );

    payments::handle_gateway_event(&state.db, &event, Utc::now()).await?;
    Ok(StatusCode::OK)
}
