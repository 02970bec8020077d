//! Billing routes: Stripe webhook intake and the scheduled reconcile trigger

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::auth::verify_cron_token;
use crate::error::ApiError;
use crate::state::AppState;

/// Handle Stripe webhook events
///
/// 400 on a bad signature (Stripe will not retry), 200 on processed or
/// deduplicated, 500 on a transition failure so Stripe redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    // Signature check happens before any ledger interaction.
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        ApiError::Internal(format!("Webhook handling error: {}", e))
    })?;

    Ok(StatusCode::OK)
}

/// Response from the reconcile trigger
#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub scanned: usize,
    pub reminded: usize,
    pub hidden: usize,
    pub now: String,
}

/// Run grace-period reconciliation on demand.
///
/// Invoked by an external scheduler with a bearer secret; the same logic
/// also runs from the worker's cron schedule, and the two converge because
/// every per-venue action is guarded.
pub async fn run_reconciliation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    verify_cron_token(presented, &state.config.cron_secret)?;

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let now = OffsetDateTime::now_utc();
    let summary = billing
        .reconciler
        .reconcile(now)
        .await
        .map_err(|e| ApiError::Internal(format!("Reconciliation failed: {}", e)))?;

    Ok(Json(ReconcileResponse {
        scanned: summary.scanned,
        reminded: summary.reminded,
        hidden: summary.hidden,
        now: now.format(&Rfc3339).unwrap_or_else(|_| now.to_string()),
    }))
}
