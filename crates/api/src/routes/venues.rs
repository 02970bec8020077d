//! Venue visibility and billing-summary routes

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use matchday_billing::visibility::{check_can_publish, PublishActor};
use matchday_billing::{ActorType, BillingEventBuilder, BillingEventType};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to change a venue's public visibility
#[derive(Debug, Deserialize)]
pub struct SetVisibilityRequest {
    pub visible: bool,
}

/// Response after a visibility change
#[derive(Debug, Serialize)]
pub struct VisibilityResponse {
    pub venue_id: Uuid,
    pub is_visible: bool,
}

/// Owner-facing billing summary for a venue
#[derive(Debug, Serialize)]
pub struct BillingSummaryResponse {
    pub venue_id: Uuid,
    pub billing_status: String,
    pub billing_enabled: bool,
    pub is_visible: bool,
    pub grace_period_ends_at: Option<String>,
    pub recent_events: Vec<BillingEventSummary>,
}

#[derive(Debug, Serialize)]
pub struct BillingEventSummary {
    pub event_type: String,
    pub created_at: String,
}

#[derive(Debug, sqlx::FromRow)]
struct VenueOwnerRow {
    owner_id: Uuid,
    owner_email_verified: bool,
}

async fn venue_owner(state: &AppState, venue_id: Uuid) -> Result<VenueOwnerRow, ApiError> {
    let row: Option<VenueOwnerRow> = sqlx::query_as(
        r#"
        SELECT v.owner_id, u.email_verified as owner_email_verified
        FROM venues v
        JOIN users u ON u.id = v.owner_id
        WHERE v.id = $1
        "#,
    )
    .bind(venue_id)
    .fetch_optional(&state.pool)
    .await?;

    row.ok_or(ApiError::NotFound)
}

/// Toggle a venue's public visibility.
///
/// Turning visibility on runs the billing gate: verified owner email,
/// subscription not canceled, grace period not expired. Platform admins
/// bypass the billing checks (not the email check). Turning visibility off
/// is always allowed.
pub async fn set_visibility(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(venue_id): Path<Uuid>,
    Json(req): Json<SetVisibilityRequest>,
) -> Result<Json<VisibilityResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let owner = venue_owner(&state, venue_id).await?;
    if owner.owner_id != auth_user.user_id && !auth_user.is_admin() {
        return Err(ApiError::Forbidden(
            "Only the venue owner can change visibility".to_string(),
        ));
    }

    if req.visible {
        let record = billing
            .store
            .fetch_by_venue(venue_id)
            .await
            .map_err(|e| ApiError::Database(e.to_string()))?
            .ok_or(ApiError::NotFound)?;

        let actor = if auth_user.is_admin() {
            PublishActor::PlatformAdmin
        } else {
            PublishActor::Owner
        };

        check_can_publish(
            &record,
            owner.owner_email_verified,
            actor,
            OffsetDateTime::now_utc(),
        )
        .map_err(|denied| {
            tracing::info!(
                venue_id = %venue_id,
                user_id = %auth_user.user_id,
                reason = %denied,
                "Visibility enable rejected"
            );
            ApiError::VisibilityDenied(denied.to_string())
        })?;
    }

    sqlx::query("UPDATE venues SET is_visible = $2, updated_at = NOW() WHERE id = $1")
        .bind(venue_id)
        .bind(req.visible)
        .execute(&state.pool)
        .await?;

    // Admin overrides of the billing gate are worth an audit trail entry.
    if req.visible && auth_user.is_admin() && owner.owner_id != auth_user.user_id {
        if let Err(e) = billing
            .events
            .log_event(
                BillingEventBuilder::new(venue_id, BillingEventType::AdminOverride)
                    .data(serde_json::json!({
                        "action": "visibility_enabled_by_admin",
                        "admin_user_id": auth_user.user_id,
                    }))
                    .actor_type(ActorType::Admin),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log admin visibility override");
        }
    }

    tracing::info!(
        venue_id = %venue_id,
        user_id = %auth_user.user_id,
        visible = req.visible,
        "Venue visibility updated"
    );

    Ok(Json(VisibilityResponse {
        venue_id,
        is_visible: req.visible,
    }))
}

/// Owner view of a venue's billing state and recent billing history.
pub async fn get_billing_summary(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(venue_id): Path<Uuid>,
) -> Result<Json<BillingSummaryResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let owner = venue_owner(&state, venue_id).await?;
    if owner.owner_id != auth_user.user_id && !auth_user.is_admin() {
        return Err(ApiError::Forbidden(
            "Only the venue owner can view billing".to_string(),
        ));
    }

    let record = billing
        .store
        .fetch_by_venue(venue_id)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?
        .ok_or(ApiError::NotFound)?;

    let recent_events = billing
        .events
        .recent_for_venue(venue_id, 20)
        .await
        .map_err(|e| ApiError::Database(e.to_string()))?
        .into_iter()
        .map(|e| BillingEventSummary {
            event_type: e.event_type,
            created_at: e.created_at.to_string(),
        })
        .collect();

    Ok(Json(BillingSummaryResponse {
        venue_id,
        billing_status: record.billing_status.to_string(),
        billing_enabled: record.billing_enabled(),
        is_visible: record.is_visible,
        grace_period_ends_at: record.grace_period_ends_at.map(|t| t.to_string()),
        recent_events,
    }))
}
