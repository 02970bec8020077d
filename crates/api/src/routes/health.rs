//! Liveness endpoint

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

/// Liveness plus a database ping, so the orchestrator restarts us when the
/// pool is wedged rather than when the process dies.
pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    sqlx::query("SELECT 1").execute(&state.pool).await?;

    Ok(Json(json!({
        "status": "ok",
        "billing": state.billing.is_some(),
    })))
}
