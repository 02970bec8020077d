//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated user information extracted from the session JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Extract the bearer token from an Authorization header value.
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require a valid owner session. Inserts [`AuthUser`] as a request
/// extension for downstream handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or(ApiError::Unauthorized)?;
    let claims = state.jwt_manager.verify_token(token)?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

/// Check the scheduler's bearer token in constant time.
///
/// The reconcile trigger is invoked by an external scheduler, not a user
/// session; it authenticates with a shared secret. Constant-time comparison
/// keeps the check timing-independent of the attacker-controlled input.
pub fn verify_cron_token(presented: &str, expected: &str) -> Result<(), ApiError> {
    if expected.is_empty() {
        return Err(ApiError::ServiceUnavailable);
    }

    let matches: bool = presented
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into();

    if matches {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}
