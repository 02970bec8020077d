//! HTTP route registration

pub mod billing;
pub mod health;
pub mod venues;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router.
///
/// Three tiers: public (health, the Stripe webhook - it authenticates via
/// its signature, not a session), scheduler-internal (reconcile, guarded by
/// a bearer secret inside the handler), and owner routes behind the session
/// middleware.
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/billing/webhook", post(billing::stripe_webhook))
        .route(
            "/internal/billing/reconcile",
            get(billing::run_reconciliation),
        );

    let authed = Router::new()
        .route("/venues/{id}/visibility", put(venues::set_visibility))
        .route("/venues/{id}/billing", get(venues::get_billing_summary))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    public.merge(authed).with_state(state)
}
