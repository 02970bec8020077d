// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::type_complexity)] // Complex return types for Stripe API wrappers
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Matchday Billing Module
//!
//! The billing lifecycle subsystem: a Stripe-driven state machine per venue,
//! an idempotent webhook intake, and a time-driven grace-period reconciler.
//!
//! ## Features
//!
//! - **Event Ledger**: Atomic claim per Stripe event id; at-least-once
//!   delivery in, exactly-once side effects out
//! - **State Machine**: Pure billing transitions with post-commit effects
//! - **Webhook Intake**: Signature verification and orchestration
//! - **Grace Reconciler**: Day-7 reminder, day-14 hide, on a schedule
//! - **Visibility Gate**: Billing preconditions for going live
//! - **Audit Log**: Append-only billing event history per venue
//! - **Invariants**: Runnable consistency checks over billing state

pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod reconciler;
pub mod records;
pub mod state_machine;
pub mod visibility;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent as BillingAuditEvent, BillingEventBuilder, BillingEventLogger,
    BillingEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{ClaimOutcome, EventLedger, LedgerEntry};

// Reconciler
pub use reconciler::{GraceReconciler, ReconcileSummary};

// Records
pub use records::{
    BillingStateWrite, BillingStatus, BillingStore, VenueBillingRecord, GRACE_PERIOD,
    REMINDER_AFTER,
};

// State machine
pub use state_machine::{transition, BillingEvent, Notification, Transition};

// Visibility
pub use visibility::{check_can_publish, PublishActor, PublishDenied};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub email: BillingEmailService,
    pub events: BillingEventLogger,
    pub invariants: InvariantChecker,
    pub ledger: EventLedger,
    pub reconciler: GraceReconciler,
    pub store: BillingStore,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool))
    }

    /// Create a new billing service with an explicit Stripe client
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let email = BillingEmailService::from_env();

        Self {
            email: email.clone(),
            events: BillingEventLogger::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            ledger: EventLedger::new(pool.clone()),
            reconciler: GraceReconciler::new(pool.clone(), email.clone()),
            store: BillingStore::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, email),
        }
    }
}
