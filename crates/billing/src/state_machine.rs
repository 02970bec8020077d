//! Billing state machine
//!
//! Pure transition logic: a normalized provider event plus the current
//! billing record produces the next record state and a list of post-commit
//! effects. Nothing in this module performs I/O - the webhook handler
//! applies the returned write as a single merge UPDATE and then runs each
//! effect in its own error boundary. Keeping the effects out of the
//! transition means a notification failure can never corrupt billing state,
//! and the whole decision table is testable without a database.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::events::BillingEventType;
use crate::records::{BillingStateWrite, BillingStatus, VenueBillingRecord, GRACE_PERIOD};

/// A provider event, normalized out of Stripe's wire shapes.
///
/// Venue resolution has already happened by the time one of these is built;
/// the state machine only sees events that map to a known venue.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    /// Checkout finished; the venue now has provider identifiers and a
    /// subscription whose reported status we adopt.
    CheckoutCompleted {
        customer_id: Option<String>,
        subscription_id: Option<String>,
        subscription_status: Option<BillingStatus>,
    },
    /// An invoice payment failed; opens (or continues) a failure episode.
    PaymentFailed {
        amount_due_cents: Option<i64>,
        invoice_url: Option<String>,
    },
    /// An invoice payment succeeded; closes any failure episode.
    PaymentSucceeded,
    /// The subscription changed; adopt the remapped status.
    SubscriptionUpdated {
        subscription_id: Option<String>,
        status: BillingStatus,
    },
    /// The subscription is gone; the venue loses billing and visibility.
    SubscriptionDeleted,
    /// An event type we do not handle. Claimed and marked processed so the
    /// provider stops redelivering, but otherwise a no-op.
    Unrecognized { event_type: String },
}

/// Post-commit notification effects, executed after the state write lands.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PaymentFailed {
        amount_due_cents: Option<i64>,
        invoice_url: Option<String>,
    },
    SubscriptionCanceled,
}

/// The output of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// New billing state, or `None` for no-op events.
    pub write: Option<BillingStateWrite>,
    /// Best-effort notifications to send after the write commits.
    pub notifications: Vec<Notification>,
    /// Audit log entry describing what happened.
    pub audit: Option<(BillingEventType, serde_json::Value)>,
}

impl Transition {
    fn noop() -> Self {
        Transition {
            write: None,
            notifications: Vec::new(),
            audit: None,
        }
    }
}

/// Compute the transition for an event against the current record.
pub fn transition(
    event: &BillingEvent,
    current: &VenueBillingRecord,
    now: OffsetDateTime,
) -> Transition {
    match event {
        BillingEvent::CheckoutCompleted {
            customer_id,
            subscription_id,
            subscription_status,
        } => {
            let status = (*subscription_status).unwrap_or(BillingStatus::Active);
            Transition {
                write: Some(remapped_write(
                    current,
                    status,
                    customer_id.clone().or_else(|| current.stripe_customer_id.clone()),
                    subscription_id
                        .clone()
                        .or_else(|| current.stripe_subscription_id.clone()),
                )),
                notifications: Vec::new(),
                audit: Some((
                    BillingEventType::CheckoutCompleted,
                    serde_json::json!({
                        "status": status.as_str(),
                        "subscription_id": subscription_id,
                    }),
                )),
            }
        }

        BillingEvent::PaymentFailed {
            amount_due_cents,
            invoice_url,
        } => {
            // A failure during an ongoing episode keeps the original
            // deadline; only the first failure opens the episode. Either way
            // the owner hears about the failed attempt.
            let already_failing = current.billing_status == BillingStatus::PaymentFailed
                && current.last_payment_failed_at.is_some();

            let (failed_at, deadline, reminder) = if already_failing {
                (
                    current.last_payment_failed_at,
                    current.grace_period_ends_at,
                    current.reminder_sent_at,
                )
            } else {
                (Some(now), Some(now + GRACE_PERIOD), None)
            };

            Transition {
                write: Some(BillingStateWrite {
                    billing_status: BillingStatus::PaymentFailed,
                    stripe_customer_id: current.stripe_customer_id.clone(),
                    stripe_subscription_id: current.stripe_subscription_id.clone(),
                    last_payment_failed_at: failed_at,
                    grace_period_ends_at: deadline,
                    reminder_sent_at: reminder,
                    force_hidden: false,
                }),
                notifications: vec![Notification::PaymentFailed {
                    amount_due_cents: *amount_due_cents,
                    invoice_url: invoice_url.clone(),
                }],
                audit: Some((
                    BillingEventType::PaymentFailed,
                    serde_json::json!({
                        "amount_due_cents": amount_due_cents,
                        "episode_continues": already_failing,
                    }),
                )),
            }
        }

        BillingEvent::PaymentSucceeded => Transition {
            write: Some(remapped_write(
                current,
                BillingStatus::Active,
                current.stripe_customer_id.clone(),
                current.stripe_subscription_id.clone(),
            )),
            notifications: Vec::new(),
            audit: Some((
                BillingEventType::PaymentRecovered,
                serde_json::json!({
                    "previous_status": current.billing_status.as_str(),
                }),
            )),
        },

        BillingEvent::SubscriptionUpdated {
            subscription_id,
            status,
        } => Transition {
            write: Some(remapped_write(
                current,
                *status,
                current.stripe_customer_id.clone(),
                subscription_id
                    .clone()
                    .or_else(|| current.stripe_subscription_id.clone()),
            )),
            notifications: Vec::new(),
            audit: Some((
                BillingEventType::SubscriptionUpdated,
                serde_json::json!({
                    "status": status.as_str(),
                    "previous_status": current.billing_status.as_str(),
                }),
            )),
        },

        BillingEvent::SubscriptionDeleted => Transition {
            write: Some(BillingStateWrite {
                billing_status: BillingStatus::Canceled,
                stripe_customer_id: current.stripe_customer_id.clone(),
                stripe_subscription_id: current.stripe_subscription_id.clone(),
                last_payment_failed_at: None,
                grace_period_ends_at: None,
                reminder_sent_at: None,
                force_hidden: true,
            }),
            notifications: vec![Notification::SubscriptionCanceled],
            audit: Some((
                BillingEventType::SubscriptionCanceled,
                serde_json::json!({
                    "previous_status": current.billing_status.as_str(),
                    "was_visible": current.is_visible,
                }),
            )),
        },

        BillingEvent::Unrecognized { event_type } => {
            tracing::debug!(event_type = %event_type, "No transition for event type");
            Transition::noop()
        }
    }
}

/// Build the write for a status remap.
///
/// Episode fields survive only while the status stays `payment_failed`; any
/// transition out clears all three together so a stale deadline can never
/// leak into the next episode.
fn remapped_write(
    current: &VenueBillingRecord,
    status: BillingStatus,
    customer_id: Option<String>,
    subscription_id: Option<String>,
) -> BillingStateWrite {
    let staying_failed = status == BillingStatus::PaymentFailed
        && current.billing_status == BillingStatus::PaymentFailed;

    let (failed_at, deadline, reminder) = if staying_failed {
        (
            current.last_payment_failed_at,
            current.grace_period_ends_at,
            current.reminder_sent_at,
        )
    } else {
        (None, None, None)
    };

    BillingStateWrite {
        billing_status: status,
        stripe_customer_id: customer_id,
        stripe_subscription_id: subscription_id,
        last_payment_failed_at: failed_at,
        grace_period_ends_at: deadline,
        reminder_sent_at: reminder,
        force_hidden: false,
    }
}
