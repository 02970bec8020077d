//! Billing audit events
//!
//! Append-only log of billing mutations. Events answer "why is this venue
//! hidden?" without replaying Stripe history and give support a timeline per
//! venue. Writes are best-effort: a failed audit insert is logged by the
//! caller and never fails the transition it describes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    CheckoutCompleted,
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PaymentFailed,
    PaymentRecovered,
    GraceReminderSent,
    VenueHidden,
    AdminOverride,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::PaymentRecovered => "PAYMENT_RECOVERED",
            BillingEventType::GraceReminderSent => "GRACE_REMINDER_SENT",
            BillingEventType::VenueHidden => "VENUE_HIDDEN",
            BillingEventType::AdminOverride => "ADMIN_OVERRIDE",
        };
        write!(f, "{}", s)
    }
}

/// Who caused a billing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    Stripe,
    Reconciler,
    Admin,
    System,
}

impl ActorType {
    fn as_str(self) -> &'static str {
        match self {
            ActorType::Stripe => "stripe",
            ActorType::Reconciler => "reconciler",
            ActorType::Admin => "admin",
            ActorType::System => "system",
        }
    }
}

/// A recorded billing event row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for a billing event entry
pub struct BillingEventBuilder {
    venue_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(venue_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            venue_id,
            event_type,
            data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Append-only billing event logger
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (venue_id, event_type, data, stripe_event_id, stripe_subscription_id, actor_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(builder.venue_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.data)
        .bind(builder.stripe_event_id.as_deref())
        .bind(builder.stripe_subscription_id.as_deref())
        .bind(builder.actor_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent events for a venue, newest first.
    pub async fn recent_for_venue(
        &self,
        venue_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, venue_id, event_type, data,
                   stripe_event_id, stripe_subscription_id, actor_type, created_at
            FROM billing_events
            WHERE venue_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(venue_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_display_is_stable() {
        assert_eq!(
            BillingEventType::PaymentFailed.to_string(),
            "PAYMENT_FAILED"
        );
        assert_eq!(BillingEventType::VenueHidden.to_string(), "VENUE_HIDDEN");
        assert_eq!(
            BillingEventType::GraceReminderSent.to_string(),
            "GRACE_REMINDER_SENT"
        );
    }
}
