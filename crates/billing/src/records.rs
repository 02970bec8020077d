//! Venue billing records
//!
//! The billing state store: one billing namespace per venue row, read as
//! `VenueBillingRecord` and written back only as a whole via
//! [`BillingStore::apply_state`]. That single-UPDATE discipline is what keeps
//! a concurrent reader from ever observing a half-updated failure episode
//! (e.g. `payment_failed` with no deadline yet).

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// Grace window between a payment failure and the venue being hidden.
pub const GRACE_PERIOD: Duration = Duration::days(14);

/// How far into the grace window the single reminder email fires.
pub const REMINDER_AFTER: Duration = Duration::days(7);

/// Subscription health of a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    PaymentFailed,
    Canceled,
    Unknown,
}

impl BillingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingStatus::Active => "active",
            BillingStatus::PaymentFailed => "payment_failed",
            BillingStatus::Canceled => "canceled",
            BillingStatus::Unknown => "unknown",
        }
    }

    /// Parse the stored form. Unrecognized values decode as `Unknown` rather
    /// than failing the row read.
    pub fn from_db(s: &str) -> Self {
        match s {
            "active" => BillingStatus::Active,
            "payment_failed" => BillingStatus::PaymentFailed,
            "canceled" => BillingStatus::Canceled,
            _ => BillingStatus::Unknown,
        }
    }

    /// Map Stripe's subscription status vocabulary onto ours.
    ///
    /// `active`/`trialing` count as healthy, `past_due`/`unpaid` as a payment
    /// failure, and everything else (canceled, incomplete, paused, ...) as
    /// canceled.
    pub fn from_subscription_status(status: stripe::SubscriptionStatus) -> Self {
        use stripe::SubscriptionStatus as S;
        match status {
            S::Active | S::Trialing => BillingStatus::Active,
            S::PastDue | S::Unpaid => BillingStatus::PaymentFailed,
            _ => BillingStatus::Canceled,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A venue's billing namespace plus the listing bits billing acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueBillingRecord {
    pub venue_id: Uuid,
    pub venue_name: String,
    pub is_visible: bool,
    pub billing_status: BillingStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub last_payment_failed_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub reminder_sent_at: Option<OffsetDateTime>,
}

impl VenueBillingRecord {
    /// Derived: billing is enabled unless the subscription is canceled.
    pub fn billing_enabled(&self) -> bool {
        self.billing_status != BillingStatus::Canceled
    }

    /// The deadline after which the venue is hidden for non-payment.
    ///
    /// Prefers the stored deadline; falls back to recomputing from the
    /// failure timestamp for records written before the deadline column
    /// existed. Only meaningful while `billing_status == PaymentFailed`.
    pub fn effective_grace_deadline(&self) -> Option<OffsetDateTime> {
        self.grace_period_ends_at
            .or_else(|| self.last_payment_failed_at.map(|t| t + GRACE_PERIOD))
    }
}

/// The full billing namespace as one write.
///
/// Produced by the state machine, applied by [`BillingStore::apply_state`]
/// as a single UPDATE. `force_hidden` is set only by transitions that must
/// take the venue offline (cancellation); it never turns visibility on.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingStateWrite {
    pub billing_status: BillingStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub last_payment_failed_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub reminder_sent_at: Option<OffsetDateTime>,
    pub force_hidden: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct VenueBillingRow {
    venue_id: Uuid,
    venue_name: String,
    is_visible: bool,
    billing_status: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    last_payment_failed_at: Option<OffsetDateTime>,
    grace_period_ends_at: Option<OffsetDateTime>,
    reminder_sent_at: Option<OffsetDateTime>,
}

impl From<VenueBillingRow> for VenueBillingRecord {
    fn from(row: VenueBillingRow) -> Self {
        VenueBillingRecord {
            venue_id: row.venue_id,
            venue_name: row.venue_name,
            is_visible: row.is_visible,
            billing_status: BillingStatus::from_db(&row.billing_status),
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            last_payment_failed_at: row.last_payment_failed_at,
            grace_period_ends_at: row.grace_period_ends_at,
            reminder_sent_at: row.reminder_sent_at,
        }
    }
}

const RECORD_COLUMNS: &str = r#"
    id as venue_id,
    name as venue_name,
    is_visible,
    billing_status,
    stripe_customer_id,
    stripe_subscription_id,
    last_payment_failed_at,
    grace_period_ends_at,
    reminder_sent_at
"#;

/// Persistence for venue billing state
#[derive(Clone)]
pub struct BillingStore {
    pool: PgPool,
}

impl BillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch_by_venue(
        &self,
        venue_id: Uuid,
    ) -> BillingResult<Option<VenueBillingRecord>> {
        let row: Option<VenueBillingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM venues WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Resolve a venue by the subscription id we recorded at checkout.
    pub async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM venues WHERE stripe_subscription_id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Resolve a venue by its Stripe customer id.
    pub async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM venues WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Owner email and venue name for notifications.
    pub async fn owner_contact(&self, venue_id: Uuid) -> BillingResult<Option<(String, String)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT u.email, v.name
            FROM venues v
            JOIN users u ON u.id = v.owner_id
            WHERE v.id = $1
            "#,
        )
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Apply a transition's output as one merge write.
    ///
    /// Every billing column is written together with the status so the
    /// episode fields can never go stale relative to it. Visibility is only
    /// ever forced off here, never on.
    pub async fn apply_state(&self, venue_id: Uuid, next: &BillingStateWrite) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE venues SET
                billing_status = $2,
                stripe_customer_id = $3,
                stripe_subscription_id = $4,
                last_payment_failed_at = $5,
                grace_period_ends_at = $6,
                reminder_sent_at = $7,
                is_visible = CASE WHEN $8 THEN FALSE ELSE is_visible END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(venue_id)
        .bind(next.billing_status.as_str())
        .bind(next.stripe_customer_id.as_deref())
        .bind(next.stripe_subscription_id.as_deref())
        .bind(next.last_payment_failed_at)
        .bind(next.grace_period_ends_at)
        .bind(next.reminder_sent_at)
        .bind(next.force_hidden)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim the single per-episode reminder.
    ///
    /// Conditional on `reminder_sent_at IS NULL` so overlapping reconciler
    /// runs cannot both win; returns whether this caller won.
    pub async fn mark_reminder_sent(
        &self,
        venue_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE venues
            SET reminder_sent_at = $2, updated_at = NOW()
            WHERE id = $1
              AND billing_status = 'payment_failed'
              AND reminder_sent_at IS NULL
            "#,
        )
        .bind(venue_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Hide a venue whose grace period lapsed; returns whether it was
    /// visible (so the caller sends the notification exactly once).
    pub async fn hide_venue(&self, venue_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE venues
            SET is_visible = FALSE, updated_at = NOW()
            WHERE id = $1 AND is_visible = TRUE
            "#,
        )
        .bind(venue_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist a recomputed grace deadline for a record that predates the
    /// deadline column. Conditional so a concurrently stored value wins.
    pub async fn backfill_grace_deadline(
        &self,
        venue_id: Uuid,
        deadline: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE venues
            SET grace_period_ends_at = $2, updated_at = NOW()
            WHERE id = $1
              AND billing_status = 'payment_failed'
              AND grace_period_ends_at IS NULL
            "#,
        )
        .bind(venue_id)
        .bind(deadline)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One page of venues in a payment-failed episode, keyset-paginated so a
    /// reconciler run is bounded regardless of how many venues are failing.
    pub async fn payment_failed_page(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<VenueBillingRecord>> {
        let rows: Vec<VenueBillingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM venues
            WHERE billing_status = 'payment_failed'
              AND ($1::uuid IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
            RECORD_COLUMNS
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_mapping() {
        use stripe::SubscriptionStatus as S;
        assert_eq!(
            BillingStatus::from_subscription_status(S::Active),
            BillingStatus::Active
        );
        assert_eq!(
            BillingStatus::from_subscription_status(S::Trialing),
            BillingStatus::Active
        );
        assert_eq!(
            BillingStatus::from_subscription_status(S::PastDue),
            BillingStatus::PaymentFailed
        );
        assert_eq!(
            BillingStatus::from_subscription_status(S::Unpaid),
            BillingStatus::PaymentFailed
        );
        assert_eq!(
            BillingStatus::from_subscription_status(S::Canceled),
            BillingStatus::Canceled
        );
        assert_eq!(
            BillingStatus::from_subscription_status(S::IncompleteExpired),
            BillingStatus::Canceled
        );
        assert_eq!(
            BillingStatus::from_subscription_status(S::Paused),
            BillingStatus::Canceled
        );
    }

    #[test]
    fn db_round_trip_and_unknown_fallback() {
        for status in [
            BillingStatus::Active,
            BillingStatus::PaymentFailed,
            BillingStatus::Canceled,
            BillingStatus::Unknown,
        ] {
            assert_eq!(BillingStatus::from_db(status.as_str()), status);
        }
        assert_eq!(BillingStatus::from_db("garbage"), BillingStatus::Unknown);
    }

    #[test]
    fn effective_deadline_prefers_stored_value() {
        let failed_at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap_or(
            OffsetDateTime::UNIX_EPOCH,
        );
        let stored = failed_at + Duration::days(10);

        let mut record = VenueBillingRecord {
            venue_id: Uuid::nil(),
            venue_name: "Test".to_string(),
            is_visible: true,
            billing_status: BillingStatus::PaymentFailed,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            last_payment_failed_at: Some(failed_at),
            grace_period_ends_at: Some(stored),
            reminder_sent_at: None,
        };
        assert_eq!(record.effective_grace_deadline(), Some(stored));

        record.grace_period_ends_at = None;
        assert_eq!(
            record.effective_grace_deadline(),
            Some(failed_at + GRACE_PERIOD)
        );

        record.last_payment_failed_at = None;
        assert_eq!(record.effective_grace_deadline(), None);
    }
}
