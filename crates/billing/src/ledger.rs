//! Stripe event ledger
//!
//! One row per inbound provider event, keyed by Stripe's event id. The
//! ledger is what turns at-least-once webhook delivery into exactly-once
//! side effects: before anything else runs, a delivery must win the claim.
//!
//! Claiming uses a single INSERT...ON CONFLICT...RETURNING statement so two
//! concurrent deliveries of the same event can never both pass an EXISTS
//! check. A returned row means this caller owns processing - either the
//! insert was fresh or a previous attempt ended in `error` and is being
//! retried. Entries in `processing` or `processed` are never re-claimable.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of attempting to claim an event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// True when this caller won the claim and must run side effects.
    /// False means the event is a duplicate delivery: acknowledge success
    /// to the provider without reprocessing.
    pub should_process: bool,
}

/// A ledger row, exposed for audit endpoints and the invariant checker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub claim_status: String,
    pub attempts: i32,
    pub event_created_at: Option<OffsetDateTime>,
    pub resolved_venue_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Idempotency ledger for inbound Stripe events
#[derive(Clone)]
pub struct EventLedger {
    pool: PgPool,
}

impl EventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim exclusive processing rights for an event.
    ///
    /// The WHERE clause on the upsert means the UPDATE arm only fires for
    /// rows in `error`; for `processing`/`processed` rows the statement
    /// returns no row and the caller must short-circuit. The follow-up
    /// attempts bump on the duplicate path is diagnostic only - ownership is
    /// decided entirely by this first statement.
    pub async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_created_at: Option<OffsetDateTime>,
    ) -> BillingResult<ClaimOutcome> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_event_ledger
                (stripe_event_id, event_type, claim_status, attempts, event_created_at)
            VALUES ($1, $2, 'processing', 1, $3)
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                claim_status = 'processing',
                attempts = stripe_event_ledger.attempts + 1,
                last_error = NULL,
                updated_at = NOW()
            WHERE stripe_event_ledger.claim_status = 'error'
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim ledger entry");
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome {
                should_process: true,
            });
        }

        // Duplicate delivery. Record the redelivery and log why we skipped.
        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE stripe_event_ledger
            SET attempts = attempts + 1, updated_at = NOW()
            WHERE stripe_event_id = $1
            RETURNING claim_status
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        let reason = match existing.as_ref().map(|(s,)| s.as_str()) {
            Some("processed") => "already processed",
            Some("processing") => "currently being processed by another delivery",
            Some(_) => "exists with another status",
            None => "unknown (row vanished between statements?)",
        };

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            reason = %reason,
            "Duplicate Stripe event - skipping"
        );

        Ok(ClaimOutcome {
            should_process: false,
        })
    }

    /// Mark a claimed event as fully processed.
    pub async fn mark_processed(
        &self,
        event_id: &str,
        resolved_venue_id: Option<Uuid>,
    ) -> BillingResult<()> {
        self.write_terminal(event_id, "processed", None, resolved_venue_id)
            .await
    }

    /// Mark a claimed event as failed, making it claimable again on the
    /// provider's next redelivery.
    pub async fn mark_error(&self, event_id: &str, message: &str) -> BillingResult<()> {
        self.write_terminal(event_id, "error", Some(message), None)
            .await
    }

    /// Terminal status write, retried once. Losing this write strands the
    /// row in `processing` and blocks legitimate redeliveries, so it gets
    /// more care than an ordinary update.
    async fn write_terminal(
        &self,
        event_id: &str,
        status: &str,
        message: Option<&str>,
        resolved_venue_id: Option<Uuid>,
    ) -> BillingResult<()> {
        let update = || async {
            sqlx::query(
                r#"
                UPDATE stripe_event_ledger
                SET claim_status = $2,
                    last_error = $3,
                    resolved_venue_id = COALESCE($4, resolved_venue_id),
                    updated_at = NOW()
                WHERE stripe_event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(status)
            .bind(message)
            .bind(resolved_venue_id)
            .execute(&self.pool)
            .await
        };

        if let Err(first_err) = update().await {
            tracing::warn!(
                event_id = %event_id,
                error = %first_err,
                "First attempt to finalize ledger entry failed, retrying..."
            );

            if let Err(retry_err) = update().await {
                tracing::error!(
                    event_id = %event_id,
                    status = %status,
                    first_error = %first_err,
                    retry_error = %retry_err,
                    "CRITICAL: Failed to finalize ledger entry after retry. \
                     Event may appear stuck in 'processing' state. \
                     Manual intervention may be required."
                );
                return Err(BillingError::Database(retry_err.to_string()));
            }
        }

        Ok(())
    }

    /// Fetch a ledger entry for audit/troubleshooting.
    pub async fn fetch(&self, event_id: &str) -> BillingResult<Option<LedgerEntry>> {
        let entry: Option<LedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, claim_status, attempts,
                   event_created_at, resolved_venue_id, last_error, created_at, updated_at
            FROM stripe_event_ledger
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Delete processed entries older than the retention window. Entries in
    /// `error` or `processing` are kept - they still carry diagnostic value.
    pub async fn prune_processed(&self, retention_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_event_ledger
            WHERE claim_status = 'processed'
              AND created_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
