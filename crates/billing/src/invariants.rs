//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Venue(s) affected
    pub venue_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - venues may be wrongly hidden or wrongly visible
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for stale episode-field violations
#[derive(Debug, sqlx::FromRow)]
struct StaleEpisodeRow {
    venue_id: Uuid,
    venue_name: String,
    billing_status: String,
    grace_period_ends_at: Option<OffsetDateTime>,
    reminder_sent_at: Option<OffsetDateTime>,
}

/// Row type for visible-but-canceled violations
#[derive(Debug, sqlx::FromRow)]
struct VisibleCanceledRow {
    venue_id: Uuid,
    venue_name: String,
}

/// Row type for orphaned reminder violations
#[derive(Debug, sqlx::FromRow)]
struct OrphanReminderRow {
    venue_id: Uuid,
    venue_name: String,
    reminder_sent_at: Option<OffsetDateTime>,
}

/// Row type for expired-but-visible violations
#[derive(Debug, sqlx::FromRow)]
struct ExpiredVisibleRow {
    venue_id: Uuid,
    venue_name: String,
    grace_period_ends_at: Option<OffsetDateTime>,
}

/// Row type for stuck ledger entry violations
#[derive(Debug, sqlx::FromRow)]
struct StuckLedgerRow {
    stripe_event_id: String,
    event_type: String,
    attempts: i32,
    updated_at: OffsetDateTime,
}

/// Row type for ledger entries resolved to missing venues
#[derive(Debug, sqlx::FromRow)]
struct OrphanLedgerRow {
    stripe_event_id: String,
    resolved_venue_id: Option<Uuid>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_episode_fields_cleared().await?);
        violations.extend(self.check_canceled_not_visible().await?);
        violations.extend(self.check_reminder_within_episode().await?);
        violations.extend(self.check_expired_grace_hidden().await?);
        violations.extend(self.check_no_stuck_processing().await?);
        violations.extend(self.check_resolved_venues_exist().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Episode fields cleared outside payment_failed
    ///
    /// A grace deadline or reminder timestamp surviving into a non-failed
    /// status means a stale deadline could act on a healthy venue.
    async fn check_episode_fields_cleared(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleEpisodeRow> = sqlx::query_as(
            r#"
            SELECT
                v.id as venue_id,
                v.name as venue_name,
                v.billing_status,
                v.grace_period_ends_at,
                v.reminder_sent_at
            FROM venues v
            WHERE v.billing_status != 'payment_failed'
              AND (v.last_payment_failed_at IS NOT NULL
                   OR v.grace_period_ends_at IS NOT NULL
                   OR v.reminder_sent_at IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "episode_fields_cleared".to_string(),
                venue_ids: vec![row.venue_id],
                description: format!(
                    "Venue '{}' has status '{}' but still carries failure-episode fields",
                    row.venue_name, row.billing_status
                ),
                context: serde_json::json!({
                    "venue_name": row.venue_name,
                    "billing_status": row.billing_status,
                    "grace_period_ends_at": row.grace_period_ends_at,
                    "reminder_sent_at": row.reminder_sent_at,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Canceled venues are not publicly visible
    ///
    /// Cancellation force-hides the venue in the same write; a visible
    /// canceled venue means that write was bypassed.
    async fn check_canceled_not_visible(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<VisibleCanceledRow> = sqlx::query_as(
            r#"
            SELECT v.id as venue_id, v.name as venue_name
            FROM venues v
            WHERE v.billing_status = 'canceled'
              AND v.is_visible = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_not_visible".to_string(),
                venue_ids: vec![row.venue_id],
                description: format!(
                    "Venue '{}' has a canceled subscription but is still visible",
                    row.venue_name
                ),
                context: serde_json::json!({
                    "venue_name": row.venue_name,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: A reminder implies an open failure episode
    ///
    /// `reminder_sent_at` without `last_payment_failed_at` cannot happen
    /// through the state machine; it indicates a manual write.
    async fn check_reminder_within_episode(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanReminderRow> = sqlx::query_as(
            r#"
            SELECT v.id as venue_id, v.name as venue_name, v.reminder_sent_at
            FROM venues v
            WHERE v.reminder_sent_at IS NOT NULL
              AND v.last_payment_failed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "reminder_within_episode".to_string(),
                venue_ids: vec![row.venue_id],
                description: format!(
                    "Venue '{}' has a reminder timestamp but no recorded payment failure",
                    row.venue_name
                ),
                context: serde_json::json!({
                    "venue_name": row.venue_name,
                    "reminder_sent_at": row.reminder_sent_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Venues past their grace deadline are hidden
    ///
    /// Allows a day of reconciler lag before flagging, so a normally
    /// scheduled run has time to act.
    async fn check_expired_grace_hidden(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ExpiredVisibleRow> = sqlx::query_as(
            r#"
            SELECT v.id as venue_id, v.name as venue_name, v.grace_period_ends_at
            FROM venues v
            WHERE v.billing_status = 'payment_failed'
              AND v.is_visible = TRUE
              AND v.grace_period_ends_at IS NOT NULL
              AND v.grace_period_ends_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_grace_hidden".to_string(),
                venue_ids: vec![row.venue_id],
                description: format!(
                    "Venue '{}' is past its grace deadline but still visible",
                    row.venue_name
                ),
                context: serde_json::json!({
                    "venue_name": row.venue_name,
                    "grace_period_ends_at": row.grace_period_ends_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: No ledger entries stuck in processing
    ///
    /// An entry in `processing` for more than 30 minutes means a handler
    /// died before its terminal write. Those events are blocked from
    /// redelivery until resolved manually.
    async fn check_no_stuck_processing(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckLedgerRow> = sqlx::query_as(
            r#"
            SELECT l.stripe_event_id, l.event_type, l.attempts, l.updated_at
            FROM stripe_event_ledger l
            WHERE l.claim_status = 'processing'
              AND l.updated_at < NOW() - INTERVAL '30 minutes'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_processing".to_string(),
                venue_ids: vec![],
                description: format!(
                    "Ledger entry '{}' ({}) has been processing for over 30 minutes",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "attempts": row.attempts,
                    "updated_at": row.updated_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Resolved venue ids point at real venues
    async fn check_resolved_venues_exist(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanLedgerRow> = sqlx::query_as(
            r#"
            SELECT l.stripe_event_id, l.resolved_venue_id
            FROM stripe_event_ledger l
            WHERE l.resolved_venue_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM venues v WHERE v.id = l.resolved_venue_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "resolved_venues_exist".to_string(),
                venue_ids: row.resolved_venue_id.into_iter().collect(),
                description: format!(
                    "Ledger entry '{}' resolved to a venue that no longer exists",
                    row.stripe_event_id
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "resolved_venue_id": row.resolved_venue_id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "episode_fields_cleared" => self.check_episode_fields_cleared().await,
            "canceled_not_visible" => self.check_canceled_not_visible().await,
            "reminder_within_episode" => self.check_reminder_within_episode().await,
            "expired_grace_hidden" => self.check_expired_grace_hidden().await,
            "no_stuck_processing" => self.check_no_stuck_processing().await,
            "resolved_venues_exist" => self.check_resolved_venues_exist().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "episode_fields_cleared",
            "canceled_not_visible",
            "reminder_within_episode",
            "expired_grace_hidden",
            "no_stuck_processing",
            "resolved_venues_exist",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"episode_fields_cleared"));
        assert!(checks.contains(&"canceled_not_visible"));
    }
}
