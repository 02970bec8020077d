//! Grace-period reconciler
//!
//! Time-driven enforcement of the payment-failure grace window. Webhooks
//! open an episode; this job makes sure the episode ends on schedule even if
//! Stripe never sends another event: the day-7 reminder fires once per
//! episode, and at day 14 the venue is hidden. Runs from the worker's cron
//! schedule and from the authenticated HTTP trigger; both paths converge
//! because every per-venue action is guarded by a conditional UPDATE.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::records::{BillingStore, VenueBillingRecord, GRACE_PERIOD, REMINDER_AFTER};

/// Page size for the payment-failed scan. Keeps a single run bounded; the
/// scan keyset-paginates until the page comes back short.
const SCAN_PAGE_SIZE: i64 = 200;

/// Summary of one reconciler run.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub reminded: usize,
    pub hidden: usize,
    pub errors: usize,
}

/// What the reconciler should do for one venue at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VenuePlan {
    /// Deadline to persist for records that predate the deadline column.
    pub backfill_deadline: Option<OffsetDateTime>,
    pub send_reminder: bool,
    pub hide: bool,
}

/// Decide the actions for one payment-failed venue. Pure; the scan applies
/// the plan with guarded writes.
pub fn plan(record: &VenueBillingRecord, now: OffsetDateTime) -> VenuePlan {
    let deadline = record.effective_grace_deadline();

    // Records written before the deadline column gained a value: persist the
    // recomputed deadline once so it cannot drift if the failure timestamp
    // is ever rewritten.
    let backfill_deadline = match (record.grace_period_ends_at, record.last_payment_failed_at) {
        (None, Some(failed_at)) => Some(failed_at + GRACE_PERIOD),
        _ => None,
    };

    let send_reminder = record.reminder_sent_at.is_none()
        && match (record.last_payment_failed_at, deadline) {
            (Some(failed_at), Some(deadline)) => {
                now >= failed_at + REMINDER_AFTER && now < deadline
            }
            _ => false,
        };

    let hide = record.is_visible && matches!(deadline, Some(d) if now >= d);

    VenuePlan {
        backfill_deadline,
        send_reminder,
        hide,
    }
}

/// Scheduled enforcement of payment-failure grace periods
#[derive(Clone)]
pub struct GraceReconciler {
    store: BillingStore,
    email: BillingEmailService,
    event_logger: BillingEventLogger,
}

impl GraceReconciler {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            store: BillingStore::new(pool.clone()),
            email,
            event_logger: BillingEventLogger::new(pool),
        }
    }

    /// Scan every payment-failed venue and enforce its grace window.
    ///
    /// Per-venue failures are isolated: one venue's database or email
    /// trouble is counted and logged, and the scan moves on.
    pub async fn reconcile(&self, now: OffsetDateTime) -> BillingResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut after: Option<Uuid> = None;

        loop {
            let page = self.store.payment_failed_page(after, SCAN_PAGE_SIZE).await?;
            let page_len = page.len();

            for record in page {
                after = Some(record.venue_id);
                summary.scanned += 1;

                if let Err(e) = self.reconcile_venue(&record, now, &mut summary).await {
                    summary.errors += 1;
                    tracing::error!(
                        venue_id = %record.venue_id,
                        error = %e,
                        "Failed to reconcile venue - continuing scan"
                    );
                }
            }

            if page_len < SCAN_PAGE_SIZE as usize {
                break;
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            reminded = summary.reminded,
            hidden = summary.hidden,
            errors = summary.errors,
            "Grace period reconciliation complete"
        );

        Ok(summary)
    }

    async fn reconcile_venue(
        &self,
        record: &VenueBillingRecord,
        now: OffsetDateTime,
        summary: &mut ReconcileSummary,
    ) -> BillingResult<()> {
        let plan = plan(record, now);

        if let Some(deadline) = plan.backfill_deadline {
            self.store
                .backfill_grace_deadline(record.venue_id, deadline)
                .await?;
            tracing::info!(
                venue_id = %record.venue_id,
                deadline = %deadline,
                "Backfilled missing grace deadline"
            );
        }

        if plan.send_reminder {
            // Claim the reminder first; only the winning run sends, so
            // overlapping reconciler invocations cannot double-send.
            if self.store.mark_reminder_sent(record.venue_id, now).await? {
                summary.reminded += 1;
                self.send_reminder(record, now).await;
            }
        }

        if plan.hide {
            if self.store.hide_venue(record.venue_id).await? {
                summary.hidden += 1;
                tracing::warn!(
                    venue_id = %record.venue_id,
                    venue_name = %record.venue_name,
                    "Venue hidden - grace period lapsed without payment"
                );
                self.send_hidden(record).await;

                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(record.venue_id, BillingEventType::VenueHidden)
                            .data(serde_json::json!({
                                "deadline": record
                                    .effective_grace_deadline()
                                    .map(|d| d.unix_timestamp()),
                            }))
                            .actor_type(ActorType::Reconciler),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log venue hidden event");
                }
            }
        }

        Ok(())
    }

    async fn send_reminder(&self, record: &VenueBillingRecord, now: OffsetDateTime) {
        let deadline = record
            .effective_grace_deadline()
            .unwrap_or(now + GRACE_PERIOD - REMINDER_AFTER);

        match self.store.owner_contact(record.venue_id).await {
            Ok(Some((email, venue_name))) => {
                if let Err(e) = self
                    .email
                    .send_grace_reminder(&email, &venue_name, deadline)
                    .await
                {
                    tracing::error!(
                        venue_id = %record.venue_id,
                        error = %e,
                        "Failed to send grace reminder email"
                    );
                }
            }
            Ok(None) => {
                tracing::warn!(venue_id = %record.venue_id, "No owner contact for reminder");
            }
            Err(e) => {
                tracing::error!(venue_id = %record.venue_id, error = %e, "Owner lookup failed");
            }
        }

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(record.venue_id, BillingEventType::GraceReminderSent)
                    .data(serde_json::json!({
                        "deadline": deadline.unix_timestamp(),
                    }))
                    .actor_type(ActorType::Reconciler),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log grace reminder event");
        }
    }

    async fn send_hidden(&self, record: &VenueBillingRecord) {
        match self.store.owner_contact(record.venue_id).await {
            Ok(Some((email, venue_name))) => {
                if let Err(e) = self.email.send_venue_hidden(&email, &venue_name).await {
                    tracing::error!(
                        venue_id = %record.venue_id,
                        error = %e,
                        "Failed to send venue hidden email"
                    );
                }
            }
            Ok(None) => {
                tracing::warn!(venue_id = %record.venue_id, "No owner contact for hide notice");
            }
            Err(e) => {
                tracing::error!(venue_id = %record.venue_id, error = %e, "Owner lookup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BillingStatus;
    use time::Duration;

    fn failed_record(failed_at: OffsetDateTime) -> VenueBillingRecord {
        VenueBillingRecord {
            venue_id: Uuid::nil(),
            venue_name: "The Nutmeg".to_string(),
            is_visible: true,
            billing_status: BillingStatus::PaymentFailed,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            last_payment_failed_at: Some(failed_at),
            grace_period_ends_at: Some(failed_at + GRACE_PERIOD),
            reminder_sent_at: None,
        }
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn nothing_happens_before_day_seven() {
        let failed = at(1_700_000_000);
        let p = plan(&failed_record(failed), failed + Duration::days(6));
        assert_eq!(p, VenuePlan::default());
    }

    #[test]
    fn reminder_fires_at_day_seven() {
        let failed = at(1_700_000_000);
        let p = plan(&failed_record(failed), failed + Duration::days(7));
        assert!(p.send_reminder);
        assert!(!p.hide);
    }

    #[test]
    fn reminder_does_not_repeat_once_sent() {
        let failed = at(1_700_000_000);
        let mut record = failed_record(failed);
        record.reminder_sent_at = Some(failed + Duration::days(7));

        let p = plan(&record, failed + Duration::days(8));
        assert!(!p.send_reminder);
    }

    #[test]
    fn hide_fires_at_day_fourteen_without_reminder() {
        let failed = at(1_700_000_000);
        // Reminder never sent (e.g. reconciler was down all week): at the
        // deadline only the hide applies, not a late reminder.
        let p = plan(&failed_record(failed), failed + Duration::days(14));
        assert!(!p.send_reminder);
        assert!(p.hide);
    }

    #[test]
    fn hidden_venue_is_not_hidden_again() {
        let failed = at(1_700_000_000);
        let mut record = failed_record(failed);
        record.is_visible = false;

        let p = plan(&record, failed + Duration::days(15));
        assert!(!p.hide);
    }

    #[test]
    fn missing_deadline_is_backfilled_from_failure_timestamp() {
        let failed = at(1_700_000_000);
        let mut record = failed_record(failed);
        record.grace_period_ends_at = None;

        let p = plan(&record, failed + Duration::days(1));
        assert_eq!(p.backfill_deadline, Some(failed + GRACE_PERIOD));
        assert!(!p.send_reminder);
        assert!(!p.hide);

        // The fallback deadline still gates the hide.
        let p = plan(&record, failed + Duration::days(14));
        assert!(p.hide);
    }

    #[test]
    fn episode_without_failure_timestamp_is_left_alone() {
        let failed = at(1_700_000_000);
        let mut record = failed_record(failed);
        // payment_failed entered via subscription.updated: no episode
        // fields yet, nothing for the reconciler to act on.
        record.last_payment_failed_at = None;
        record.grace_period_ends_at = None;

        let p = plan(&record, failed + Duration::days(30));
        assert_eq!(p, VenuePlan::default());
    }
}
