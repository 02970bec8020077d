//! Visibility gate
//!
//! Synchronous precondition check run whenever someone tries to turn a
//! venue's public visibility on. Owners must clear every check; a platform
//! admin may override the billing checks (but not email verification, which
//! belongs to the owner account). Every denial carries the exact reason the
//! owner sees, so the toggle never silently no-ops.

use thiserror::Error;
use time::OffsetDateTime;

use crate::records::{BillingStatus, VenueBillingRecord};

/// Who is attempting to enable visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishActor {
    Owner,
    PlatformAdmin,
}

/// Why enabling visibility was refused. The display strings are shown to
/// the venue owner verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishDenied {
    #[error("Verify your account email before making the venue visible")]
    EmailNotVerified,

    #[error("Subscription canceled - re-subscribe to make the venue visible")]
    SubscriptionCanceled,

    #[error("Grace period expired - settle the outstanding payment to make the venue visible")]
    GracePeriodExpired,
}

/// Check whether a venue may become publicly visible right now.
pub fn check_can_publish(
    record: &VenueBillingRecord,
    owner_email_verified: bool,
    actor: PublishActor,
    now: OffsetDateTime,
) -> Result<(), PublishDenied> {
    // Email verification is owner-specific; even an admin override cannot
    // publish a venue whose owner account is unverified.
    if !owner_email_verified {
        return Err(PublishDenied::EmailNotVerified);
    }

    if actor == PublishActor::PlatformAdmin {
        return Ok(());
    }

    match record.billing_status {
        BillingStatus::Canceled => Err(PublishDenied::SubscriptionCanceled),
        BillingStatus::PaymentFailed => {
            match record.effective_grace_deadline() {
                Some(deadline) if now >= deadline => Err(PublishDenied::GracePeriodExpired),
                // Within the grace window (or no deadline recorded yet, in
                // which case the reconciler hasn't acted either): allowed.
                _ => Ok(()),
            }
        }
        BillingStatus::Active | BillingStatus::Unknown => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    fn record(status: BillingStatus) -> VenueBillingRecord {
        VenueBillingRecord {
            venue_id: Uuid::nil(),
            venue_name: "The Half Volley".to_string(),
            is_visible: false,
            billing_status: status,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            last_payment_failed_at: None,
            grace_period_ends_at: None,
            reminder_sent_at: None,
        }
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn active_venue_with_verified_owner_passes() {
        let result = check_can_publish(
            &record(BillingStatus::Active),
            true,
            PublishActor::Owner,
            at(1_700_000_000),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn unverified_email_is_rejected_even_for_admin() {
        let result = check_can_publish(
            &record(BillingStatus::Active),
            false,
            PublishActor::PlatformAdmin,
            at(1_700_000_000),
        );
        assert_eq!(result, Err(PublishDenied::EmailNotVerified));
    }

    #[test]
    fn canceled_subscription_is_rejected_with_reason() {
        let result = check_can_publish(
            &record(BillingStatus::Canceled),
            true,
            PublishActor::Owner,
            at(1_700_000_000),
        );
        assert_eq!(result, Err(PublishDenied::SubscriptionCanceled));
        assert!(PublishDenied::SubscriptionCanceled
            .to_string()
            .contains("Subscription canceled"));
    }

    #[test]
    fn admin_override_bypasses_canceled_subscription() {
        let result = check_can_publish(
            &record(BillingStatus::Canceled),
            true,
            PublishActor::PlatformAdmin,
            at(1_700_000_000),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn payment_failed_within_grace_is_allowed() {
        let failure = at(1_700_000_000);
        let mut rec = record(BillingStatus::PaymentFailed);
        rec.last_payment_failed_at = Some(failure);
        rec.grace_period_ends_at = Some(failure + Duration::days(14));

        // One day into the grace window.
        let result = check_can_publish(
            &rec,
            true,
            PublishActor::Owner,
            failure + Duration::days(1),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn payment_failed_past_deadline_is_rejected() {
        let failure = at(1_700_000_000);
        let mut rec = record(BillingStatus::PaymentFailed);
        rec.last_payment_failed_at = Some(failure);
        rec.grace_period_ends_at = Some(failure + Duration::days(14));

        let result = check_can_publish(
            &rec,
            true,
            PublishActor::Owner,
            failure + Duration::days(15),
        );
        assert_eq!(result, Err(PublishDenied::GracePeriodExpired));
    }

    #[test]
    fn fallback_deadline_from_failure_timestamp_applies() {
        let failure = at(1_700_000_000);
        let mut rec = record(BillingStatus::PaymentFailed);
        rec.last_payment_failed_at = Some(failure);
        // Older record: no stored deadline.
        rec.grace_period_ends_at = None;

        let within = check_can_publish(
            &rec,
            true,
            PublishActor::Owner,
            failure + Duration::days(13),
        );
        assert_eq!(within, Ok(()));

        let past = check_can_publish(
            &rec,
            true,
            PublishActor::Owner,
            failure + Duration::days(14),
        );
        assert_eq!(past, Err(PublishDenied::GracePeriodExpired));
    }
}
