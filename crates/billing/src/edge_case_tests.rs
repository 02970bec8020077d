// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Lifecycle
//!
//! Walks the critical boundary conditions across:
//! - Failure-episode lifecycle (open, continue, close, cancel)
//! - Grace-period timeline (day 7 reminder, day 14 hide)
//! - Visibility gating against billing state
//! - Provider status vocabulary mapping

#[cfg(test)]
mod episode_lifecycle_tests {
    use crate::records::{BillingStatus, VenueBillingRecord, GRACE_PERIOD};
    use crate::state_machine::{transition, BillingEvent, Notification};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn venue(status: BillingStatus) -> VenueBillingRecord {
        VenueBillingRecord {
            venue_id: Uuid::new_v4(),
            venue_name: "The Offside Trap".to_string(),
            is_visible: true,
            billing_status: status,
            stripe_customer_id: Some("cus_test".to_string()),
            stripe_subscription_id: Some("sub_test".to_string()),
            last_payment_failed_at: None,
            grace_period_ends_at: None,
            reminder_sent_at: None,
        }
    }

    fn apply(record: &mut VenueBillingRecord, event: &BillingEvent, now: OffsetDateTime) {
        let t = transition(event, record, now);
        if let Some(write) = t.write {
            record.billing_status = write.billing_status;
            record.stripe_customer_id = write.stripe_customer_id;
            record.stripe_subscription_id = write.stripe_subscription_id;
            record.last_payment_failed_at = write.last_payment_failed_at;
            record.grace_period_ends_at = write.grace_period_ends_at;
            record.reminder_sent_at = write.reminder_sent_at;
            if write.force_hidden {
                record.is_visible = false;
            }
        }
    }

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    // =========================================================================
    // Failure then recovery: episode fields all clear together
    // =========================================================================
    #[test]
    fn recovery_mid_grace_clears_the_whole_episode() {
        let t0 = at(1_700_000_000);
        let mut record = venue(BillingStatus::Active);

        apply(
            &mut record,
            &BillingEvent::PaymentFailed {
                amount_due_cents: Some(2900),
                invoice_url: None,
            },
            t0,
        );
        assert_eq!(record.billing_status, BillingStatus::PaymentFailed);
        assert_eq!(record.grace_period_ends_at, Some(t0 + GRACE_PERIOD));

        // Payment recovers on day 10, inside the grace window.
        apply(&mut record, &BillingEvent::PaymentSucceeded, t0 + Duration::days(10));

        assert_eq!(record.billing_status, BillingStatus::Active);
        assert_eq!(record.last_payment_failed_at, None);
        assert_eq!(record.grace_period_ends_at, None);
        assert_eq!(record.reminder_sent_at, None);
        // No stale deadline left for a reconciler run to act on.
        assert_eq!(record.effective_grace_deadline(), None);
    }

    // =========================================================================
    // Two failures in one episode: one deadline, one eventual reminder
    // =========================================================================
    #[test]
    fn second_failure_does_not_restart_the_clock() {
        let t0 = at(1_700_000_000);
        let mut record = venue(BillingStatus::Active);

        let failed = BillingEvent::PaymentFailed {
            amount_due_cents: Some(2900),
            invoice_url: None,
        };

        apply(&mut record, &failed, t0);
        let original_deadline = record.grace_period_ends_at;

        // Stripe retries the charge on day 5 and fails again (a new event
        // id, so the ledger lets it through).
        apply(&mut record, &failed, t0 + Duration::days(5));

        assert_eq!(record.last_payment_failed_at, Some(t0));
        assert_eq!(record.grace_period_ends_at, original_deadline);
    }

    // =========================================================================
    // A fresh episode after recovery starts a fresh clock
    // =========================================================================
    #[test]
    fn new_episode_after_recovery_gets_a_new_deadline() {
        let t0 = at(1_700_000_000);
        let mut record = venue(BillingStatus::Active);

        let failed = BillingEvent::PaymentFailed {
            amount_due_cents: None,
            invoice_url: None,
        };

        apply(&mut record, &failed, t0);
        apply(&mut record, &BillingEvent::PaymentSucceeded, t0 + Duration::days(3));

        // Next month's invoice fails.
        let t1 = t0 + Duration::days(33);
        apply(&mut record, &failed, t1);

        assert_eq!(record.last_payment_failed_at, Some(t1));
        assert_eq!(record.grace_period_ends_at, Some(t1 + GRACE_PERIOD));
        assert_eq!(record.reminder_sent_at, None);
    }

    // =========================================================================
    // Cancellation always hides, from any prior state
    // =========================================================================
    #[test]
    fn cancellation_hides_regardless_of_prior_visibility() {
        let t0 = at(1_700_000_000);

        for status in [
            BillingStatus::Active,
            BillingStatus::PaymentFailed,
            BillingStatus::Unknown,
        ] {
            let mut record = venue(status);
            record.is_visible = true;

            apply(&mut record, &BillingEvent::SubscriptionDeleted, t0);

            assert_eq!(record.billing_status, BillingStatus::Canceled);
            assert!(!record.is_visible, "venue must be hidden from {:?}", status);
            assert!(!record.billing_enabled());
        }
    }

    #[test]
    fn cancellation_notifies_the_owner() {
        let t = transition(
            &BillingEvent::SubscriptionDeleted,
            &venue(BillingStatus::Active),
            at(1_700_000_000),
        );
        assert_eq!(t.notifications, vec![Notification::SubscriptionCanceled]);
    }
}

#[cfg(test)]
mod grace_timeline_tests {
    use crate::reconciler::{plan, VenuePlan};
    use crate::records::{BillingStatus, VenueBillingRecord, GRACE_PERIOD};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn failing_venue(failed_at: OffsetDateTime) -> VenueBillingRecord {
        VenueBillingRecord {
            venue_id: Uuid::new_v4(),
            venue_name: "The Back Post".to_string(),
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
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    // =========================================================================
    // Full timeline: nothing, reminder once, nothing, hide once
    // =========================================================================
    #[test]
    fn timeline_from_failure_to_hide() {
        let t0 = at(1_700_000_000);
        let mut record = failing_venue(t0);

        // Day 1: quiet.
        assert_eq!(plan(&record, t0 + Duration::days(1)), VenuePlan::default());

        // Day 6, one second before the boundary: still quiet.
        let just_before = t0 + Duration::days(7) - Duration::seconds(1);
        assert!(!plan(&record, just_before).send_reminder);

        // Day 7 exactly: the reminder fires.
        let day7 = t0 + Duration::days(7);
        assert!(plan(&record, day7).send_reminder);

        // The reconciler stamps the reminder...
        record.reminder_sent_at = Some(day7);

        // ...so a run five minutes later does nothing.
        let p = plan(&record, day7 + Duration::minutes(5));
        assert!(!p.send_reminder);
        assert!(!p.hide);

        // Day 14 exactly: hide, and no late reminder.
        let day14 = t0 + GRACE_PERIOD;
        let p = plan(&record, day14);
        assert!(p.hide);
        assert!(!p.send_reminder);

        // After the hide lands, later runs are quiet again.
        record.is_visible = false;
        assert_eq!(plan(&record, day14 + Duration::days(1)), VenuePlan::default());
    }

    // =========================================================================
    // Reminder window closes at the deadline
    // =========================================================================
    #[test]
    fn no_reminder_once_the_deadline_has_passed() {
        let t0 = at(1_700_000_000);
        let record = failing_venue(t0);

        // Reconciler was down for the whole window; at day 15 only the
        // hide applies. A "you will be hidden soon" email after the hide
        // would be nonsense.
        let p = plan(&record, t0 + Duration::days(15));
        assert!(!p.send_reminder);
        assert!(p.hide);
    }

    // =========================================================================
    // Deadline earlier than failure + 14d (admin-shortened) is honored
    // =========================================================================
    #[test]
    fn stored_deadline_wins_over_recomputation() {
        let t0 = at(1_700_000_000);
        let mut record = failing_venue(t0);
        record.grace_period_ends_at = Some(t0 + Duration::days(5));

        let p = plan(&record, t0 + Duration::days(6));
        assert!(p.hide);
        // Reminder window (day 7) is past the shortened deadline: never fires.
        assert!(!p.send_reminder);
    }

    // =========================================================================
    // Invisible venue still gets its reminder
    // =========================================================================
    #[test]
    fn reminder_fires_even_when_owner_already_unlisted_the_venue() {
        let t0 = at(1_700_000_000);
        let mut record = failing_venue(t0);
        record.is_visible = false;

        let p = plan(&record, t0 + Duration::days(8));
        assert!(p.send_reminder);
        assert!(!p.hide);
    }
}

#[cfg(test)]
mod visibility_gate_tests {
    use crate::records::{BillingStatus, VenueBillingRecord, GRACE_PERIOD};
    use crate::visibility::{check_can_publish, PublishActor, PublishDenied};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn venue(status: BillingStatus) -> VenueBillingRecord {
        VenueBillingRecord {
            venue_id: Uuid::new_v4(),
            venue_name: "The Twelfth Man".to_string(),
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
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    // =========================================================================
    // Toggle attempts against each billing state
    // =========================================================================
    #[test]
    fn toggle_during_grace_is_accepted_then_rejected_after_expiry() {
        let t0 = at(1_700_000_000);
        let mut record = venue(BillingStatus::PaymentFailed);
        record.last_payment_failed_at = Some(t0);
        record.grace_period_ends_at = Some(t0 + GRACE_PERIOD);

        // Day 1: accepted.
        assert_eq!(
            check_can_publish(&record, true, PublishActor::Owner, t0 + Duration::days(1)),
            Ok(())
        );

        // Day 15: rejected with the grace-period reason.
        assert_eq!(
            check_can_publish(&record, true, PublishActor::Owner, t0 + Duration::days(15)),
            Err(PublishDenied::GracePeriodExpired)
        );
    }

    #[test]
    fn canceled_toggle_is_rejected_with_subscription_reason() {
        let result = check_can_publish(
            &venue(BillingStatus::Canceled),
            true,
            PublishActor::Owner,
            at(1_700_000_000),
        );
        assert_eq!(result, Err(PublishDenied::SubscriptionCanceled));
    }

    #[test]
    fn exact_deadline_instant_is_already_expired() {
        let t0 = at(1_700_000_000);
        let mut record = venue(BillingStatus::PaymentFailed);
        record.last_payment_failed_at = Some(t0);
        record.grace_period_ends_at = Some(t0 + GRACE_PERIOD);

        // now == deadline: the gate closes at the boundary, not after it.
        assert_eq!(
            check_can_publish(&record, true, PublishActor::Owner, t0 + GRACE_PERIOD),
            Err(PublishDenied::GracePeriodExpired)
        );
    }

    #[test]
    fn unknown_status_with_verified_email_is_allowed() {
        // A venue that never started checkout can still be published; the
        // subscription gate applies to canceled/expired states, not to
        // never-billed ones.
        assert_eq!(
            check_can_publish(
                &venue(BillingStatus::Unknown),
                true,
                PublishActor::Owner,
                at(1_700_000_000)
            ),
            Ok(())
        );
    }

    #[test]
    fn admin_bypasses_billing_but_never_email_verification() {
        let t0 = at(1_700_000_000);
        let mut record = venue(BillingStatus::PaymentFailed);
        record.last_payment_failed_at = Some(t0);
        record.grace_period_ends_at = Some(t0 + GRACE_PERIOD);

        // Expired grace, admin override: allowed.
        assert_eq!(
            check_can_publish(
                &record,
                true,
                PublishActor::PlatformAdmin,
                t0 + Duration::days(20)
            ),
            Ok(())
        );

        // Same override attempt with an unverified owner: rejected.
        assert_eq!(
            check_can_publish(
                &record,
                false,
                PublishActor::PlatformAdmin,
                t0 + Duration::days(20)
            ),
            Err(PublishDenied::EmailNotVerified)
        );
    }

    #[test]
    fn denial_reasons_are_user_facing_strings() {
        assert!(!PublishDenied::EmailNotVerified.to_string().is_empty());
        assert!(PublishDenied::GracePeriodExpired
            .to_string()
            .contains("Grace period expired"));
    }
}

#[cfg(test)]
mod status_mapping_tests {
    use crate::records::BillingStatus;
    use stripe::SubscriptionStatus as S;

    // =========================================================================
    // The full provider vocabulary maps onto exactly four states
    // =========================================================================
    #[test]
    fn every_provider_status_has_a_home() {
        let cases = [
            (S::Active, BillingStatus::Active),
            (S::Trialing, BillingStatus::Active),
            (S::PastDue, BillingStatus::PaymentFailed),
            (S::Unpaid, BillingStatus::PaymentFailed),
            (S::Canceled, BillingStatus::Canceled),
            (S::Incomplete, BillingStatus::Canceled),
            (S::IncompleteExpired, BillingStatus::Canceled),
            (S::Paused, BillingStatus::Canceled),
        ];

        for (provider, expected) in cases {
            assert_eq!(
                BillingStatus::from_subscription_status(provider),
                expected,
                "mapping for {:?}",
                provider
            );
        }
    }

    #[test]
    fn billing_enabled_tracks_cancellation_only() {
        use crate::records::VenueBillingRecord;
        use uuid::Uuid;

        let mut record = VenueBillingRecord {
            venue_id: Uuid::nil(),
            venue_name: "Test".to_string(),
            is_visible: false,
            billing_status: BillingStatus::PaymentFailed,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            last_payment_failed_at: None,
            grace_period_ends_at: None,
            reminder_sent_at: None,
        };

        // Failing payment still counts as billing-enabled.
        assert!(record.billing_enabled());

        record.billing_status = BillingStatus::Canceled;
        assert!(!record.billing_enabled());
    }
}
