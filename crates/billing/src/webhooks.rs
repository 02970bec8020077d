//! Stripe webhook handling
//!
//! The intake path for every provider event: verify the signature, claim
//! the event in the ledger, normalize it, run the state machine, apply the
//! merge write, then run post-commit effects. The ledger's terminal status
//! is written no matter how processing ends, so a crash mid-transition
//! leaves the entry in `error` and the provider's redelivery can retry it.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger};
use crate::ledger::EventLedger;
use crate::records::{BillingStatus, BillingStore};
use crate::state_machine::{self, BillingEvent, Notification};

type HmacSha256 = Hmac<Sha256>;

/// Metadata key venues are tagged with on Stripe objects at checkout.
const VENUE_METADATA_KEY: &str = "venue_id";

/// Signature timestamp tolerance, matching Stripe's own SDK default.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A provider event reduced to the identifiers and domain event the
/// transition logic needs.
#[derive(Debug)]
struct NormalizedEvent {
    /// Venue id carried directly on the event (metadata or client
    /// reference), when present.
    venue_hint: Option<Uuid>,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    event: BillingEvent,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    store: BillingStore,
    ledger: EventLedger,
    email: BillingEmailService,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            stripe,
            store: BillingStore::new(pool.clone()),
            ledger: EventLedger::new(pool.clone()),
            email,
            event_logger: BillingEventLogger::new(pool),
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the SDK's verification first, then falls back to manual
    /// signature verification: the pinned async-stripe release rejects
    /// payloads from newer Stripe API versions that are still perfectly
    /// verifiable.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        // Signature header format: t=timestamp,v1=signature[,v0=signature]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                skew = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The ledger claim is the only synchronization point: concurrent
    /// deliveries of the same event race on it and exactly one proceeds.
    /// Whatever happens afterwards, the entry ends in `processed` or
    /// `error` - never stranded in `processing`.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        // Stripe stamps `created` in epoch seconds; older replay tooling has
        // been seen sending millis, so normalize at the boundary.
        let event_created_at = matchday_shared::timestamp::from_epoch(event.created);

        let claim = self
            .ledger
            .claim(&event_id, &event_type, event_created_at)
            .await?;
        if !claim.should_process {
            // Duplicate delivery: acknowledge success so Stripe stops
            // retrying, without re-running side effects.
            return Ok(());
        }

        tracing::info!(
            event_type = %event_type,
            event_id = %event_id,
            "Processing Stripe webhook event (claimed exclusive processing rights)"
        );

        let result = self.process_event(&event).await;

        match &result {
            Ok(resolved_venue) => {
                self.ledger
                    .mark_processed(&event_id, *resolved_venue)
                    .await?;
            }
            Err(e) => {
                // Best effort: if this write also fails the entry stays in
                // `processing`, which blocks redelivery but never
                // double-applies effects.
                if let Err(write_err) = self.ledger.mark_error(&event_id, &e.to_string()).await {
                    tracing::error!(
                        event_id = %event_id,
                        error = %write_err,
                        "Failed to record processing error in ledger"
                    );
                }
            }
        }

        result.map(|_| ())
    }

    /// Normalize, resolve, transition, persist. Returns the resolved venue
    /// id (for the ledger's audit trail) or `None` when the event does not
    /// map to a venue.
    async fn process_event(&self, event: &Event) -> BillingResult<Option<Uuid>> {
        let normalized = self.normalize(event).await?;

        if let BillingEvent::Unrecognized { ref event_type } = normalized.event {
            tracing::info!(
                event_type = %event_type,
                event_id = %event.id,
                "Unhandled Stripe event type - acknowledging without action"
            );
            return Ok(None);
        }

        let Some(venue_id) = self.resolve_venue(&normalized).await? else {
            // A billing event for a venue we cannot identify is
            // un-actionable, not an error: acknowledge it so Stripe does
            // not retry forever.
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.type_,
                customer_id = ?normalized.customer_id,
                subscription_id = ?normalized.subscription_id,
                "Could not resolve venue for billing event - processing as no-op"
            );
            return Ok(None);
        };

        let Some(record) = self.store.fetch_by_venue(venue_id).await? else {
            tracing::warn!(
                event_id = %event.id,
                venue_id = %venue_id,
                "Billing event resolved to a venue that no longer exists"
            );
            return Ok(Some(venue_id));
        };

        let now = OffsetDateTime::now_utc();
        let transition = state_machine::transition(&normalized.event, &record, now);

        if let Some(write) = &transition.write {
            self.store.apply_state(venue_id, write).await?;
            tracing::info!(
                venue_id = %venue_id,
                event_id = %event.id,
                status = %write.billing_status,
                "Applied billing transition"
            );
        }

        // Post-commit effects. Each gets its own error boundary: the state
        // write above is already durable and must not be rolled back or
        // retried because a notification failed.
        if let Some((audit_type, data)) = transition.audit {
            let mut builder = BillingEventBuilder::new(venue_id, audit_type)
                .data(data)
                .stripe_event(event.id.to_string())
                .actor_type(ActorType::Stripe);
            if let Some(sub_id) = &normalized.subscription_id {
                builder = builder.stripe_subscription(sub_id.clone());
            }
            if let Err(e) = self.event_logger.log_event(builder).await {
                tracing::warn!(error = %e, "Failed to log billing audit event");
            }
        }

        for notification in &transition.notifications {
            self.send_notification(venue_id, notification).await;
        }

        Ok(Some(venue_id))
    }

    async fn send_notification(&self, venue_id: Uuid, notification: &Notification) {
        let (email, venue_name) = match self.store.owner_contact(venue_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                tracing::warn!(venue_id = %venue_id, "No owner contact for notification");
                return;
            }
            Err(e) => {
                tracing::error!(venue_id = %venue_id, error = %e, "Owner lookup failed");
                return;
            }
        };

        let result = match notification {
            Notification::PaymentFailed {
                amount_due_cents,
                invoice_url,
            } => {
                self.email
                    .send_payment_failed(
                        &email,
                        &venue_name,
                        *amount_due_cents,
                        invoice_url.as_deref(),
                    )
                    .await
            }
            Notification::SubscriptionCanceled => {
                self.email
                    .send_subscription_canceled(&email, &venue_name)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::error!(
                venue_id = %venue_id,
                error = %e,
                "Failed to send billing notification"
            );
        }
    }

    /// Reduce a Stripe event to the domain event plus resolution inputs.
    async fn normalize(&self, event: &Event) -> BillingResult<NormalizedEvent> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let session = match &event.data.object {
                    EventObject::CheckoutSession(session) => session,
                    _ => {
                        return Err(BillingError::WebhookEventNotSupported(
                            "Expected CheckoutSession".to_string(),
                        ))
                    }
                };

                let mut venue_hint = session
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get(VENUE_METADATA_KEY))
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .or_else(|| {
                        session
                            .client_reference_id
                            .as_deref()
                            .and_then(|id| Uuid::parse_str(id).ok())
                    });

                let customer_id = session.customer.as_ref().map(expandable_customer_id);
                let subscription_id = session.subscription.as_ref().map(expandable_subscription_id);

                // The session itself does not carry subscription health:
                // fetch the subscription to adopt its reported status (and
                // pick up the venue tag if the session lacked one).
                let mut subscription_status = None;
                if let Some(sub_id) = &subscription_id {
                    let parsed = sub_id.parse().map_err(|_| {
                        BillingError::StripeApi(format!("Invalid subscription ID: {}", sub_id))
                    })?;
                    let subscription =
                        stripe::Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;
                    subscription_status =
                        Some(BillingStatus::from_subscription_status(subscription.status));
                    if venue_hint.is_none() {
                        venue_hint = subscription
                            .metadata
                            .get(VENUE_METADATA_KEY)
                            .and_then(|id| Uuid::parse_str(id).ok());
                    }
                }

                Ok(NormalizedEvent {
                    venue_hint,
                    customer_id: customer_id.clone(),
                    subscription_id: subscription_id.clone(),
                    event: BillingEvent::CheckoutCompleted {
                        customer_id,
                        subscription_id,
                        subscription_status,
                    },
                })
            }

            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                Ok(NormalizedEvent {
                    venue_hint: None,
                    customer_id: invoice.customer.as_ref().map(expandable_customer_id),
                    subscription_id: invoice
                        .subscription
                        .as_ref()
                        .map(expandable_subscription_id),
                    event: BillingEvent::PaymentFailed {
                        amount_due_cents: invoice.amount_due,
                        invoice_url: invoice.hosted_invoice_url.clone(),
                    },
                })
            }

            EventType::InvoicePaid => {
                let invoice = extract_invoice(event)?;
                Ok(NormalizedEvent {
                    venue_hint: None,
                    customer_id: invoice.customer.as_ref().map(expandable_customer_id),
                    subscription_id: invoice
                        .subscription
                        .as_ref()
                        .map(expandable_subscription_id),
                    event: BillingEvent::PaymentSucceeded,
                })
            }

            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                Ok(NormalizedEvent {
                    venue_hint: subscription
                        .metadata
                        .get(VENUE_METADATA_KEY)
                        .and_then(|id| Uuid::parse_str(id).ok()),
                    customer_id: Some(expandable_customer_id(&subscription.customer)),
                    subscription_id: Some(subscription.id.to_string()),
                    event: BillingEvent::SubscriptionUpdated {
                        subscription_id: Some(subscription.id.to_string()),
                        status: BillingStatus::from_subscription_status(subscription.status),
                    },
                })
            }

            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                Ok(NormalizedEvent {
                    venue_hint: subscription
                        .metadata
                        .get(VENUE_METADATA_KEY)
                        .and_then(|id| Uuid::parse_str(id).ok()),
                    customer_id: Some(expandable_customer_id(&subscription.customer)),
                    subscription_id: Some(subscription.id.to_string()),
                    event: BillingEvent::SubscriptionDeleted,
                })
            }

            _ => Ok(NormalizedEvent {
                venue_hint: None,
                customer_id: None,
                subscription_id: None,
                event: BillingEvent::Unrecognized {
                    event_type: event.type_.to_string(),
                },
            }),
        }
    }

    /// Resolve the venue an event belongs to.
    ///
    /// Cheapest sources first: the id carried on the event, then our own
    /// stored provider ids, then a metadata fetch from Stripe (subscription
    /// before customer). `None` means the event is un-actionable.
    async fn resolve_venue(&self, normalized: &NormalizedEvent) -> BillingResult<Option<Uuid>> {
        if let Some(venue_id) = normalized.venue_hint {
            return Ok(Some(venue_id));
        }

        if let Some(sub_id) = &normalized.subscription_id {
            if let Some(venue_id) = self.store.find_by_subscription(sub_id).await? {
                return Ok(Some(venue_id));
            }
        }

        if let Some(customer_id) = &normalized.customer_id {
            if let Some(venue_id) = self.store.find_by_customer(customer_id).await? {
                return Ok(Some(venue_id));
            }
        }

        if let Some(sub_id) = &normalized.subscription_id {
            if let Ok(parsed) = sub_id.parse() {
                let subscription =
                    stripe::Subscription::retrieve(self.stripe.inner(), &parsed, &[]).await?;
                if let Some(venue_id) = subscription
                    .metadata
                    .get(VENUE_METADATA_KEY)
                    .and_then(|id| Uuid::parse_str(id).ok())
                {
                    return Ok(Some(venue_id));
                }
            }
        }

        if let Some(customer_id) = &normalized.customer_id {
            if let Ok(parsed) = customer_id.parse() {
                let customer =
                    stripe::Customer::retrieve(self.stripe.inner(), &parsed, &[]).await?;
                if let Some(venue_id) = customer
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get(VENUE_METADATA_KEY))
                    .and_then(|id| Uuid::parse_str(id).ok())
                {
                    return Ok(Some(venue_id));
                }
            }
        }

        Ok(None)
    }
}

fn extract_subscription(event: &Event) -> BillingResult<&stripe::Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<&stripe::Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}

fn expandable_subscription_id(subscription: &stripe::Expandable<stripe::Subscription>) -> String {
    match subscription {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(s) => s.id.to_string(),
    }
}
