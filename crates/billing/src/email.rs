//! Billing email notifications
//!
//! Transactional templates sent at billing transitions: payment failed,
//! grace-period reminder, venue hidden, subscription canceled. Delivery goes
//! through the Resend HTTP API. Every caller treats sends as best-effort:
//! a delivery failure is logged by the caller and never blocks a billing
//! state write.

use std::sync::Arc;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Email configuration, read from the environment at startup.
///
/// When `RESEND_API_KEY` is absent the service still constructs; sends
/// become logged no-ops so local development works without credentials.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from_address: String,
    /// API endpoint. Overridable so tests can point at a local server.
    pub api_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Matchday <billing@matchday.app>".to_string()),
            api_url: RESEND_API_URL.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Service for sending billing-related emails
#[derive(Clone)]
pub struct BillingEmailService {
    client: reqwest::Client,
    config: Arc<EmailConfig>,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Payment failed: sent when an invoice payment fails and the venue
    /// enters (or continues) its grace period.
    pub async fn send_payment_failed(
        &self,
        to: &str,
        venue_name: &str,
        amount_due_cents: Option<i64>,
        invoice_url: Option<&str>,
    ) -> BillingResult<()> {
        let amount = amount_due_cents
            .map(|c| format!("${:.2}", c as f64 / 100.0))
            .unwrap_or_else(|| "your subscription fee".to_string());
        let pay_link = invoice_url
            .map(|url| format!(r#"<p><a href="{}">Pay the outstanding invoice</a></p>"#, url))
            .unwrap_or_default();

        let subject = format!("Payment failed for {}", venue_name);
        let html = format!(
            "<p>We couldn't collect {} for <strong>{}</strong>.</p>\
             <p>Your listing stays live for 14 days while you update your \
             payment details. After that it will be hidden from search and \
             the map until payment is resolved.</p>{}",
            amount, venue_name, pay_link
        );

        self.send(to, &subject, &html).await
    }

    /// Day-7 grace reminder: one per failure episode.
    pub async fn send_grace_reminder(
        &self,
        to: &str,
        venue_name: &str,
        deadline: OffsetDateTime,
    ) -> BillingResult<()> {
        let deadline_str = deadline
            .format(&Rfc3339)
            .unwrap_or_else(|_| "soon".to_string());

        let subject = format!("Reminder: {} will be hidden soon", venue_name);
        let html = format!(
            "<p>Payment for <strong>{}</strong> is still outstanding.</p>\
             <p>Unless payment is resolved, your listing will be hidden on \
             {}. Update your payment details to keep it live.</p>",
            venue_name, deadline_str
        );

        self.send(to, &subject, &html).await
    }

    /// Day-14 hide: the grace period has lapsed and the venue is now hidden.
    pub async fn send_venue_hidden(&self, to: &str, venue_name: &str) -> BillingResult<()> {
        let subject = format!("{} is now hidden", venue_name);
        let html = format!(
            "<p><strong>{}</strong> has been hidden from search and the map \
             because payment was not resolved within the grace period.</p>\
             <p>Settle the outstanding invoice and the listing can go live \
             again immediately.</p>",
            venue_name
        );

        self.send(to, &subject, &html).await
    }

    /// Subscription canceled: the venue was hidden and billing disabled.
    pub async fn send_subscription_canceled(
        &self,
        to: &str,
        venue_name: &str,
    ) -> BillingResult<()> {
        let subject = format!("Subscription canceled for {}", venue_name);
        let html = format!(
            "<p>The subscription for <strong>{}</strong> has been canceled \
             and the listing is no longer publicly visible.</p>\
             <p>You can re-subscribe at any time to bring it back.</p>",
            venue_name
        );

        self.send(to, &subject, &html).await
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(to = %to, subject = %subject, "Email disabled - skipping send");
            return Ok(());
        };

        let body = SendEmailRequest {
            from: &self.config.from_address,
            to: [to],
            subject,
            html,
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::EmailDelivery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::EmailDelivery(format!(
                "Resend returned {}: {}",
                status, detail
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Billing email sent");
        Ok(())
    }
}
