//! Webhook ingestion
//!
//! Entry point for provider event deliveries. Each delivery is verified
//! against the signing secret, claimed atomically in the dedupe ledger, and
//! dispatched to the matching handler. Successful events are never
//! reprocessed; failed ones stay re-claimable so the provider's redelivery
//! can retry them safely.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::payments::{settle_provider_payment, settlement_type, PaymentService};
use crate::store::LedgerStore;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance, matching the provider's recommendation.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What a delivery amounted to. All variants acknowledge the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// Claimed and processed by this call.
    Processed,
    /// Already processed successfully by an earlier delivery.
    Duplicate,
    /// Another worker holds the processing claim right now.
    InFlight,
    /// An event type this service does not act on.
    Ignored,
}

/// Verify a provider webhook signature header against the raw payload.
///
/// The header carries `t=<unix-ts>,v1=<hex hmac>` pairs; the HMAC-SHA256 is
/// computed over `"{t}.{payload}"` with the signing secret (its `whsec_`
/// prefix is not part of the key). Any valid `v1` entry within the
/// timestamp tolerance passes. Verification runs on the raw request body,
/// before any JSON parsing.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signatures.push(kv[1]),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if v1_signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{timestamp}.{payload}");

    for candidate in v1_signatures {
        let Ok(decoded) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        if mac.verify_slice(&decoded).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::WebhookSignatureInvalid)
}

/// Webhook ingestion service.
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    store: LedgerStore,
    payments: PaymentService,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        store: LedgerStore,
        payments: PaymentService,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            stripe,
            store,
            payments,
            subscriptions,
        }
    }

    /// Verify a raw delivery and parse it into a provider event.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> BillingResult<Event> {
        verify_signature(
            payload,
            signature_header,
            &self.stripe.config().webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput(format!("malformed webhook payload: {e}"))
        })?;

        Ok(event)
    }

    /// Full ingestion path: verify, claim, dispatch, record the outcome.
    pub async fn handle_delivery(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookAck> {
        let event = self.verify_event(payload, signature_header)?;
        self.handle_event(event).await
    }

    /// Handle a verified event.
    ///
    /// The claim is atomic: only one concurrent delivery of an event id gets
    /// processing rights, and an id already marked `success` is never
    /// claimable again. Dispatch errors mark the row `error`, which the next
    /// redelivery may re-claim; no ledger side effects have committed in
    /// that case, so the retry is safe.
    pub async fn handle_event(&self, event: Event) -> BillingResult<WebhookAck> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed = self
            .store
            .claim_webhook_event(&event_id, &event_type_str, event_timestamp)
            .await?;

        if !claimed {
            let status = self.store.webhook_event_status(&event_id).await?;
            let ack = match status.as_deref() {
                Some("success") => WebhookAck::Duplicate,
                _ => WebhookAck::InFlight,
            };
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                status = ?status,
                "Webhook event not claimed"
            );
            return Ok(ack);
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type_str,
            "Processing webhook event"
        );

        let result = self.dispatch(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        // The audit row drives idempotency, so retry the update once.
        if let Err(e) = self
            .store
            .mark_webhook_event(&event_id, processing_result, error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to record webhook outcome failed, retrying"
            );
            if let Err(retry_err) = self
                .store
                .mark_webhook_event(&event_id, processing_result, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type_str,
                    processing_result = %processing_result,
                    retry_error = %retry_err,
                    "Failed to record webhook outcome after retry; \
                     event will be re-claimable after the processing timeout"
                );
            }
        }

        result
    }

    async fn dispatch(&self, event: &Event) -> BillingResult<WebhookAck> {
        match event.type_ {
            EventType::PaymentIntentSucceeded => {
                let intent = extract_payment_intent(event)?;
                self.payments
                    .confirm_from_provider(intent.id.as_str())
                    .await?;
                Ok(WebhookAck::Processed)
            }

            EventType::PaymentIntentPaymentFailed => {
                let intent = extract_payment_intent(event)?;
                let reason = intent
                    .last_payment_error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| "payment failed".to_string());
                self.payments
                    .fail_from_provider(intent.id.as_str(), &reason)
                    .await?;
                Ok(WebhookAck::Processed)
            }

            EventType::InvoicePaid => self.handle_invoice_paid(event).await,

            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                match invoice.subscription.as_ref() {
                    Some(sub) => {
                        self.subscriptions.mark_past_due(sub.id().as_str()).await?;
                        Ok(WebhookAck::Processed)
                    }
                    None => {
                        tracing::info!(
                            invoice_id = %invoice.id,
                            "Payment failure on invoice without a subscription"
                        );
                        Ok(WebhookAck::Ignored)
                    }
                }
            }

            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,

            EventType::CustomerSubscriptionDeleted => {
                let EventObject::Subscription(subscription) = &event.data.object else {
                    return Err(BillingError::InvalidInput(
                        "expected subscription object in event".to_string(),
                    ));
                };
                self.subscriptions
                    .record_provider_cancellation(subscription.id.as_str())
                    .await?;
                Ok(WebhookAck::Processed)
            }

            // Everything else is acknowledged without action so the
            // provider stops redelivering it.
            ref other => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %other,
                    "Ignoring unhandled webhook event type"
                );
                Ok(WebhookAck::Ignored)
            }
        }
    }

    /// A provider-billed cycle settled: record the completed renewal and
    /// extend the subscription, atomically.
    ///
    /// An unknown subscription id is an error rather than a no-op: the
    /// attach from `checkout.session.completed` may simply not have landed
    /// yet, and the error mark keeps this delivery re-claimable.
    async fn handle_invoice_paid(&self, event: &Event) -> BillingResult<WebhookAck> {
        let invoice = extract_invoice(event)?;

        let Some(external_id) = invoice.subscription.as_ref().map(|s| s.id().to_string()) else {
            tracing::info!(invoice_id = %invoice.id, "Paid invoice without a subscription");
            return Ok(WebhookAck::Ignored);
        };

        let mut db = self.store.begin().await?;

        let Some(sub) = self
            .store
            .lock_subscription_by_external_id(&mut db, &external_id)
            .await?
        else {
            return Err(BillingError::Internal(format!(
                "paid invoice {} references unknown subscription {}",
                invoice.id, external_id
            )));
        };

        let amount_cents = invoice.amount_paid.unwrap_or(0);
        let currency = invoice
            .currency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string());
        // The intent id keys the ledger row; invoices with no intent
        // (e.g. fully credited) fall back to the invoice id.
        let ledger_key = invoice
            .payment_intent
            .as_ref()
            .map(|p| p.id().to_string())
            .unwrap_or_else(|| invoice.id.to_string());

        // The locked row tells us what this payment is: a pending
        // subscription is buying its first cycle, anything else is renewing.
        let transaction_type = settlement_type(sub.parsed_status());

        let settled = settle_provider_payment(
            &self.payments,
            &mut db,
            sub.user_id,
            sub.plan_id,
            amount_cents,
            &currency,
            &ledger_key,
            transaction_type,
        )
        .await?;

        db.commit().await?;

        match settled {
            Some((transaction, provision)) => {
                self.subscriptions
                    .log_provision_event(provision.audit.clone().stripe_event(event.id.as_str()))
                    .await;
                tracing::info!(
                    user_id = %sub.user_id,
                    subscription_id = %sub.id,
                    amount_cents = amount_cents,
                    transaction_type = %transaction.transaction_type,
                    invoice_number = provision.invoice.invoice_number,
                    "Provider invoice settled"
                );
                Ok(WebhookAck::Processed)
            }
            None => {
                tracing::info!(
                    payment_intent_id = %ledger_key,
                    "Payment already in the ledger, skipping"
                );
                Ok(WebhookAck::Duplicate)
            }
        }
    }

    /// Checkout finished: link the provider subscription id to our pending
    /// row. Activation happens when the paid invoice for the first cycle
    /// arrives.
    async fn handle_checkout_completed(&self, event: &Event) -> BillingResult<WebhookAck> {
        let EventObject::CheckoutSession(session) = &event.data.object else {
            return Err(BillingError::InvalidInput(
                "expected checkout session object in event".to_string(),
            ));
        };

        let subscription_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("subscription_id"))
            .and_then(|v| v.parse::<uuid::Uuid>().ok());

        let external_id = session.subscription.as_ref().map(|s| s.id().to_string());

        match (subscription_id, external_id) {
            (Some(id), Some(external)) => {
                self.subscriptions.attach_external_id(id, &external).await?;
                tracing::info!(
                    subscription_id = %id,
                    stripe_subscription_id = %external,
                    session_id = %session.id,
                    "Linked checkout session to subscription"
                );
                Ok(WebhookAck::Processed)
            }
            _ => {
                tracing::warn!(
                    session_id = %session.id,
                    "Checkout session completed without linkable subscription metadata"
                );
                Ok(WebhookAck::Ignored)
            }
        }
    }
}

fn extract_payment_intent(event: &Event) -> BillingResult<&stripe::PaymentIntent> {
    match &event.data.object {
        EventObject::PaymentIntent(intent) => Ok(intent),
        _ => Err(BillingError::InvalidInput(
            "expected payment intent object in event".to_string(),
        )),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<&stripe::Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::InvalidInput(
            "expected invoice object in event".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SECRET: &str = "whsec_test_secret_key";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_passes() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now, SECRET);
        let header = format!("t={now},v1={sig}");
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_signature_within_tolerance() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now - 299, SECRET);
        let header = format!("t={},v1={}", now - 299, sig);
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = 1_700_000_000;
        let old = now - 301;
        let sig = sign(PAYLOAD, old, SECRET);
        let header = format!("t={old},v1={sig}");
        assert!(matches!(
            verify_signature(PAYLOAD, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let now = 1_700_000_000;
        let future = now + 301;
        let sig = sign(PAYLOAD, future, SECRET);
        let header = format!("t={future},v1={sig}");
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now, "whsec_other_key");
        let header = format!("t={now},v1={sig}");
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now, SECRET);
        let header = format!("t={now},v1={sig}");
        let tampered = r#"{"id":"evt_1","type":"payment_intent.payment_failed"}"#;
        assert!(verify_signature(tampered, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_missing_header_parts_rejected() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now, SECRET);
        assert!(verify_signature(PAYLOAD, &format!("v1={sig}"), SECRET, now).is_err());
        assert!(verify_signature(PAYLOAD, &format!("t={now}"), SECRET, now).is_err());
        assert!(verify_signature(PAYLOAD, "", SECRET, now).is_err());
        assert!(verify_signature(PAYLOAD, "garbage", SECRET, now).is_err());
    }

    #[test]
    fn test_any_matching_v1_entry_passes() {
        let now = 1_700_000_000;
        let good = sign(PAYLOAD, now, SECRET);
        let header = format!("t={now},v1=deadbeef,v1={good}");
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_secret_without_prefix_also_works() {
        let now = 1_700_000_000;
        let sig = sign(PAYLOAD, now, "test_secret_key");
        let header = format!("t={now},v1={sig}");
        // Key material is identical with or without the whsec_ prefix.
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
    }
}
