//! Stripe client wrapper
//!
//! The provider gateway: every outbound Stripe call goes through here with a
//! bounded timeout. On timeout the caller must leave its ledger state
//! untouched (a pending Transaction stays pending); the operation is
//! reconciled later by a verify call or a webhook delivery.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval, CreatePaymentIntent, CreateRefund,
    Currency, PaymentIntent, PaymentIntentId, Refund, Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from the environment.
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Upper bound on any single provider round trip.
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let timeout_secs = std::env::var("STRIPE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        Ok(Self {
            secret_key,
            webhook_secret,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Thin wrapper around the Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Raw client access for operations not wrapped here.
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    /// Create a payment intent for one plan period.
    ///
    /// `metadata` travels back to us on webhook events, so callers attach
    /// the user and plan ids here.
    pub async fn create_payment_intent(
        &self,
        amount_cents: i64,
        currency: Currency,
        payment_method_types: Vec<String>,
        metadata: HashMap<String, String>,
    ) -> BillingResult<PaymentIntent> {
        let mut params = CreatePaymentIntent::new(amount_cents, currency);
        params.payment_method_types = Some(payment_method_types);
        params.metadata = Some(metadata);

        self.bounded(PaymentIntent::create(&self.client, params))
            .await
    }

    /// Fetch the authoritative status of a payment intent.
    pub async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntent> {
        let id: PaymentIntentId = payment_intent_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("invalid payment intent id: {payment_intent_id}"))
        })?;

        self.bounded(PaymentIntent::retrieve(&self.client, &id, &[]))
            .await
    }

    /// Create a hosted checkout session for a recurring plan.
    ///
    /// Uses ad-hoc price data (our plan catalog is the source of truth for
    /// pricing, not Stripe price objects).
    pub async fn create_checkout_session(
        &self,
        plan_name: &str,
        amount_cents: i64,
        currency: Currency,
        duration_days: u32,
        success_url: &str,
        cancel_url: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<CheckoutSession> {
        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(success_url);
        params.cancel_url = Some(cancel_url);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: plan_name.to_string(),
                    ..Default::default()
                }),
                recurring: Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                    interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Day,
                    interval_count: Some(u64::from(duration_days)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        self.bounded(CheckoutSession::create(&self.client, params))
            .await
    }

    /// Refund a settled payment intent, fully or partially.
    pub async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
    ) -> BillingResult<Refund> {
        let id: PaymentIntentId = payment_intent_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("invalid payment intent id: {payment_intent_id}"))
        })?;

        let mut params = CreateRefund::new();
        params.payment_intent = Some(id);
        params.amount = amount_cents;

        self.bounded(Refund::create(&self.client, params)).await
    }

    /// Cancel the provider-side subscription. Best-effort from the caller's
    /// perspective: the internal transition has already committed.
    pub async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let id: SubscriptionId = external_subscription_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!(
                "invalid subscription id: {external_subscription_id}"
            ))
        })?;

        self.bounded(Subscription::cancel(
            &self.client,
            &id,
            CancelSubscription::default(),
        ))
        .await
    }

    /// Apply the configured timeout to a provider call.
    async fn bounded<T, F>(&self, fut: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BillingError::ProviderTimeout),
        }
    }
}

/// Parse an ISO currency code from the plan catalog into a Stripe currency.
pub fn parse_currency(code: &str) -> BillingResult<Currency> {
    code.to_lowercase()
        .parse::<Currency>()
        .map_err(|_| BillingError::InvalidInput(format!("unsupported currency: {code}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("usd").unwrap(), Currency::USD);
        assert_eq!(parse_currency("USD").unwrap(), Currency::USD);
        assert_eq!(parse_currency("eur").unwrap(), Currency::EUR);
        assert!(parse_currency("doubloons").is_err());
    }
}
