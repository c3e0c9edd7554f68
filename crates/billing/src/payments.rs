//! Payment orchestration
//!
//! Drives the payment-intent and hosted-checkout flows against the ledger.
//! Every provider payment is mirrored by exactly one Transaction row keyed
//! by the payment intent id; confirmation converges through a single
//! compare-and-set whether it arrives via an explicit verify call or a
//! webhook delivery, so side effects (activation, invoice) apply once.

use std::collections::HashMap;

use sqlx::{Postgres, Transaction};
use stripe::PaymentIntentStatus;
use uuid::Uuid;

use ledgerpay_shared::{SubscriptionStatus, TransactionType};

use crate::client::{parse_currency, StripeClient};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::plans::PlanCatalog;
use crate::store::{InvoiceRecord, LedgerStore, SubscriptionRecord, TransactionRecord};
use crate::subscriptions::{ProvisionOutcome, SubscriptionService};

/// What `process_payment` hands back to the caller: enough to finish the
/// payment client-side and to poll `verify_payment` afterwards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PaymentInitiation {
    pub transaction_id: Uuid,
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
}

/// A hosted checkout session ready for redirect.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutInitiation {
    pub session_id: String,
    pub url: Option<String>,
    pub subscription_id: Uuid,
}

/// The settled view of a payment after verification. `subscription` and
/// `invoice` are set only by the call that actually completed the
/// transaction; later idempotent calls return the transaction alone.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub transaction: TransactionRecord,
    pub subscription: Option<SubscriptionRecord>,
    pub invoice: Option<InvoiceRecord>,
}

/// Payment orchestrator.
#[derive(Clone)]
pub struct PaymentService {
    stripe: StripeClient,
    store: LedgerStore,
    catalog: PlanCatalog,
    subscriptions: SubscriptionService,
    event_logger: BillingEventLogger,
}

impl PaymentService {
    pub fn new(
        stripe: StripeClient,
        store: LedgerStore,
        catalog: PlanCatalog,
        subscriptions: SubscriptionService,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.pool().clone());
        Self {
            stripe,
            store,
            catalog,
            subscriptions,
            event_logger,
        }
    }

    /// Start a payment for one period of a plan.
    ///
    /// Creates the provider payment intent first, then records it as a
    /// pending Transaction. If recording fails after the intent was created,
    /// no money has moved; the orphaned intent simply expires provider-side.
    pub async fn process_payment(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        payment_method: &str,
    ) -> BillingResult<PaymentInitiation> {
        let plan = self.catalog.get_active(plan_id).await?;
        let currency = parse_currency(&plan.currency)?;

        if payment_method.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "payment method must not be empty".to_string(),
            ));
        }

        // A payment while a billable subscription exists is a renewal of
        // that subscription rather than a new one.
        let transaction_type = if self
            .store
            .find_billable_subscription(user_id, plan_id)
            .await?
            .is_some()
        {
            TransactionType::Renewal
        } else {
            TransactionType::Subscription
        };

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan_id".to_string(), plan_id.to_string());

        let intent = self
            .stripe
            .create_payment_intent(
                plan.price_cents,
                currency,
                vec![payment_method.to_string()],
                metadata,
            )
            .await?;

        let transaction = self
            .store
            .insert_pending_transaction(
                user_id,
                plan_id,
                plan.price_cents,
                &plan.currency,
                intent.id.as_str(),
                transaction_type,
            )
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PaymentInitiated)
                    .data(serde_json::json!({
                        "plan_id": plan_id,
                        "amount_cents": plan.price_cents,
                        "transaction_type": transaction_type.as_str(),
                    }))
                    .stripe_object(intent.id.as_str())
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log payment initiated event");
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            payment_intent_id = %intent.id,
            amount_cents = plan.price_cents,
            "Payment initiated"
        );

        Ok(PaymentInitiation {
            transaction_id: transaction.id,
            payment_intent_id: intent.id.to_string(),
            client_secret: intent.client_secret,
            amount_cents: plan.price_cents,
            currency: plan.currency,
        })
    }

    /// Reconcile a payment against the provider's authoritative state.
    ///
    /// Safe to call any number of times: a transaction that already settled
    /// is returned as-is without re-applying side effects. Only a caller
    /// that wins the pending -> completed compare-and-set provisions the
    /// subscription and issues the invoice.
    pub async fn verify_payment(&self, payment_intent_id: &str) -> BillingResult<VerifyOutcome> {
        let transaction = self
            .store
            .get_transaction_by_intent(payment_intent_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(payment_intent_id.to_string()))?;

        if !transaction.is_pending() {
            return Ok(VerifyOutcome {
                transaction,
                subscription: None,
                invoice: None,
            });
        }

        let intent = self.stripe.retrieve_payment_intent(payment_intent_id).await?;

        match intent.status {
            PaymentIntentStatus::Succeeded => self.settle_confirmed(payment_intent_id).await,
            // A declined attempt leaves the intent awaiting a new payment
            // method with the decline recorded; the polling path terminates
            // the transaction here instead of waiting for the webhook.
            status if intent_was_declined(status, intent.last_payment_error.is_some()) => {
                let reason = intent
                    .last_payment_error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| "payment declined".to_string());
                let failed = self
                    .store
                    .fail_transaction_if_pending(payment_intent_id)
                    .await?;
                let transaction = match failed {
                    Some(t) => {
                        self.log_payment_failed(&t, &reason).await;
                        t
                    }
                    None => self.reread(payment_intent_id).await?,
                };
                Ok(VerifyOutcome {
                    transaction,
                    subscription: None,
                    invoice: None,
                })
            }
            PaymentIntentStatus::Canceled => {
                let failed = self
                    .store
                    .fail_transaction_if_pending(payment_intent_id)
                    .await?;
                let transaction = match failed {
                    Some(t) => {
                        self.log_payment_failed(&t, "canceled").await;
                        t
                    }
                    // Lost the race to a concurrent settle; re-read.
                    None => self.reread(payment_intent_id).await?,
                };
                Ok(VerifyOutcome {
                    transaction,
                    subscription: None,
                    invoice: None,
                })
            }
            // Not settled provider-side yet; the transaction stays pending
            // and the caller retries or waits for the webhook.
            _ => {
                tracing::info!(
                    payment_intent_id = %payment_intent_id,
                    provider_status = ?intent.status,
                    "Payment not settled yet"
                );
                Ok(VerifyOutcome {
                    transaction,
                    subscription: None,
                    invoice: None,
                })
            }
        }
    }

    /// Webhook twin of the succeeded branch of [`verify_payment`]: the
    /// provider has already told us the intent succeeded, so no retrieve.
    ///
    /// Returns `None` when the transaction had already settled (duplicate
    /// delivery or a verify call that won the race).
    pub async fn confirm_from_provider(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<VerifyOutcome>> {
        let Some(transaction) = self.store.get_transaction_by_intent(payment_intent_id).await?
        else {
            tracing::warn!(
                payment_intent_id = %payment_intent_id,
                "Payment confirmation for unknown transaction"
            );
            return Ok(None);
        };

        if !transaction.is_pending() {
            return Ok(None);
        }

        Ok(Some(self.settle_confirmed(payment_intent_id).await?))
    }

    /// Webhook path for a terminal provider decline.
    pub async fn fail_from_provider(
        &self,
        payment_intent_id: &str,
        reason: &str,
    ) -> BillingResult<()> {
        match self
            .store
            .fail_transaction_if_pending(payment_intent_id)
            .await?
        {
            Some(transaction) => {
                self.log_payment_failed(&transaction, reason).await;
                tracing::warn!(
                    user_id = %transaction.user_id,
                    payment_intent_id = %payment_intent_id,
                    reason = %reason,
                    "Payment failed"
                );
            }
            None => {
                tracing::info!(
                    payment_intent_id = %payment_intent_id,
                    "Failure event for already-settled or unknown transaction"
                );
            }
        }

        Ok(())
    }

    /// Start a hosted checkout for a plan. A pending subscription is created
    /// up front so the completion webhook has a row to activate and to
    /// attach the provider subscription id to. No Transaction is recorded
    /// until the provider confirms payment.
    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutInitiation> {
        let plan = self.catalog.get_active(plan_id).await?;
        let currency = parse_currency(&plan.currency)?;

        let subscription = self.subscriptions.create_pending(user_id, plan_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan_id".to_string(), plan_id.to_string());
        metadata.insert("subscription_id".to_string(), subscription.id.to_string());

        let duration_days = u32::try_from(plan.duration_days)
            .map_err(|_| BillingError::InvalidInput("plan duration out of range".to_string()))?;

        let session = self
            .stripe
            .create_checkout_session(
                &plan.name,
                plan.price_cents,
                currency,
                duration_days,
                success_url,
                cancel_url,
                metadata,
            )
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::CheckoutSessionCreated)
                    .data(serde_json::json!({
                        "plan_id": plan_id,
                        "subscription_id": subscription.id,
                    }))
                    .stripe_object(session.id.as_str())
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log checkout session event");
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            session_id = %session.id,
            "Checkout session created"
        );

        Ok(CheckoutInitiation {
            session_id: session.id.to_string(),
            url: session.url,
            subscription_id: subscription.id,
        })
    }

    /// Complete a confirmed payment: win the compare-and-set, provision the
    /// subscription and issue the invoice in one database transaction.
    async fn settle_confirmed(&self, payment_intent_id: &str) -> BillingResult<VerifyOutcome> {
        let mut db = self.store.begin().await?;

        let Some(completed) = self
            .store
            .complete_transaction_if_pending(&mut *db, payment_intent_id)
            .await?
        else {
            // A concurrent caller settled it first.
            db.rollback().await?;
            let transaction = self.reread(payment_intent_id).await?;
            return Ok(VerifyOutcome {
                transaction,
                subscription: None,
                invoice: None,
            });
        };

        // Inactive plans can still settle payments already made against them.
        let plan = self.catalog.get(completed.plan_id).await?;
        let outcome = self
            .subscriptions
            .provision_or_renew(&mut db, &completed, &plan)
            .await?;

        db.commit().await?;

        self.subscriptions
            .log_provision_event(outcome.audit.clone())
            .await;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(completed.user_id, BillingEventType::PaymentCompleted)
                    .data(serde_json::json!({
                        "transaction_id": completed.id,
                        "amount_cents": completed.amount_cents,
                        "subscription_id": outcome.subscription.id,
                    }))
                    .stripe_object(payment_intent_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log payment completed event");
        }

        tracing::info!(
            user_id = %completed.user_id,
            payment_intent_id = %payment_intent_id,
            subscription_id = %outcome.subscription.id,
            invoice_number = outcome.invoice.invoice_number,
            "Payment completed and subscription provisioned"
        );

        Ok(VerifyOutcome {
            transaction: completed,
            subscription: Some(outcome.subscription),
            invoice: Some(outcome.invoice),
        })
    }

    async fn reread(&self, payment_intent_id: &str) -> BillingResult<TransactionRecord> {
        self.store
            .get_transaction_by_intent(payment_intent_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(payment_intent_id.to_string()))
    }

    async fn log_payment_failed(&self, transaction: &TransactionRecord, reason: &str) {
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(transaction.user_id, BillingEventType::PaymentFailed)
                    .data(serde_json::json!({
                        "transaction_id": transaction.id,
                        "reason": reason,
                    }))
                    .stripe_object(transaction.stripe_payment_intent_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log payment failed event");
        }
    }

    /// Shared access for webhook handling.
    pub(crate) fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub(crate) fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }
}

/// What kind of payment a provider-billed invoice settles: the first cycle
/// of a pending subscription is the subscription purchase itself; every
/// later cycle is a renewal.
pub(crate) fn settlement_type(subscription_status: SubscriptionStatus) -> TransactionType {
    match subscription_status {
        SubscriptionStatus::Pending => TransactionType::Subscription,
        _ => TransactionType::Renewal,
    }
}

/// Whether a non-succeeded intent represents a terminal card decline the
/// polling path should fail the transaction for. A declined attempt parks
/// the intent in `requires_payment_method` with the error attached.
pub(crate) fn intent_was_declined(status: PaymentIntentStatus, has_payment_error: bool) -> bool {
    matches!(status, PaymentIntentStatus::RequiresPaymentMethod) && has_payment_error
}

/// Helper used by webhook invoice handling: settle a provider-confirmed
/// payment that has no pending Transaction (provider-initiated billing
/// cycles, including the first cycle of a checkout subscription). Inserts
/// the completed Transaction and provisions inside the caller's database
/// transaction; a duplicate intent id makes the whole call a no-op.
///
/// The returned [`ProvisionOutcome`] carries the audit event the caller
/// logs once it commits.
pub(crate) async fn settle_provider_payment(
    payments: &PaymentService,
    db: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    plan_id: Uuid,
    amount_cents: i64,
    currency: &str,
    payment_intent_id: &str,
    transaction_type: TransactionType,
) -> BillingResult<Option<(TransactionRecord, ProvisionOutcome)>> {
    let Some(transaction) = payments
        .store()
        .insert_completed_transaction(
            &mut **db,
            user_id,
            plan_id,
            amount_cents,
            currency,
            payment_intent_id,
            transaction_type,
        )
        .await?
    else {
        return Ok(None);
    };

    let plan = payments.catalog().get(plan_id).await?;
    let outcome = payments
        .subscriptions()
        .provision_or_renew(db, &transaction, &plan)
        .await?;

    Ok(Some((transaction, outcome)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_checkout_cycle_settles_as_subscription() {
        assert_eq!(
            settlement_type(SubscriptionStatus::Pending),
            TransactionType::Subscription
        );
    }

    #[test]
    fn test_later_cycles_settle_as_renewals() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(settlement_type(status), TransactionType::Renewal);
        }
    }

    #[test]
    fn test_decline_detection() {
        assert!(intent_was_declined(
            PaymentIntentStatus::RequiresPaymentMethod,
            true
        ));
        // A fresh intent awaiting its first attempt is not a decline.
        assert!(!intent_was_declined(
            PaymentIntentStatus::RequiresPaymentMethod,
            false
        ));
        assert!(!intent_was_declined(PaymentIntentStatus::Processing, true));
        assert!(!intent_was_declined(PaymentIntentStatus::Succeeded, false));
    }
}
