//! Subscription lifecycle management
//!
//! Owns the subscription state machine. Subscriptions are mutated only
//! through the transitions defined here; every transition runs under a
//! row lock inside a database transaction, together with the invoice it
//! emits, so either both persist or neither does.

use sqlx::{Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use ledgerpay_shared::SubscriptionStatus;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::InvoiceService;
use crate::plans::{Plan, PlanCatalog};
use crate::store::{InvoiceRecord, LedgerStore, SubscriptionRecord, TransactionRecord};

/// Inputs that drive the subscription state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A payment for this subscription was confirmed by the provider
    /// (first payment, renewal, or late recovery payment).
    PaymentConfirmed,
    /// The provider reported a failed renewal payment.
    RenewalFailed,
    /// The user asked to cancel.
    UserCancelled,
    /// The provider cancelled the subscription on its side.
    ProviderCancelled,
    /// The grace deadline elapsed without recovery.
    GraceElapsed,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::PaymentConfirmed => "payment_confirmed",
            LifecycleEvent::RenewalFailed => "renewal_failed",
            LifecycleEvent::UserCancelled => "user_cancelled",
            LifecycleEvent::ProviderCancelled => "provider_cancelled",
            LifecycleEvent::GraceElapsed => "grace_elapsed",
        }
    }
}

/// The transition table. `cancelled` and `expired` are terminal; any
/// pair not listed here is rejected.
pub fn next_status(
    current: SubscriptionStatus,
    event: LifecycleEvent,
) -> BillingResult<SubscriptionStatus> {
    use LifecycleEvent::*;
    use SubscriptionStatus::*;

    let next = match (current, event) {
        (Pending, PaymentConfirmed) => Active,
        // Renewal: same state, new paid-through date.
        (Active, PaymentConfirmed) => Active,
        (PastDue, PaymentConfirmed) => Active,

        (Active, RenewalFailed) => PastDue,

        (Active, UserCancelled) | (PastDue, UserCancelled) => Cancelled,

        (Active, ProviderCancelled) => Cancelled,
        (Pending, ProviderCancelled) | (PastDue, ProviderCancelled) => Expired,

        (Pending, GraceElapsed) | (PastDue, GraceElapsed) => Expired,

        (from, event) => {
            return Err(BillingError::InvalidTransition {
                from: from.as_str(),
                event: event.as_str(),
            })
        }
    };

    Ok(next)
}

/// Lifecycle policy knobs.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a past_due subscription may recover before expiring, and
    /// how long an unpaid pending subscription is kept open.
    pub grace_period: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::days(7),
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        let grace_days = std::env::var("GRACE_PERIOD_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(7);

        Self {
            grace_period: Duration::days(grace_days),
        }
    }
}

/// What provisioning from a confirmed payment produced.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub subscription: SubscriptionRecord,
    pub invoice: InvoiceRecord,
    /// False for a first activation, true for a renewal or recovery.
    pub renewed: bool,
    /// Audit row describing the transition. Not yet written: the caller
    /// logs it after its database transaction commits, so the audit log
    /// never records an activation that was rolled back.
    pub(crate) audit: BillingEventBuilder,
}

fn provision_event_type(renewed: bool) -> BillingEventType {
    if renewed {
        BillingEventType::SubscriptionRenewed
    } else {
        BillingEventType::SubscriptionActivated
    }
}

/// Subscription lifecycle manager.
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    store: LedgerStore,
    catalog: PlanCatalog,
    invoices: InvoiceService,
    event_logger: BillingEventLogger,
    config: LifecycleConfig,
}

impl SubscriptionService {
    pub fn new(
        stripe: StripeClient,
        store: LedgerStore,
        catalog: PlanCatalog,
        config: LifecycleConfig,
    ) -> Self {
        let invoices = InvoiceService::new(store.clone());
        let event_logger = BillingEventLogger::new(store.pool().clone());
        Self {
            stripe,
            store,
            catalog,
            invoices,
            event_logger,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Create a subscription awaiting its first payment.
    ///
    /// Rejected while the user already holds an active or past_due
    /// subscription for the same plan.
    pub async fn create_pending(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<SubscriptionRecord> {
        self.catalog.get_active(plan_id).await?;

        if self
            .store
            .find_billable_subscription(user_id, plan_id)
            .await?
            .is_some()
        {
            return Err(BillingError::DuplicateSubscription { user_id, plan_id });
        }

        let record = self
            .store
            .insert_subscription(
                self.store.pool(),
                user_id,
                plan_id,
                SubscriptionStatus::Pending,
                None,
                None,
            )
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated)
                    .data(serde_json::json!({ "plan_id": plan_id, "status": "pending" }))
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription created event");
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            subscription_id = %record.id,
            "Created pending subscription"
        );

        Ok(record)
    }

    /// Apply a confirmed payment inside the caller's database transaction:
    /// activate a pending subscription, create a fresh active one, extend
    /// an active one, or recover a past_due one. The paid invoice is issued
    /// in the same transaction.
    ///
    /// Callers reach this only after winning the transaction-completion
    /// compare-and-set, so it runs at most once per payment intent.
    pub async fn provision_or_renew(
        &self,
        db: &mut Transaction<'_, Postgres>,
        transaction: &TransactionRecord,
        plan: &Plan,
    ) -> BillingResult<ProvisionOutcome> {
        let now = OffsetDateTime::now_utc();
        let existing = self
            .store
            .lock_open_subscription_for_plan(db, transaction.user_id, transaction.plan_id)
            .await?;

        let (subscription, renewed) = match existing {
            None => {
                let created = self
                    .store
                    .insert_subscription(
                        &mut **db,
                        transaction.user_id,
                        transaction.plan_id,
                        SubscriptionStatus::Active,
                        Some(now),
                        Some(now + plan.period()),
                    )
                    .await?;
                (created, false)
            }
            Some(sub) => {
                let current = sub.parsed_status();
                next_status(current, LifecycleEvent::PaymentConfirmed)?;

                let (start, end, renewed) = match current {
                    SubscriptionStatus::Pending => (Some(now), Some(now + plan.period()), false),
                    // Renewal or late recovery: extend from the paid-through
                    // date so the purchased period is never shortened.
                    _ => {
                        let base = sub.end_date.unwrap_or(now);
                        (sub.start_date, Some(base + plan.period()), true)
                    }
                };

                let updated = self
                    .store
                    .update_subscription_state(
                        &mut **db,
                        sub.id,
                        SubscriptionStatus::Active,
                        start,
                        end,
                    )
                    .await?;
                (updated, renewed)
            }
        };

        let invoice = self
            .invoices
            .issue_paid(db, transaction, &subscription, plan)
            .await?;

        // The audit write goes through a second pool connection, so it must
        // not happen while this transaction still holds its row locks.
        let audit = BillingEventBuilder::new(
            transaction.user_id,
            provision_event_type(renewed),
        )
        .data(serde_json::json!({
            "subscription_id": subscription.id,
            "plan_id": plan.id,
            "end_date": subscription.end_date.map(|d| d.to_string()),
            "invoice_number": invoice.invoice_number,
        }))
        .stripe_object(transaction.stripe_payment_intent_id.clone())
        .actor_type(ActorType::Stripe);

        tracing::info!(
            user_id = %transaction.user_id,
            subscription_id = %subscription.id,
            renewed = renewed,
            end_date = ?subscription.end_date,
            "Subscription provisioned from confirmed payment"
        );

        Ok(ProvisionOutcome {
            subscription,
            invoice,
            renewed,
            audit,
        })
    }

    /// Write the audit row for a committed provisioning transition. Called
    /// by settle paths after their database transaction commits.
    pub(crate) async fn log_provision_event(&self, event: BillingEventBuilder) {
        if let Err(e) = self.event_logger.log_event(event).await {
            tracing::warn!(error = %e, "Failed to log provisioning event");
        }
    }

    /// User-initiated cancellation, effective immediately.
    ///
    /// Idempotent: cancelling an already-cancelled subscription returns it
    /// unchanged. The internal transition commits first; the provider-side
    /// cancellation is best-effort and only logged on failure.
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        requesting_user: Option<Uuid>,
    ) -> BillingResult<SubscriptionRecord> {
        let mut db = self.store.begin().await?;

        let sub = self
            .store
            .lock_subscription(&mut db, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        if let Some(user_id) = requesting_user {
            if sub.user_id != user_id {
                return Err(BillingError::NotSubscriptionOwner);
            }
        }

        if sub.parsed_status() == SubscriptionStatus::Cancelled {
            db.commit().await?;
            return Ok(sub);
        }

        let next = next_status(sub.parsed_status(), LifecycleEvent::UserCancelled)?;

        // End date stays as-is: no further renewal is attempted, but the
        // already-paid period is not shortened.
        let updated = self
            .store
            .update_subscription_state(&mut *db, sub.id, next, None, None)
            .await?;
        db.commit().await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(sub.user_id, BillingEventType::SubscriptionCancelled)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "previous_status": sub.status,
                    }))
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log cancellation event");
        }

        if let Some(external_id) = &updated.stripe_subscription_id {
            if let Err(e) = self.stripe.cancel_subscription(external_id).await {
                tracing::warn!(
                    subscription_id = %updated.id,
                    stripe_subscription_id = %external_id,
                    error = %e,
                    "Provider-side cancellation failed; internal state already cancelled"
                );
            }
        }

        tracing::info!(
            user_id = %updated.user_id,
            subscription_id = %updated.id,
            "Subscription cancelled"
        );

        Ok(updated)
    }

    /// Renewal-failure event from the provider: active -> past_due. The
    /// subscription stays usable until the grace deadline.
    pub async fn mark_past_due(&self, external_subscription_id: &str) -> BillingResult<()> {
        let mut db = self.store.begin().await?;

        let Some(sub) = self
            .store
            .lock_subscription_by_external_id(&mut db, external_subscription_id)
            .await?
        else {
            tracing::warn!(
                stripe_subscription_id = %external_subscription_id,
                "Renewal failure for unknown subscription"
            );
            return Ok(());
        };

        let current = sub.parsed_status();
        if current == SubscriptionStatus::PastDue {
            db.commit().await?;
            return Ok(());
        }

        match next_status(current, LifecycleEvent::RenewalFailed) {
            Ok(next) => {
                self.store
                    .update_subscription_state(&mut *db, sub.id, next, None, None)
                    .await?;
                db.commit().await?;

                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(
                            sub.user_id,
                            BillingEventType::SubscriptionPastDue,
                        )
                        .data(serde_json::json!({ "subscription_id": sub.id }))
                        .stripe_object(external_subscription_id)
                        .actor_type(ActorType::Stripe),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log past_due event");
                }

                tracing::warn!(
                    user_id = %sub.user_id,
                    subscription_id = %sub.id,
                    "Subscription past due after renewal failure"
                );
            }
            Err(_) => {
                // Stale failure event for a pending or terminal
                // subscription: acknowledge without a transition.
                tracing::info!(
                    subscription_id = %sub.id,
                    status = %sub.status,
                    "Ignoring renewal failure for non-active subscription"
                );
            }
        }

        Ok(())
    }

    /// Provider-side cancellation: the subscription was deleted at the
    /// provider with no recovery. An active subscription is treated like a
    /// user cancellation; pending and past_due ones expire.
    pub async fn record_provider_cancellation(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<()> {
        let mut db = self.store.begin().await?;

        let Some(sub) = self
            .store
            .lock_subscription_by_external_id(&mut db, external_subscription_id)
            .await?
        else {
            tracing::warn!(
                stripe_subscription_id = %external_subscription_id,
                "Provider cancellation for unknown subscription"
            );
            return Ok(());
        };

        let current = sub.parsed_status();
        if current.is_terminal() {
            db.commit().await?;
            return Ok(());
        }

        let next = next_status(current, LifecycleEvent::ProviderCancelled)?;
        self.store
            .update_subscription_state(&mut *db, sub.id, next, None, None)
            .await?;
        db.commit().await?;

        let event_type = match next {
            SubscriptionStatus::Expired => BillingEventType::SubscriptionExpired,
            _ => BillingEventType::SubscriptionCancelled,
        };
        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(sub.user_id, event_type)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "previous_status": sub.status,
                    }))
                    .stripe_object(external_subscription_id)
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log provider cancellation event");
        }

        tracing::info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            new_status = %next,
            "Provider-side cancellation applied"
        );

        Ok(())
    }

    /// Record the provider subscription id once known (checkout completion).
    pub async fn attach_external_id(
        &self,
        subscription_id: Uuid,
        external_id: &str,
    ) -> BillingResult<()> {
        self.store
            .attach_external_subscription_id(subscription_id, external_id)
            .await
    }

    /// Expire subscriptions whose grace deadline has elapsed. Run
    /// periodically by the worker.
    pub async fn expire_overdue(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let expired = self
            .store
            .expire_overdue_subscriptions(self.config.grace_period)
            .await?;

        for sub in &expired {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(sub.user_id, BillingEventType::SubscriptionExpired)
                        .data(serde_json::json!({
                            "subscription_id": sub.id,
                            "end_date": sub.end_date.map(|d| d.to_string()),
                        }))
                        .actor_type(ActorType::System),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log expiry event");
            }

            tracing::info!(
                user_id = %sub.user_id,
                subscription_id = %sub.id,
                "Subscription expired after grace deadline"
            );
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use LifecycleEvent::*;
    use SubscriptionStatus::*;

    #[test]
    fn test_first_payment_activates_pending() {
        assert_eq!(next_status(Pending, PaymentConfirmed).unwrap(), Active);
    }

    #[test]
    fn test_renewal_keeps_active() {
        assert_eq!(next_status(Active, PaymentConfirmed).unwrap(), Active);
    }

    #[test]
    fn test_late_payment_recovers_past_due() {
        assert_eq!(next_status(PastDue, PaymentConfirmed).unwrap(), Active);
    }

    #[test]
    fn test_renewal_failure_marks_past_due() {
        assert_eq!(next_status(Active, RenewalFailed).unwrap(), PastDue);
    }

    #[test]
    fn test_user_cancellation() {
        assert_eq!(next_status(Active, UserCancelled).unwrap(), Cancelled);
        assert_eq!(next_status(PastDue, UserCancelled).unwrap(), Cancelled);
    }

    #[test]
    fn test_grace_deadline_expiry() {
        assert_eq!(next_status(PastDue, GraceElapsed).unwrap(), Expired);
        assert_eq!(next_status(Pending, GraceElapsed).unwrap(), Expired);
    }

    #[test]
    fn test_provider_cancellation() {
        assert_eq!(next_status(Active, ProviderCancelled).unwrap(), Cancelled);
        assert_eq!(next_status(PastDue, ProviderCancelled).unwrap(), Expired);
        assert_eq!(next_status(Pending, ProviderCancelled).unwrap(), Expired);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [Cancelled, Expired] {
            for event in [
                PaymentConfirmed,
                RenewalFailed,
                UserCancelled,
                ProviderCancelled,
                GraceElapsed,
            ] {
                let err = next_status(terminal, event).unwrap_err();
                assert!(
                    matches!(err, BillingError::InvalidTransition { .. }),
                    "{terminal:?} must reject {event:?}"
                );
            }
        }
    }

    #[test]
    fn test_pending_rejects_renewal_failure_and_cancel() {
        assert!(next_status(Pending, RenewalFailed).is_err());
        assert!(next_status(Pending, UserCancelled).is_err());
    }

    #[test]
    fn test_past_due_rejects_repeat_renewal_failure() {
        assert!(next_status(PastDue, RenewalFailed).is_err());
    }

    #[test]
    fn test_lifecycle_config_default() {
        assert_eq!(LifecycleConfig::default().grace_period, Duration::days(7));
    }

    #[test]
    fn test_provision_event_type_split() {
        assert_eq!(
            provision_event_type(false),
            BillingEventType::SubscriptionActivated
        );
        assert_eq!(
            provision_event_type(true),
            BillingEventType::SubscriptionRenewed
        );
    }
}
