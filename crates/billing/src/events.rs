//! Billing event audit log
//!
//! Append-only record of every billing-relevant mutation. Written alongside
//! the mutation itself; a failed audit write is logged and never aborts the
//! mutation it describes.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Who triggered a billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    Stripe,
    System,
    Admin,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Stripe => "stripe",
            ActorType::System => "system",
            ActorType::Admin => "admin",
        }
    }
}

/// Kinds of audit events this crate emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    PaymentInitiated,
    PaymentCompleted,
    PaymentFailed,
    CheckoutSessionCreated,
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionPastDue,
    SubscriptionCancelled,
    SubscriptionExpired,
    InvoiceVoided,
    RefundIssued,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::PaymentInitiated => "payment_initiated",
            BillingEventType::PaymentCompleted => "payment_completed",
            BillingEventType::PaymentFailed => "payment_failed",
            BillingEventType::CheckoutSessionCreated => "checkout_session_created",
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionActivated => "subscription_activated",
            BillingEventType::SubscriptionRenewed => "subscription_renewed",
            BillingEventType::SubscriptionPastDue => "subscription_past_due",
            BillingEventType::SubscriptionCancelled => "subscription_cancelled",
            BillingEventType::SubscriptionExpired => "subscription_expired",
            BillingEventType::InvoiceVoided => "invoice_voided",
            BillingEventType::RefundIssued => "refund_issued",
        }
    }
}

/// Builder for one audit row.
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    actor_type: ActorType,
    stripe_event_id: Option<String>,
    stripe_object_id: Option<String>,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            actor_type: ActorType::System,
            stripe_event_id: None,
            stripe_object_id: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }

    pub fn stripe_event(mut self, event_id: &str) -> Self {
        self.stripe_event_id = Some(event_id.to_string());
        self
    }

    /// Provider-side object this event concerns (intent, subscription,
    /// refund id).
    pub fn stripe_object(mut self, object_id: impl Into<String>) -> Self {
        self.stripe_object_id = Some(object_id.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Writes audit rows to `billing_events`.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                user_id, event_type, actor_type, stripe_event_id, stripe_object_id, data
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(event.stripe_event_id)
        .bind(event.stripe_object_id)
        .bind(event.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
