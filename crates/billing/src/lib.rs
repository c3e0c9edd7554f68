// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! LedgerPay Billing Core
//!
//! Reconciles subscription state between the internal ledger (Postgres) and
//! the payment provider (Stripe). The ledger is the source of truth for
//! what a user is entitled to; the provider is the source of truth for
//! whether money actually moved.
//!
//! ## Features
//!
//! - **Payments**: payment-intent and hosted-checkout flows, with a
//!   Transaction row mirroring every provider payment
//! - **Subscriptions**: pending / active / past_due / cancelled / expired
//!   lifecycle with a grace period for failed renewals
//! - **Invoices**: internal invoices with line items, issued atomically
//!   with the subscription change they bill for
//! - **Webhooks**: signature-verified ingestion with atomic per-event-id
//!   idempotency and safe redelivery
//! - **Refunds**: audit-first administrative refunds
//! - **Invariants**: runnable read-only consistency checks over the ledger

pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod invoices;
pub mod payments;
pub mod plans;
pub mod refund;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{parse_currency, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{period_line_items, validate_line_items, InvoiceService};

// Payments
pub use payments::{CheckoutInitiation, PaymentInitiation, PaymentService, VerifyOutcome};

// Plans
pub use plans::{Plan, PlanCatalog};

// Refund
pub use refund::{calculate_prorated_amount, RefundOutcome, RefundRecord, RefundService};

// Store
pub use store::{
    InvoiceLineItemRecord, InvoiceRecord, LedgerStore, NewInvoice, NewLineItem,
    SubscriptionRecord, TransactionRecord,
};

// Subscriptions
pub use subscriptions::{
    next_status, LifecycleConfig, LifecycleEvent, ProvisionOutcome, SubscriptionService,
};

// Webhooks
pub use webhooks::{verify_signature, WebhookAck, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality.
pub struct BillingService {
    pub store: LedgerStore,
    pub plans: PlanCatalog,
    pub payments: PaymentService,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub refund: RefundService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::build(stripe, pool, LifecycleConfig::from_env()))
    }

    /// Create a billing service with explicit config.
    pub fn new(config: StripeConfig, pool: PgPool, lifecycle: LifecycleConfig) -> Self {
        Self::build(StripeClient::new(config), pool, lifecycle)
    }

    fn build(stripe: StripeClient, pool: PgPool, lifecycle: LifecycleConfig) -> Self {
        let store = LedgerStore::new(pool.clone());
        let plans = PlanCatalog::new(pool.clone());
        let subscriptions = SubscriptionService::new(
            stripe.clone(),
            store.clone(),
            plans.clone(),
            lifecycle,
        );
        let payments = PaymentService::new(
            stripe.clone(),
            store.clone(),
            plans.clone(),
            subscriptions.clone(),
        );
        let webhooks = WebhookHandler::new(
            stripe.clone(),
            store.clone(),
            payments.clone(),
            subscriptions.clone(),
        );

        Self {
            invoices: InvoiceService::new(store.clone()),
            refund: RefundService::new(stripe, store.clone()),
            invariants: InvariantChecker::new(pool),
            store,
            plans,
            payments,
            subscriptions,
            webhooks,
        }
    }
}
