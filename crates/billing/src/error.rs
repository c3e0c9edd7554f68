//! Billing error types
//!
//! Every fallible operation in this crate returns [`BillingResult`]. The
//! variants map onto the public [`ErrorCode`] taxonomy via
//! [`BillingError::error_code`]; internal detail (SQL errors, Stripe error
//! bodies) is logged by callers and never surfaced to API clients.

use ledgerpay_shared::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("plan is not active: {0}")]
    PlanInactive(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transaction not found for payment intent: {0}")]
    TransactionNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("invoice not found: {0}")]
    InvoiceNotFound(Uuid),

    #[error("user {user_id} already has a billable subscription for plan {plan_id}")]
    DuplicateSubscription { user_id: Uuid, plan_id: Uuid },

    #[error("invalid lifecycle transition from '{from}' on '{event}'")]
    InvalidTransition { from: &'static str, event: &'static str },

    #[error("subscription does not belong to the requesting user")]
    NotSubscriptionOwner,

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("payment provider call timed out")]
    ProviderTimeout,

    #[error("refund failed: {0}")]
    RefundFailed(String),

    #[error("invoice line items sum to {line_total} but invoice total is {invoice_total}")]
    LineItemMismatch { line_total: i64, invoice_total: i64 },

    #[error("stripe error: {0}")]
    Stripe(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Map this error onto the public error-code taxonomy.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            BillingError::PlanNotFound(_)
            | BillingError::PlanInactive(_)
            | BillingError::InvalidInput(_)
            | BillingError::DuplicateSubscription { .. }
            | BillingError::InvalidTransition { .. }
            | BillingError::LineItemMismatch { .. } => ErrorCode::InvalidInput,

            BillingError::WebhookSignatureInvalid => ErrorCode::AuthenticationError,

            BillingError::NotSubscriptionOwner => ErrorCode::AuthorizationError,

            BillingError::TransactionNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::InvoiceNotFound(_) => ErrorCode::ResourceNotFound,

            BillingError::ProviderTimeout
            | BillingError::RefundFailed(_) => ErrorCode::PaymentProcessingError,

            BillingError::Stripe(_) => ErrorCode::StripeApiError,

            BillingError::Database(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => ErrorCode::InternalServerError,
        }
    }

    /// Transient errors are safe for the caller to retry; operations in this
    /// crate are idempotent per payment-intent / event id.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ProviderTimeout | BillingError::Database(_) | BillingError::Stripe(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Stripe(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            BillingError::PlanNotFound(Uuid::nil()).error_code(),
            ErrorCode::InvalidInput
        );
        assert_eq!(
            BillingError::WebhookSignatureInvalid.error_code(),
            ErrorCode::AuthenticationError
        );
        assert_eq!(
            BillingError::TransactionNotFound("pi_123".to_string()).error_code(),
            ErrorCode::ResourceNotFound
        );
        assert_eq!(
            BillingError::RefundFailed("charge disputed".to_string()).error_code(),
            ErrorCode::PaymentProcessingError
        );
        assert_eq!(
            BillingError::Stripe("rate limited".to_string()).error_code(),
            ErrorCode::StripeApiError
        );
        assert_eq!(
            BillingError::Internal("oops".to_string()).error_code(),
            ErrorCode::InternalServerError
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::ProviderTimeout.is_retryable());
        assert!(BillingError::Database("conn reset".to_string()).is_retryable());
        assert!(!BillingError::PlanInactive(Uuid::nil()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
    }
}
