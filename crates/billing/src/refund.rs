//! Refund processing
//!
//! Administrative refunds against completed transactions. The audit record
//! is written before the provider call, so a crash mid-refund leaves a
//! visible `pending` row to reconcile instead of silent money movement.
//! Refunding a transaction does not void its invoice; that is a separate,
//! explicit follow-up.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::store::{LedgerStore, TransactionRecord};

/// A refund audit row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefundRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub reason: String,
    pub status: String,
    pub stripe_refund_id: Option<String>,
    pub initiated_by: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// What a refund produced. `invoice_id` is the paid invoice backed by the
/// refunded transaction, handed back so the caller can decide whether to
/// void it.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund_record: RefundRecord,
    pub transaction: TransactionRecord,
    pub invoice_id: Option<Uuid>,
}

/// Prorate a full-period amount over the days left in the period. Rounds
/// down; the remainder stays with the merchant.
pub fn calculate_prorated_amount(amount_cents: i64, total_days: i64, remaining_days: i64) -> i64 {
    if total_days <= 0 || remaining_days <= 0 {
        return 0;
    }
    let remaining = remaining_days.min(total_days);
    amount_cents * remaining / total_days
}

/// Administrative refund service.
#[derive(Clone)]
pub struct RefundService {
    stripe: StripeClient,
    store: LedgerStore,
    event_logger: BillingEventLogger,
}

impl RefundService {
    pub fn new(stripe: StripeClient, store: LedgerStore) -> Self {
        let event_logger = BillingEventLogger::new(store.pool().clone());
        Self {
            stripe,
            store,
            event_logger,
        }
    }

    /// Refund a completed transaction, fully (`amount_cents: None`) or
    /// partially. A full refund moves the transaction to `refunded`; a
    /// partial refund leaves it `completed` with the refund visible in the
    /// audit trail.
    pub async fn refund_transaction(
        &self,
        transaction_id: Uuid,
        amount_cents: Option<i64>,
        reason: &str,
        initiated_by: Option<Uuid>,
    ) -> BillingResult<RefundOutcome> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;

        if !transaction.is_completed() {
            return Err(BillingError::InvalidInput(format!(
                "transaction {} has status '{}', only completed transactions can be refunded",
                transaction_id, transaction.status
            )));
        }

        let refund_amount = amount_cents.unwrap_or(transaction.amount_cents);
        if refund_amount <= 0 || refund_amount > transaction.amount_cents {
            return Err(BillingError::InvalidInput(format!(
                "refund amount {} out of range for transaction of {}",
                refund_amount, transaction.amount_cents
            )));
        }
        let full_refund = refund_amount == transaction.amount_cents;

        // Audit record first. If the provider call below fails or we crash,
        // this row is the evidence of an attempted refund.
        let record: RefundRecord = sqlx::query_as(
            r#"
            INSERT INTO refund_records (
                transaction_id, user_id, amount_cents, reason, status, initiated_by
            )
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING *
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.user_id)
        .bind(refund_amount)
        .bind(reason)
        .bind(initiated_by)
        .fetch_one(self.store.pool())
        .await?;

        let stripe_refund = match self
            .stripe
            .create_refund(
                &transaction.stripe_payment_intent_id,
                (!full_refund).then_some(refund_amount),
            )
            .await
        {
            Ok(refund) => refund,
            Err(e) => {
                self.mark_record(record.id, "failed", None).await?;
                tracing::error!(
                    transaction_id = %transaction.id,
                    refund_record_id = %record.id,
                    error = %e,
                    "Provider refund failed"
                );
                return Err(BillingError::RefundFailed(e.to_string()));
            }
        };

        let transaction = if full_refund {
            match self
                .store
                .refund_transaction_if_completed(transaction.id)
                .await?
            {
                Some(updated) => updated,
                // A concurrent refund won the compare-and-set; the provider
                // refund above is already recorded on this audit row.
                None => self
                    .store
                    .get_transaction(transaction.id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::TransactionNotFound(transaction.id.to_string())
                    })?,
            }
        } else {
            transaction
        };

        let record = self
            .mark_record(record.id, "completed", Some(stripe_refund.id.as_str()))
            .await?;

        let invoice_id = self
            .store
            .get_invoice_by_transaction(transaction.id)
            .await?
            .map(|i| i.id);

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(transaction.user_id, BillingEventType::RefundIssued)
                    .data(serde_json::json!({
                        "transaction_id": transaction.id,
                        "amount_cents": refund_amount,
                        "full_refund": full_refund,
                        "reason": reason,
                    }))
                    .stripe_object(stripe_refund.id.as_str())
                    .actor_type(ActorType::Admin),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log refund event");
        }

        tracing::info!(
            user_id = %transaction.user_id,
            transaction_id = %transaction.id,
            amount_cents = refund_amount,
            full_refund = full_refund,
            stripe_refund_id = %stripe_refund.id,
            "Refund issued"
        );

        Ok(RefundOutcome {
            refund_record: record,
            transaction,
            invoice_id,
        })
    }

    pub async fn get_refund_record(&self, id: Uuid) -> BillingResult<Option<RefundRecord>> {
        let record: Option<RefundRecord> =
            sqlx::query_as("SELECT * FROM refund_records WHERE id = $1")
                .bind(id)
                .fetch_optional(self.store.pool())
                .await?;

        Ok(record)
    }

    /// Pending rows older than an hour are refunds that died between the
    /// audit insert and the outcome update; they need manual reconciliation
    /// against the provider dashboard.
    pub async fn list_stuck_refunds(&self) -> BillingResult<Vec<RefundRecord>> {
        let records: Vec<RefundRecord> = sqlx::query_as(
            r#"
            SELECT * FROM refund_records
            WHERE status = 'pending' AND created_at < NOW() - INTERVAL '1 hour'
            ORDER BY created_at
            "#,
        )
        .fetch_all(self.store.pool())
        .await?;

        Ok(records)
    }

    async fn mark_record(
        &self,
        record_id: Uuid,
        status: &str,
        stripe_refund_id: Option<&str>,
    ) -> BillingResult<RefundRecord> {
        let record: RefundRecord = sqlx::query_as(
            r#"
            UPDATE refund_records
            SET status = $2, stripe_refund_id = COALESCE($3, stripe_refund_id),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(record_id)
        .bind(status)
        .bind(stripe_refund_id)
        .fetch_one(self.store.pool())
        .await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prorated_full_period_remaining() {
        assert_eq!(calculate_prorated_amount(3000, 30, 30), 3000);
    }

    #[test]
    fn test_prorated_half_period() {
        assert_eq!(calculate_prorated_amount(3000, 30, 15), 1500);
    }

    #[test]
    fn test_prorated_rounds_down() {
        // 1000 * 10 / 30 = 333.33 -> 333
        assert_eq!(calculate_prorated_amount(1000, 30, 10), 333);
    }

    #[test]
    fn test_prorated_nothing_remaining() {
        assert_eq!(calculate_prorated_amount(3000, 30, 0), 0);
        assert_eq!(calculate_prorated_amount(3000, 30, -3), 0);
    }

    #[test]
    fn test_prorated_clamps_excess_remaining() {
        assert_eq!(calculate_prorated_amount(3000, 30, 45), 3000);
    }

    #[test]
    fn test_prorated_degenerate_period() {
        assert_eq!(calculate_prorated_amount(3000, 0, 10), 0);
    }
}
