//! Invoice issuing
//!
//! Invoices are written by the lifecycle manager when a subscription-type
//! transaction completes, in the same database transaction as the
//! subscription change. Amounts are copied from the completed transaction,
//! not re-read from the plan, so later plan edits never alter issued
//! invoices. A paid invoice is immutable except the explicit paid -> void
//! transition.

use ledgerpay_shared::InvoiceStatus;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::plans::Plan;
use crate::store::{
    InvoiceRecord, LedgerStore, NewInvoice, NewLineItem, SubscriptionRecord, TransactionRecord,
};

/// Build the line items for one paid plan period.
pub fn period_line_items(plan: &Plan, amount_cents: i64) -> Vec<NewLineItem> {
    vec![NewLineItem {
        description: format!("{} subscription ({} days)", plan.name, plan.duration_days),
        quantity: 1,
        unit_price_cents: amount_cents,
        amount_cents,
    }]
}

/// Line-item sums must equal the invoice total; checked before every insert.
pub fn validate_line_items(lines: &[NewLineItem], invoice_total: i64) -> BillingResult<()> {
    let line_total: i64 = lines.iter().map(|l| l.amount_cents).sum();
    if line_total != invoice_total {
        return Err(BillingError::LineItemMismatch {
            line_total,
            invoice_total,
        });
    }
    Ok(())
}

/// Service for issuing and voiding internal invoices.
#[derive(Clone)]
pub struct InvoiceService {
    store: LedgerStore,
    event_logger: BillingEventLogger,
}

impl InvoiceService {
    pub fn new(store: LedgerStore) -> Self {
        let event_logger = BillingEventLogger::new(store.pool().clone());
        Self {
            store,
            event_logger,
        }
    }

    /// Issue the paid invoice for a completed transaction, inside the
    /// caller's database transaction (the one also carrying the
    /// subscription change).
    pub async fn issue_paid(
        &self,
        db: &mut Transaction<'_, Postgres>,
        transaction: &TransactionRecord,
        subscription: &SubscriptionRecord,
        plan: &Plan,
    ) -> BillingResult<InvoiceRecord> {
        let lines = period_line_items(plan, transaction.amount_cents);
        validate_line_items(&lines, transaction.amount_cents)?;

        let invoice = self
            .store
            .insert_invoice_with_lines(
                db,
                NewInvoice {
                    user_id: transaction.user_id,
                    subscription_id: subscription.id,
                    transaction_id: transaction.id,
                    amount_cents: transaction.amount_cents,
                    currency: transaction.currency.clone(),
                    status: InvoiceStatus::Paid,
                },
                &lines,
            )
            .await?;

        tracing::info!(
            user_id = %transaction.user_id,
            invoice_id = %invoice.id,
            invoice_number = invoice.invoice_number,
            amount_cents = invoice.amount_cents,
            "Issued paid invoice"
        );

        Ok(invoice)
    }

    /// Explicit administrative void of a paid invoice (e.g. after a refund).
    ///
    /// Refunding a transaction does not void its invoice implicitly; this is
    /// the separate follow-up operation. Idempotent: voiding an
    /// already-void invoice returns it unchanged.
    pub async fn void_invoice(&self, invoice_id: Uuid) -> BillingResult<InvoiceRecord> {
        if let Some(voided) = self.store.void_invoice_if_paid(invoice_id).await? {
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(voided.user_id, BillingEventType::InvoiceVoided)
                        .data(serde_json::json!({
                            "invoice_number": voided.invoice_number,
                            "amount_cents": voided.amount_cents,
                        }))
                        .actor_type(ActorType::Admin),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log invoice voided event");
            }

            tracing::info!(
                invoice_id = %voided.id,
                invoice_number = voided.invoice_number,
                "Invoice voided"
            );
            return Ok(voided);
        }

        // Not paid: either already void (fine) or not voidable.
        let existing = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        if existing.status == InvoiceStatus::Void.as_str() {
            return Ok(existing);
        }

        Err(BillingError::InvalidInput(format!(
            "invoice {} has status '{}', only paid invoices can be voided",
            invoice_id, existing.status
        )))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use time::OffsetDateTime;

    fn sample_plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Pro".to_string(),
            price_cents: 2900,
            currency: "usd".to_string(),
            duration_days: 30,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_period_line_items_sum_to_amount() {
        let plan = sample_plan();
        let lines = period_line_items(&plan, 2900);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 1);
        assert_eq!(lines[0].unit_price_cents, 2900);
        assert!(validate_line_items(&lines, 2900).is_ok());
    }

    #[test]
    fn test_line_items_describe_the_period() {
        let plan = sample_plan();
        let lines = period_line_items(&plan, 2900);
        assert_eq!(lines[0].description, "Pro subscription (30 days)");
    }

    #[test]
    fn test_validate_line_items_rejects_mismatch() {
        let lines = vec![
            NewLineItem {
                description: "a".to_string(),
                quantity: 1,
                unit_price_cents: 100,
                amount_cents: 100,
            },
            NewLineItem {
                description: "b".to_string(),
                quantity: 2,
                unit_price_cents: 50,
                amount_cents: 100,
            },
        ];
        assert!(validate_line_items(&lines, 200).is_ok());

        let err = validate_line_items(&lines, 250).unwrap_err();
        match err {
            BillingError::LineItemMismatch {
                line_total,
                invoice_total,
            } => {
                assert_eq!(line_total, 200);
                assert_eq!(invoice_total, 250);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_empty_lines_only_for_zero_total() {
        assert!(validate_line_items(&[], 0).is_ok());
        assert!(validate_line_items(&[], 100).is_err());
    }
}
