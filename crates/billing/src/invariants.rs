//! Ledger invariants
//!
//! Runnable consistency checks over the billing ledger. They can be run
//! after any mutation, webhook replay, or migration to confirm the system
//! is in a valid state.
//!
//! Each invariant is a real SQL query; checks only read, never write, and
//! violations carry enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::WEBHOOK_PROCESSING_TIMEOUT_MINUTES;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Users affected.
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be charging or provisioning incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateIntentRow {
    stripe_payment_intent_id: String,
    tx_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleBillableRow {
    user_id: Uuid,
    plan_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct LineSumMismatchRow {
    invoice_id: Uuid,
    user_id: Uuid,
    invoice_number: i64,
    amount_cents: i64,
    line_total: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnbackedActiveSubRow {
    sub_id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct BadPaidInvoiceRow {
    invoice_id: Uuid,
    user_id: Uuid,
    invoice_number: i64,
    transaction_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingTxRow {
    tx_id: Uuid,
    user_id: Uuid,
    stripe_payment_intent_id: String,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

/// Service for running ledger invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_unique_intent_per_transaction().await?);
        violations.extend(self.check_single_billable_subscription().await?);
        violations.extend(self.check_invoice_lines_sum().await?);
        violations.extend(self.check_active_subscription_backed().await?);
        violations.extend(self.check_paid_invoice_backed().await?);
        violations.extend(self.check_stale_pending_transactions().await?);
        violations.extend(self.check_stuck_webhook_events().await?);

        let checks_run = 7;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: a payment intent id maps to at most one transaction.
    ///
    /// The unique index enforces this going forward; the check catches rows
    /// predating the index or manual edits.
    async fn check_unique_intent_per_transaction(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateIntentRow> = sqlx::query_as(
            r#"
            SELECT stripe_payment_intent_id, COUNT(*) as tx_count
            FROM transactions
            GROUP BY stripe_payment_intent_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_intent_per_transaction".to_string(),
                user_ids: vec![],
                description: format!(
                    "Payment intent '{}' is recorded by {} transactions (expected 1)",
                    row.stripe_payment_intent_id, row.tx_count
                ),
                context: serde_json::json!({
                    "stripe_payment_intent_id": row.stripe_payment_intent_id,
                    "transaction_count": row.tx_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: at most one active or past_due subscription per
    /// (user, plan). More than one means double-billing.
    async fn check_single_billable_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleBillableRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'past_due')
            GROUP BY user_id, plan_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_billable_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} billable subscriptions for the same plan (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "plan_id": row.plan_id,
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: every invoice's line items sum to its total.
    async fn check_invoice_lines_sum(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LineSumMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                i.id as invoice_id,
                i.user_id,
                i.invoice_number,
                i.amount_cents,
                SUM(l.amount_cents) as line_total
            FROM invoices i
            LEFT JOIN invoice_line_items l ON l.invoice_id = i.id
            GROUP BY i.id, i.user_id, i.invoice_number, i.amount_cents
            HAVING COALESCE(SUM(l.amount_cents), 0) != i.amount_cents
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_lines_sum_to_total".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Invoice #{} totals {} cents but its lines sum to {}",
                    row.invoice_number,
                    row.amount_cents,
                    row.line_total.unwrap_or(0)
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "amount_cents": row.amount_cents,
                    "line_total": row.line_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: an active subscription is backed by at least one
    /// settled payment for its (user, plan).
    async fn check_active_subscription_backed(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnbackedActiveSubRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.user_id, s.plan_id
            FROM subscriptions s
            WHERE s.status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM transactions t
                  WHERE t.user_id = s.user_id
                    AND t.plan_id = s.plan_id
                    AND t.status IN ('completed', 'refunded')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_subscription_backed_by_payment".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription has no settled payment behind it".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "plan_id": row.plan_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: a paid invoice references a transaction that actually
    /// settled (completed, or completed-then-refunded).
    async fn check_paid_invoice_backed(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadPaidInvoiceRow> = sqlx::query_as(
            r#"
            SELECT
                i.id as invoice_id,
                i.user_id,
                i.invoice_number,
                t.status as transaction_status
            FROM invoices i
            JOIN transactions t ON t.id = i.transaction_id
            WHERE i.status = 'paid'
              AND t.status NOT IN ('completed', 'refunded')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_invoice_backed_by_settled_transaction".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Paid invoice #{} references a transaction with status '{}'",
                    row.invoice_number, row.transaction_status
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "transaction_status": row.transaction_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: pending transactions should settle or fail within days.
    /// Old pending rows mean lost webhooks and verify calls that never came.
    async fn check_stale_pending_transactions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingTxRow> = sqlx::query_as(
            r#"
            SELECT id as tx_id, user_id, stripe_payment_intent_id, created_at
            FROM transactions
            WHERE status = 'pending' AND created_at < NOW() - INTERVAL '7 days'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_transactions".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction pending since {}; verify against the provider",
                    row.created_at
                ),
                context: serde_json::json!({
                    "transaction_id": row.tx_id,
                    "stripe_payment_intent_id": row.stripe_payment_intent_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 7: no webhook event sits in `processing` past the claim
    /// timeout. Such rows indicate a worker crash mid-event.
    async fn check_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - ($1 || ' minutes')::INTERVAL
            "#,
        )
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event '{}' ({}) stuck in processing since {:?}",
                    row.stripe_event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_summary_serializes() {
        let summary = InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: 7,
            checks_passed: 7,
            checks_failed: 0,
            violations: vec![],
            healthy: true,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["healthy"], true);
        assert_eq!(json["checks_run"], 7);
    }
}
