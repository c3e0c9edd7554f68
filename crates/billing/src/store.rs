//! Ledger store
//!
//! Row types and the atomic operations every mutation in this crate goes
//! through. Consistency rules:
//!
//! - Transaction state changes are single-statement compare-and-set
//!   (`UPDATE ... WHERE status = ... RETURNING ...`), keyed by the unique
//!   `stripe_payment_intent_id`. Concurrent verify calls and webhook
//!   deliveries for the same intent serialize here and converge.
//! - Subscription rows are locked `FOR UPDATE` inside a database
//!   transaction, so at most one lifecycle transition applies at a time.
//! - Webhook events are claimed with `INSERT ... ON CONFLICT ... DO UPDATE
//!   ... WHERE ... RETURNING`, so exactly one worker processes an event id.
//!
//! Methods that must compose into a larger atomic commit take a generic
//! `PgExecutor` so callers can pass either the pool or an open transaction.

use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use ledgerpay_shared::{InvoiceStatus, SubscriptionStatus, TransactionStatus, TransactionType};

use crate::error::BillingResult;

/// How long a webhook event may sit in `processing` before another delivery
/// is allowed to re-claim it (crash recovery).
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// A payment transaction row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub stripe_payment_intent_id: String,
    pub transaction_type: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TransactionRecord {
    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending.as_str()
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed.as_str()
    }

    pub fn is_renewal(&self) -> bool {
        self.transaction_type == TransactionType::Renewal.as_str()
    }
}

/// A subscription row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub status: String,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn parsed_status(&self) -> SubscriptionStatus {
        self.status
            .parse()
            .unwrap_or(SubscriptionStatus::Expired)
    }
}

/// An internally-issued invoice row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub transaction_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub invoice_number: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub voided_at: Option<OffsetDateTime>,
}

/// An invoice line item row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvoiceLineItemRecord {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

/// Fields for a new invoice; the number is assigned from the sequence at
/// insert time.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub transaction_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
}

/// One line on a new invoice.
#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub description: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

/// The ledger store. Cheap to clone; all state lives in Postgres.
#[derive(Clone)]
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> BillingResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Record a newly-initiated payment attempt as `pending`.
    ///
    /// The unique index on `stripe_payment_intent_id` makes the intent id
    /// the idempotency key: the same payment can never be recorded twice.
    pub async fn insert_pending_transaction(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        amount_cents: i64,
        currency: &str,
        payment_intent_id: &str,
        transaction_type: TransactionType,
    ) -> BillingResult<TransactionRecord> {
        let record: TransactionRecord = sqlx::query_as(
            r#"
            INSERT INTO transactions (
                user_id, plan_id, amount_cents, currency, status,
                stripe_payment_intent_id, transaction_type
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(payment_intent_id)
        .bind(transaction_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Record a provider-confirmed payment directly as `completed`
    /// (provider-billed cycles with no pending Transaction of ours).
    ///
    /// Returns `None` when the intent id is already in the ledger, in which
    /// case the caller must skip all side effects (duplicate delivery).
    pub async fn insert_completed_transaction<'e, E>(
        &self,
        exec: E,
        user_id: Uuid,
        plan_id: Uuid,
        amount_cents: i64,
        currency: &str,
        payment_intent_id: &str,
        transaction_type: TransactionType,
    ) -> BillingResult<Option<TransactionRecord>>
    where
        E: PgExecutor<'e>,
    {
        let record: Option<TransactionRecord> = sqlx::query_as(
            r#"
            INSERT INTO transactions (
                user_id, plan_id, amount_cents, currency, status,
                stripe_payment_intent_id, transaction_type
            )
            VALUES ($1, $2, $3, $4, 'completed', $5, $6)
            ON CONFLICT (stripe_payment_intent_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(amount_cents)
        .bind(currency)
        .bind(payment_intent_id)
        .bind(transaction_type.as_str())
        .fetch_optional(exec)
        .await?;

        Ok(record)
    }

    pub async fn get_transaction_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<TransactionRecord>> {
        let record: Option<TransactionRecord> =
            sqlx::query_as("SELECT * FROM transactions WHERE stripe_payment_intent_id = $1")
                .bind(payment_intent_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    pub async fn get_transaction(&self, id: Uuid) -> BillingResult<Option<TransactionRecord>> {
        let record: Option<TransactionRecord> =
            sqlx::query_as("SELECT * FROM transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Compare-and-set pending -> completed. Returns `None` if the
    /// transaction was not `pending` (a concurrent caller won the race, or
    /// it already failed); the caller then re-reads and returns the settled
    /// state without applying side effects.
    pub async fn complete_transaction_if_pending<'e, E>(
        &self,
        exec: E,
        payment_intent_id: &str,
    ) -> BillingResult<Option<TransactionRecord>>
    where
        E: PgExecutor<'e>,
    {
        let record: Option<TransactionRecord> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET status = 'completed', updated_at = NOW()
            WHERE stripe_payment_intent_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_intent_id)
        .fetch_optional(exec)
        .await?;

        Ok(record)
    }

    /// Compare-and-set pending -> failed (terminal provider decline).
    pub async fn fail_transaction_if_pending(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<TransactionRecord>> {
        let record: Option<TransactionRecord> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET status = 'failed', updated_at = NOW()
            WHERE stripe_payment_intent_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Compare-and-set completed -> refunded.
    pub async fn refund_transaction_if_completed(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<TransactionRecord>> {
        let record: Option<TransactionRecord> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET status = 'refunded', updated_at = NOW()
            WHERE id = $1 AND status = 'completed'
            RETURNING *
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Paginated read of a user's payment history, newest first. Read-only;
    /// not part of the consistency-critical path.
    pub async fn list_transactions_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<TransactionRecord>> {
        let records: Vec<TransactionRecord> = sqlx::query_as(
            r#"
            SELECT * FROM transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    pub async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Lock a subscription row for the duration of the enclosing database
    /// transaction. All lifecycle transitions go through this lock, which is
    /// what serializes transitions per subscription id.
    pub async fn lock_subscription(
        &self,
        db: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut **db)
                .await?;

        Ok(record)
    }

    /// Lock the user's non-terminal subscription for a plan, if any.
    /// Pending rows are included so a paid-for pending subscription can be
    /// activated in place.
    pub async fn lock_open_subscription_for_plan(
        &self,
        db: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND plan_id = $2
              AND status IN ('pending', 'active', 'past_due')
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .fetch_optional(&mut **db)
        .await?;

        Ok(record)
    }

    /// The at-most-one billable subscription per (user, plan) lookup.
    pub async fn find_billable_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND plan_id = $2 AND status IN ('active', 'past_due')
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Lock by the provider's subscription id (webhook paths).
    pub async fn lock_subscription_by_external_id(
        &self,
        db: &mut Transaction<'_, Postgres>,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE")
                .bind(external_id)
                .fetch_optional(&mut **db)
                .await?;

        Ok(record)
    }

    pub async fn insert_subscription<'e, E>(
        &self,
        exec: E,
        user_id: Uuid,
        plan_id: Uuid,
        status: SubscriptionStatus,
        start_date: Option<OffsetDateTime>,
        end_date: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord>
    where
        E: PgExecutor<'e>,
    {
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (user_id, plan_id, status, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(status.as_str())
        .bind(start_date)
        .bind(end_date)
        .fetch_one(exec)
        .await?;

        Ok(record)
    }

    pub async fn update_subscription_state<'e, E>(
        &self,
        exec: E,
        id: Uuid,
        status: SubscriptionStatus,
        start_date: Option<OffsetDateTime>,
        end_date: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord>
    where
        E: PgExecutor<'e>,
    {
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $2,
                start_date = COALESCE($3, start_date),
                end_date = COALESCE($4, end_date),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(start_date)
        .bind(end_date)
        .fetch_one(exec)
        .await?;

        Ok(record)
    }

    /// Store the provider subscription id once the provider confirms it.
    pub async fn attach_external_subscription_id(
        &self,
        id: Uuid,
        external_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET stripe_subscription_id = $2, updated_at = NOW()
            WHERE id = $1 AND stripe_subscription_id IS NULL
            "#,
        )
        .bind(id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sweep subscriptions whose grace deadline has elapsed into `expired`.
    ///
    /// past_due rows expire `grace` after their paid-through end date;
    /// pending rows that were never paid expire `grace` after creation.
    pub async fn expire_overdue_subscriptions(
        &self,
        grace: Duration,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let deadline_secs = grace.whole_seconds();
        let expired: Vec<SubscriptionRecord> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE (
                (status = 'past_due' AND end_date IS NOT NULL
                    AND end_date < NOW() - ($1 || ' seconds')::INTERVAL)
                OR
                (status = 'pending'
                    AND created_at < NOW() - ($1 || ' seconds')::INTERVAL)
            )
            RETURNING *
            "#,
        )
        .bind(deadline_secs)
        .fetch_all(&self.pool)
        .await?;

        Ok(expired)
    }

    pub async fn list_subscriptions_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records: Vec<SubscriptionRecord> = sqlx::query_as(
            "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ---------------------------------------------------------------------
    // Invoices
    // ---------------------------------------------------------------------

    /// Insert an invoice and its line items in the caller's transaction,
    /// assigning the next number from the issuing sequence.
    pub async fn insert_invoice_with_lines(
        &self,
        db: &mut Transaction<'_, Postgres>,
        invoice: NewInvoice,
        lines: &[NewLineItem],
    ) -> BillingResult<InvoiceRecord> {
        let invoice_number: i64 = sqlx::query_scalar("SELECT nextval('invoice_number_seq')")
            .fetch_one(&mut **db)
            .await?;

        let record: InvoiceRecord = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                user_id, subscription_id, transaction_id,
                amount_cents, currency, status, invoice_number
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(invoice.user_id)
        .bind(invoice.subscription_id)
        .bind(invoice.transaction_id)
        .bind(invoice.amount_cents)
        .bind(&invoice.currency)
        .bind(invoice.status.as_str())
        .bind(invoice_number)
        .fetch_one(&mut **db)
        .await?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (
                    invoice_id, description, quantity, unit_price_cents, amount_cents
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.id)
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price_cents)
            .bind(line.amount_cents)
            .execute(&mut **db)
            .await?;
        }

        Ok(record)
    }

    pub async fn get_invoice(&self, id: Uuid) -> BillingResult<Option<InvoiceRecord>> {
        let record: Option<InvoiceRecord> =
            sqlx::query_as("SELECT * FROM invoices WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    pub async fn get_invoice_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let record: Option<InvoiceRecord> =
            sqlx::query_as("SELECT * FROM invoices WHERE transaction_id = $1")
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    pub async fn get_invoice_lines(
        &self,
        invoice_id: Uuid,
    ) -> BillingResult<Vec<InvoiceLineItemRecord>> {
        let lines: Vec<InvoiceLineItemRecord> = sqlx::query_as(
            "SELECT * FROM invoice_line_items WHERE invoice_id = $1 ORDER BY created_at",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(lines)
    }

    /// Paginated read of a user's invoices, newest first.
    pub async fn list_invoices_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let records: Vec<InvoiceRecord> = sqlx::query_as(
            r#"
            SELECT * FROM invoices
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Compare-and-set paid -> void. Paid invoices are otherwise immutable.
    pub async fn void_invoice_if_paid(
        &self,
        invoice_id: Uuid,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let record: Option<InvoiceRecord> = sqlx::query_as(
            r#"
            UPDATE invoices
            SET status = 'void', voided_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'paid'
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    // ---------------------------------------------------------------------
    // Webhook dedupe ledger
    // ---------------------------------------------------------------------

    /// Atomically claim exclusive processing rights for a provider event id.
    ///
    /// The insert wins only when the id is new; the conflict arm re-claims
    /// rows that failed previously or have been stuck in `processing`
    /// longer than the timeout. A `success` row is never re-claimed, which
    /// is the at-most-once guarantee for side effects.
    pub async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    pub async fn webhook_event_status(&self, event_id: &str) -> BillingResult<Option<String>> {
        let status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status.map(|(s,)| s))
    }

    /// Record the outcome of a claimed event. Errors stay re-claimable on
    /// the next delivery; `success` permanently deduplicates.
    pub async fn mark_webhook_event(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Prune old fully-processed events from the dedupe ledger. Stripe does
    /// not redeliver events this old, so the rows only cost space.
    pub async fn delete_processed_webhook_events_older_than(
        &self,
        retain_days: i64,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE processing_result = 'success'
              AND processed_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(retain_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
