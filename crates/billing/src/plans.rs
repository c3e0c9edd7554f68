//! Plan catalog
//!
//! Read-only lookup of subscription plans. Plan CRUD lives in the admin
//! surface; the billing core only ever reads. Issued invoices copy the plan
//! price at issue time, so later administrative edits never rewrite them.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A subscription plan as priced at lookup time.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    /// ISO 4217 code, lowercase (e.g. "usd").
    pub currency: String,
    /// Length of one billing period.
    pub duration_days: i32,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

impl Plan {
    pub fn period(&self) -> time::Duration {
        time::Duration::days(i64::from(self.duration_days))
    }
}

/// Read-only plan lookup, passed explicitly into the payment orchestrator
/// and the lifecycle manager.
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, price_cents, currency, duration_days, active, created_at
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or(BillingError::PlanNotFound(plan_id))
    }

    /// Lookup for billing operations: inactive plans cannot be purchased or
    /// renewed against, only read.
    pub async fn get_active(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan = self.get(plan_id).await?;
        if !plan.active {
            return Err(BillingError::PlanInactive(plan_id));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan(duration_days: i32) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Pro".to_string(),
            price_cents: 2900,
            currency: "usd".to_string(),
            duration_days,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_plan_period() {
        assert_eq!(sample_plan(30).period(), time::Duration::days(30));
        assert_eq!(sample_plan(365).period(), time::Duration::days(365));
    }
}
