//! Subscription persistence.
//!
//! One row per (payment_provider, provider_subscription_id); upserts keep
//! period bounds and status current as vendor events arrive out of order.

use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PaymentResult;

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub subscription_no: String,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub status: String,
    pub payment_provider: String,
    pub provider_subscription_id: String,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub plan_name: Option<String>,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = "id, subscription_no, user_id, user_email, status, \
     payment_provider, provider_subscription_id, amount, currency, interval, \
     current_period_start, current_period_end, plan_name, canceled_at, created_at";

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscription_no: String,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub status: String,
    pub payment_provider: String,
    pub provider_subscription_id: String,
    pub subscription_result: Value,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub plan_name: Option<String>,
}

/// Insert or refresh the row for a provider subscription. The natural key
/// makes replayed checkout events converge on one row.
pub async fn upsert(
    executor: impl PgExecutor<'_>,
    sub: &NewSubscription,
) -> PaymentResult<Uuid> {
    let id = Uuid::new_v4();
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO subscriptions (
            id, subscription_no, user_id, user_email, status, payment_provider,
            provider_subscription_id, subscription_result, amount, currency,
            interval, current_period_start, current_period_end, plan_name
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (payment_provider, provider_subscription_id) DO UPDATE
        SET status = EXCLUDED.status,
            subscription_result = EXCLUDED.subscription_result,
            current_period_start = COALESCE(EXCLUDED.current_period_start, subscriptions.current_period_start),
            current_period_end = COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
            updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(&sub.subscription_no)
    .bind(sub.user_id)
    .bind(&sub.user_email)
    .bind(&sub.status)
    .bind(&sub.payment_provider)
    .bind(&sub.provider_subscription_id)
    .bind(&sub.subscription_result)
    .bind(sub.amount)
    .bind(&sub.currency)
    .bind(&sub.interval)
    .bind(sub.current_period_start)
    .bind(sub.current_period_end)
    .bind(&sub.plan_name)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}

/// Advance the billing period after a renewal charge.
pub async fn advance_period(
    executor: impl PgExecutor<'_>,
    provider: &str,
    provider_subscription_id: &str,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    subscription_result: &Value,
) -> PaymentResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'active',
            current_period_start = COALESCE($3, current_period_start),
            current_period_end = COALESCE($4, current_period_end),
            subscription_result = $5,
            updated_at = NOW()
        WHERE payment_provider = $1 AND provider_subscription_id = $2
        "#,
    )
    .bind(provider)
    .bind(provider_subscription_id)
    .bind(period_start)
    .bind(period_end)
    .bind(subscription_result)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Apply a vendor status change. Bare subscription events carry only the
/// provider-assigned id, so the update is keyed on that alone; the
/// cancellation timestamp is written once, when the status first moves
/// into canceled.
pub async fn update_status(
    executor: impl PgExecutor<'_>,
    provider_subscription_id: &str,
    status: &str,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    subscription_result: &Value,
) -> PaymentResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = $2,
            current_period_start = COALESCE($3, current_period_start),
            current_period_end = COALESCE($4, current_period_end),
            subscription_result = $5,
            canceled_at = CASE WHEN $2 = 'canceled' AND canceled_at IS NULL
                               THEN NOW() ELSE canceled_at END,
            updated_at = NOW()
        WHERE provider_subscription_id = $1
        "#,
    )
    .bind(provider_subscription_id)
    .bind(status)
    .bind(period_start)
    .bind(period_end)
    .bind(subscription_result)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        SubscriptionStore { pool }
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> PaymentResult<Vec<SubscriptionRow>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
