//! Order persistence.
//!
//! Write paths are free functions over `PgExecutor` so the ledger can run
//! them inside its reconciliation transaction; `OrderStore` wraps the pool
//! for the read paths the API serves directly.

use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PaymentResult;
use crate::model::OrderStatus;

const ORDER_COLUMNS: &str = "id, order_no, user_id, user_email, status, amount, currency, \
     product_id, product_name, payment_type, payment_interval, payment_provider, \
     payment_session_id, transaction_id, checkout_url, paid_at, subscription_id, \
     credits_amount, credits_valid_days, plan_name, created_at";

#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub id: Uuid,
    pub order_no: String,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub payment_type: Option<String>,
    pub payment_interval: Option<String>,
    pub payment_provider: String,
    pub payment_session_id: Option<String>,
    pub transaction_id: Option<String>,
    pub checkout_url: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub subscription_id: Option<String>,
    pub credits_amount: Option<i64>,
    pub credits_valid_days: Option<i64>,
    pub plan_name: Option<String>,
    pub created_at: OffsetDateTime,
}

impl OrderRow {
    pub fn status(&self) -> PaymentResult<OrderStatus> {
        Ok(OrderStatus::parse(&self.status)?)
    }
}

/// Everything known about an order before the vendor session exists.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_no: String,
    pub user_id: Uuid,
    pub user_email: String,
    pub amount: i64,
    pub currency: String,
    pub product_id: Option<String>,
    pub product_name: String,
    pub payment_type: String,
    pub payment_interval: String,
    pub payment_provider: String,
    pub checkout_info: Value,
    pub credits_amount: i64,
    pub credits_valid_days: Option<i64>,
    pub plan_name: String,
}

pub async fn insert_pending(
    executor: impl PgExecutor<'_>,
    order: &NewOrder,
) -> PaymentResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, order_no, user_id, user_email, status, amount, currency,
            product_id, product_name, payment_type, payment_interval,
            payment_provider, checkout_info, credits_amount, credits_valid_days,
            plan_name
        )
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(id)
    .bind(&order.order_no)
    .bind(order.user_id)
    .bind(&order.user_email)
    .bind(order.amount)
    .bind(&order.currency)
    .bind(&order.product_id)
    .bind(&order.product_name)
    .bind(&order.payment_type)
    .bind(&order.payment_interval)
    .bind(&order.payment_provider)
    .bind(&order.checkout_info)
    .bind(order.credits_amount)
    .bind(order.credits_valid_days)
    .bind(&order.plan_name)
    .execute(executor)
    .await?;
    Ok(id)
}

/// The vendor session exists; move the order from pending to created.
pub async fn mark_created(
    executor: impl PgExecutor<'_>,
    order_no: &str,
    session_id: &str,
    checkout_url: &str,
    checkout_result: &Value,
) -> PaymentResult<()> {
    sqlx::query(
        r#"
        UPDATE orders
        SET status = 'created', payment_session_id = $2, checkout_url = $3,
            checkout_result = $4, updated_at = NOW()
        WHERE order_no = $1 AND status = 'pending'
        "#,
    )
    .bind(order_no)
    .bind(session_id)
    .bind(checkout_url)
    .bind(checkout_result)
    .execute(executor)
    .await?;
    Ok(())
}

/// Vendor session creation failed before a session existed; terminal.
pub async fn mark_completed(executor: impl PgExecutor<'_>, order_no: &str) -> PaymentResult<()> {
    sqlx::query(
        "UPDATE orders SET status = 'completed', updated_at = NOW() \
         WHERE order_no = $1 AND status = 'pending'",
    )
    .bind(order_no)
    .execute(executor)
    .await?;
    Ok(())
}

/// Settle the order as paid. Guarded so terminal states never move;
/// returns whether this call performed the transition.
#[allow(clippy::too_many_arguments)]
pub async fn mark_paid(
    executor: impl PgExecutor<'_>,
    order_no: &str,
    transaction_id: Option<&str>,
    payment_amount: Option<i64>,
    payment_currency: Option<&str>,
    payment_email: Option<&str>,
    paid_at: OffsetDateTime,
    payment_result: &Value,
    subscription_id: Option<&str>,
    subscription_result: Option<&Value>,
) -> PaymentResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE orders
        SET status = 'paid', transaction_id = COALESCE($2, transaction_id),
            payment_amount = $3, payment_currency = $4, payment_email = $5,
            paid_at = $6, payment_result = $7,
            subscription_id = COALESCE($8, subscription_id),
            subscription_result = COALESCE($9, subscription_result),
            updated_at = NOW()
        WHERE order_no = $1 AND status IN ('pending', 'created')
        "#,
    )
    .bind(order_no)
    .bind(transaction_id)
    .bind(payment_amount)
    .bind(payment_currency)
    .bind(payment_email)
    .bind(paid_at)
    .bind(payment_result)
    .bind(subscription_id)
    .bind(subscription_result)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_failed(
    executor: impl PgExecutor<'_>,
    order_no: &str,
    payment_result: &Value,
) -> PaymentResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE orders
        SET status = 'failed', payment_result = $2, updated_at = NOW()
        WHERE order_no = $1 AND status IN ('pending', 'created')
        "#,
    )
    .bind(order_no)
    .bind(payment_result)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Attach a provider transaction id to an already-settled order that was
/// paid without one. Leaves existing ids alone.
pub async fn attach_transaction(
    executor: impl PgExecutor<'_>,
    order_no: &str,
    transaction_id: &str,
) -> PaymentResult<bool> {
    let result = sqlx::query(
        "UPDATE orders SET transaction_id = $2, updated_at = NOW() \
         WHERE order_no = $1 AND transaction_id IS NULL",
    )
    .bind(order_no)
    .bind(transaction_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record a renewal charge as its own already-paid order. The unique index
/// on (payment_provider, transaction_id) makes duplicate deliveries lose.
#[allow(clippy::too_many_arguments)]
pub async fn insert_renewal(
    executor: impl PgExecutor<'_>,
    order_no: &str,
    origin: &OrderRow,
    transaction_id: &str,
    payment_amount: Option<i64>,
    payment_currency: Option<&str>,
    paid_at: OffsetDateTime,
    payment_result: &Value,
) -> PaymentResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, order_no, user_id, user_email, status, amount, currency,
            product_id, product_name, payment_type, payment_interval,
            payment_provider, transaction_id, checkout_info, payment_result,
            payment_amount, payment_currency, paid_at, subscription_id,
            credits_amount, credits_valid_days, plan_name
        )
        VALUES ($1, $2, $3, $4, 'paid', $5, $6, $7, $8, 'renew', $9, $10, $11,
                '{}'::jsonb, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(id)
    .bind(order_no)
    .bind(origin.user_id)
    .bind(&origin.user_email)
    .bind(payment_amount.unwrap_or(origin.amount))
    .bind(payment_currency.unwrap_or(&origin.currency))
    .bind(&origin.product_id)
    .bind(&origin.product_name)
    .bind(&origin.payment_interval)
    .bind(&origin.payment_provider)
    .bind(transaction_id)
    .bind(payment_result)
    .bind(payment_amount)
    .bind(payment_currency)
    .bind(paid_at)
    .bind(&origin.subscription_id)
    .bind(origin.credits_amount)
    .bind(origin.credits_valid_days)
    .bind(&origin.plan_name)
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn find_by_order_no(
    executor: impl PgExecutor<'_>,
    order_no: &str,
) -> PaymentResult<Option<OrderRow>> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1 AND deleted_at IS NULL"
    ))
    .bind(order_no)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

pub async fn find_by_provider_transaction(
    executor: impl PgExecutor<'_>,
    provider: &str,
    transaction_id: &str,
) -> PaymentResult<Option<OrderRow>> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders \
         WHERE payment_provider = $1 AND transaction_id = $2 AND deleted_at IS NULL"
    ))
    .bind(provider)
    .bind(transaction_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// The checkout order that opened a subscription. Renewals derive their
/// user, plan, and credit amounts from it.
pub async fn find_subscription_origin(
    executor: impl PgExecutor<'_>,
    provider: &str,
    provider_subscription_id: &str,
) -> PaymentResult<Option<OrderRow>> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders \
         WHERE payment_provider = $1 AND subscription_id = $2 \
           AND payment_type = 'subscription' AND deleted_at IS NULL \
         ORDER BY created_at ASC LIMIT 1"
    ))
    .bind(provider)
    .bind(provider_subscription_id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

#[derive(Clone)]
pub struct OrderStore {
    pool: PgPool,
}

impl OrderStore {
    pub fn new(pool: PgPool) -> Self {
        OrderStore { pool }
    }

    pub async fn list_for_user(&self, user_id: Uuid, limit: i64) -> PaymentResult<Vec<OrderRow>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
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
