//! Prepaid credit ledger.
//!
//! Every row is append-only: grants carry a positive signed amount,
//! consumption writes a negative row with the post-consumption balance
//! snapshot, and the spendable balance is the signed sum of active,
//! unexpired rows. A partial unique index on (order_no) for grants keeps a
//! replayed payment event from granting twice.

use std::sync::Arc;

use serde_json::json;
use sqlx::postgres::PgExecutor;
use sqlx::{FromRow, PgPool};
use time::{Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use shipkit_shared::SnowflakeGenerator;

use crate::error::{PaymentError, PaymentResult};

pub const SCENE_PAYMENT: &str = "payment";
pub const SCENE_SUBSCRIPTION: &str = "subscription";

#[derive(Debug, Clone, FromRow)]
pub struct CreditRow {
    pub id: Uuid,
    pub transaction_no: String,
    pub user_id: Uuid,
    pub order_no: Option<String>,
    pub transaction_type: String,
    pub transaction_scene: Option<String>,
    pub credits: i64,
    pub remaining_credits: i64,
    pub expires_at: Option<OffsetDateTime>,
    pub status: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewGrant {
    pub transaction_no: String,
    pub user_id: Uuid,
    pub user_email: Option<String>,
    pub order_no: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub scene: &'static str,
    pub credits: i64,
    pub expires_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}

/// When purchased credits expire.
///
/// A subscription's period end wins over the plan's valid-days window, so
/// subscription credits always lapse with the cycle that bought them.
pub fn calculate_expiration(
    paid_at: OffsetDateTime,
    valid_days: Option<i64>,
    subscription_period_end: Option<OffsetDateTime>,
) -> Option<OffsetDateTime> {
    if let Some(period_end) = subscription_period_end {
        return Some(period_end);
    }
    valid_days.map(|days| paid_at + Duration::days(days))
}

pub async fn insert_grant(executor: impl PgExecutor<'_>, grant: &NewGrant) -> PaymentResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO credits (
            id, transaction_no, user_id, user_email, order_no,
            provider_subscription_id, transaction_type, transaction_scene,
            credits, remaining_credits, description, expires_at, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'grant', $7, $8, $8, $9, $10, 'active')
        "#,
    )
    .bind(id)
    .bind(&grant.transaction_no)
    .bind(grant.user_id)
    .bind(&grant.user_email)
    .bind(&grant.order_no)
    .bind(&grant.provider_subscription_id)
    .bind(grant.scene)
    .bind(grant.credits)
    .bind(&grant.description)
    .bind(grant.expires_at)
    .execute(executor)
    .await?;
    Ok(id)
}

/// Whether an order has already produced a grant.
pub async fn grant_exists_for_order(
    executor: impl PgExecutor<'_>,
    order_no: &str,
) -> PaymentResult<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM credits \
         WHERE order_no = $1 AND transaction_type = 'grant' AND deleted_at IS NULL \
         LIMIT 1",
    )
    .bind(order_no)
    .fetch_optional(executor)
    .await?;
    Ok(row.is_some())
}

#[derive(Clone)]
pub struct CreditStore {
    pool: PgPool,
    ids: Arc<SnowflakeGenerator>,
}

impl CreditStore {
    pub fn new(pool: PgPool, ids: Arc<SnowflakeGenerator>) -> Self {
        CreditStore { pool, ids }
    }

    /// Spendable balance: the signed sum of active, unexpired rows.
    pub async fn balance(&self, user_id: Uuid) -> PaymentResult<i64> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(credits) FROM credits
            WHERE user_id = $1 AND status = 'active'
              AND (expires_at IS NULL OR expires_at > NOW())
              AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.unwrap_or(0))
    }

    /// Spend credits by appending a negative row; grant rows are never
    /// touched. Fails without writing anything when the balance is short.
    pub async fn consume(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
    ) -> PaymentResult<String> {
        if amount <= 0 {
            return Err(PaymentError::Validation(
                "consume amount must be positive".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        // Lock the account's rows in a deterministic order so two
        // concurrent consumptions serialize instead of overdrawing.
        sqlx::query(
            "SELECT id FROM credits WHERE user_id = $1 AND deleted_at IS NULL \
             ORDER BY id FOR UPDATE",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(credits) FROM credits
            WHERE user_id = $1 AND status = 'active'
              AND (expires_at IS NULL OR expires_at > NOW())
              AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        let available = row.0.unwrap_or(0);
        if available < amount {
            return Err(PaymentError::Validation(format!(
                "insufficient credits: have {available}, need {amount}"
            )));
        }

        let transaction_no = self.ids.next_id();
        let remaining = available - amount;
        let consumed_detail =
            serde_json::to_string(&json!({ "amount": amount, "balance_before": available }))?;
        sqlx::query(
            r#"
            INSERT INTO credits (
                id, transaction_no, user_id, transaction_type, credits,
                remaining_credits, description, consumed_detail, status
            )
            VALUES ($1, $2, $3, 'consume', $4, $5, $6, $7, 'active')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&transaction_no)
        .bind(user_id)
        .bind(-amount)
        .bind(remaining)
        .bind(description)
        .bind(&consumed_detail)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            user_id = %user_id,
            amount,
            remaining,
            transaction_no = %transaction_no,
            "credits consumed"
        );
        Ok(transaction_no)
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> PaymentResult<Vec<CreditRow>> {
        let rows = sqlx::query_as::<_, CreditRow>(
            r#"
            SELECT id, transaction_no, user_id, order_no, transaction_type,
                   transaction_scene, credits, remaining_credits, expires_at,
                   status, created_at
            FROM credits
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn subscription_period_end_wins_over_valid_days() {
        let paid_at = datetime!(2026-08-30 12:00 UTC);
        let period_end = datetime!(2026-09-30 12:00 UTC);

        let expires = calculate_expiration(paid_at, Some(7), Some(period_end));
        assert_eq!(expires, Some(period_end));
    }

    #[test]
    fn valid_days_apply_without_a_subscription() {
        let paid_at = datetime!(2026-08-30 12:00 UTC);
        let expires = calculate_expiration(paid_at, Some(30), None);
        assert_eq!(expires, Some(datetime!(2026-09-29 12:00 UTC)));
    }

    #[test]
    fn no_window_means_no_expiry() {
        let paid_at = datetime!(2026-08-30 12:00 UTC);
        assert_eq!(calculate_expiration(paid_at, None, None), None);
    }
}
