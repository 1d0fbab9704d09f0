//! Integration tests for ledger reconciliation
//!
//! These tests verify that applying the same payment fact multiple times
//! never double-settles an order, double-grants credits, or mints duplicate
//! renewal orders.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/shipkit_test"
//! cargo test --test ledger_reconciliation -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use shipkit_payments::catalog::PricingCatalog;
use shipkit_payments::credits::CreditStore;
use shipkit_payments::ledger::Ledger;
use shipkit_payments::model::{
    PaymentDetails, PaymentSession, PaymentStatus, PaymentType, SubscriptionCycleType,
    SubscriptionDetails,
};
use shipkit_payments::orders::{self, NewOrder};
use shipkit_payments::registry::ProviderRegistry;
use shipkit_payments::{CheckoutService, PaymentError};
use shipkit_shared::SnowflakeGenerator;

async fn setup() -> (Ledger, PgPool, Arc<SnowflakeGenerator>) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let ids = Arc::new(SnowflakeGenerator::new());
    (Ledger::new(pool.clone(), ids.clone()), pool, ids)
}

/// Insert a created order waiting for payment and return its order number.
async fn seed_order(
    pool: &PgPool,
    ids: &SnowflakeGenerator,
    payment_type: &str,
    credits_amount: i64,
) -> String {
    let order_no = ids.next_id();
    let order = NewOrder {
        order_no: order_no.clone(),
        user_id: Uuid::new_v4(),
        user_email: "buyer@example.com".to_string(),
        amount: 1990,
        currency: "usd".to_string(),
        product_id: None,
        product_name: "Pro".to_string(),
        payment_type: payment_type.to_string(),
        payment_interval: if payment_type == "subscription" {
            "month".to_string()
        } else {
            "one-time".to_string()
        },
        payment_provider: "stripe".to_string(),
        checkout_info: json!({ "item_id": "pro-monthly" }),
        credits_amount,
        credits_valid_days: Some(30),
        plan_name: "Pro".to_string(),
    };
    orders::insert_pending(pool, &order)
        .await
        .expect("insert order");
    orders::mark_created(pool, &order_no, "cs_test_1", "https://pay.example/cs_test_1", &json!({}))
        .await
        .expect("mark created");
    order_no
}

fn paid_session(order_no: &str, transaction_id: &str) -> PaymentSession {
    PaymentSession {
        provider: "stripe".to_string(),
        session_id: "cs_test_1".to_string(),
        order_no: Some(order_no.to_string()),
        status: PaymentStatus::Success,
        payment_type: PaymentType::OneTime,
        payment: PaymentDetails {
            transaction_id: Some(transaction_id.to_string()),
            amount: Some(1990),
            currency: Some("usd".to_string()),
            paid_at: Some(OffsetDateTime::now_utc()),
            customer_email: Some("buyer@example.com".to_string()),
        },
        subscription: None,
    }
}

fn subscription_session(order_no: &str, sub_id: &str, transaction_id: &str) -> PaymentSession {
    let now = OffsetDateTime::now_utc();
    let mut session = paid_session(order_no, transaction_id);
    session.payment_type = PaymentType::Subscription;
    session.subscription = Some(SubscriptionDetails {
        provider_subscription_id: sub_id.to_string(),
        status: "active".to_string(),
        cycle: SubscriptionCycleType::Create,
        current_period_start: Some(now),
        current_period_end: Some(now + Duration::days(30)),
        cancel_at_period_end: Some(false),
        raw: json!({ "id": sub_id }),
    });
    session
}

fn renewal_session(sub_id: &str, transaction_id: &str) -> PaymentSession {
    let now = OffsetDateTime::now_utc();
    PaymentSession {
        provider: "stripe".to_string(),
        session_id: transaction_id.to_string(),
        order_no: None,
        status: PaymentStatus::Success,
        payment_type: PaymentType::Renew,
        payment: PaymentDetails {
            transaction_id: Some(transaction_id.to_string()),
            amount: Some(1990),
            currency: Some("usd".to_string()),
            paid_at: Some(now),
            customer_email: None,
        },
        subscription: Some(SubscriptionDetails {
            provider_subscription_id: sub_id.to_string(),
            status: "active".to_string(),
            cycle: SubscriptionCycleType::Renewal,
            current_period_start: Some(now + Duration::days(30)),
            current_period_end: Some(now + Duration::days(60)),
            cancel_at_period_end: Some(false),
            raw: json!({ "id": sub_id }),
        }),
    }
}

async fn grant_count(pool: &PgPool, order_no: &str) -> i64 {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM credits WHERE order_no = $1 AND transaction_type = 'grant'",
    )
    .bind(order_no)
    .fetch_one(pool)
    .await
    .expect("count grants");
    row.0
}

#[tokio::test]
#[ignore]
async fn checkout_success_applied_twice_settles_once() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "one-time", 100).await;
    let session = paid_session(&order_no, &format!("pi_{order_no}"));

    ledger.apply_session(&session).await.expect("first apply");
    ledger.apply_session(&session).await.expect("second apply");

    let order = orders::find_by_order_no(&pool, &order_no)
        .await
        .expect("query order")
        .expect("order exists");
    assert_eq!(order.status, "paid");
    assert_eq!(grant_count(&pool, &order_no).await, 1);
}

#[tokio::test]
#[ignore]
async fn one_time_order_without_credits_grants_nothing() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "one-time", 0).await;

    ledger
        .apply_session(&paid_session(&order_no, &format!("pi_{order_no}")))
        .await
        .expect("apply");

    assert_eq!(grant_count(&pool, &order_no).await, 0);
}

#[tokio::test]
#[ignore]
async fn renewal_delivered_twice_mints_one_order() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "subscription", 1000).await;
    let sub_id = format!("sub_{order_no}");

    ledger
        .apply_session(&subscription_session(
            &order_no,
            &sub_id,
            &format!("pi_{order_no}"),
        ))
        .await
        .expect("checkout success");

    let renewal = renewal_session(&sub_id, &format!("in_{order_no}"));
    ledger.apply_session(&renewal).await.expect("first renewal");
    ledger.apply_session(&renewal).await.expect("replayed renewal");

    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM orders WHERE subscription_id = $1 AND payment_type = 'renew'",
    )
    .bind(&sub_id)
    .fetch_one(&pool)
    .await
    .expect("count renewal orders");
    assert_eq!(row.0, 1);

    // One grant from checkout, one from the single renewal.
    let grants: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM credits WHERE provider_subscription_id = $1 \
         AND transaction_type = 'grant'",
    )
    .bind(&sub_id)
    .fetch_one(&pool)
    .await
    .expect("count grants");
    assert_eq!(grants.0, 2);
}

#[tokio::test]
#[ignore]
async fn first_cycle_charge_attaches_instead_of_minting() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "subscription", 1000).await;
    let sub_id = format!("I-{order_no}");

    // Activation settles the order without a transaction id, as PayPal does.
    let mut activation = subscription_session(&order_no, &sub_id, "unused");
    activation.payment.transaction_id = None;
    ledger.apply_session(&activation).await.expect("activation");

    // The first sale carries the originating order number.
    let mut sale = renewal_session(&sub_id, &format!("SALE-{order_no}"));
    sale.order_no = Some(order_no.clone());
    ledger.apply_session(&sale).await.expect("first sale");

    let order = orders::find_by_order_no(&pool, &order_no)
        .await
        .expect("query order")
        .expect("order exists");
    assert_eq!(order.status, "paid");
    assert_eq!(
        order.transaction_id.as_deref(),
        Some(format!("SALE-{order_no}").as_str())
    );

    // No renewal order was minted for the first cycle.
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM orders WHERE subscription_id = $1 AND payment_type = 'renew'",
    )
    .bind(&sub_id)
    .fetch_one(&pool)
    .await
    .expect("count renewal orders");
    assert_eq!(row.0, 0);
    assert_eq!(grant_count(&pool, &order_no).await, 1);
}

#[tokio::test]
#[ignore]
async fn failure_never_downgrades_a_paid_order() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "one-time", 100).await;

    ledger
        .apply_session(&paid_session(&order_no, &format!("pi_{order_no}")))
        .await
        .expect("paid");

    let mut failed = paid_session(&order_no, &format!("pi_{order_no}"));
    failed.status = PaymentStatus::Failed;
    ledger.apply_session(&failed).await.expect("late failure");

    let order = orders::find_by_order_no(&pool, &order_no)
        .await
        .expect("query order")
        .expect("order exists");
    assert_eq!(order.status, "paid");
}

#[tokio::test]
#[ignore]
async fn cancelled_session_marks_order_failed() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "one-time", 100).await;

    let mut cancelled = paid_session(&order_no, &format!("pi_{order_no}"));
    cancelled.status = PaymentStatus::Cancelled;
    cancelled.payment.transaction_id = None;
    ledger.apply_session(&cancelled).await.expect("cancelled");

    let order = orders::find_by_order_no(&pool, &order_no)
        .await
        .expect("query order")
        .expect("order exists");
    assert_eq!(order.status, "failed");
    assert_eq!(grant_count(&pool, &order_no).await, 0);
}

#[tokio::test]
#[ignore]
async fn consumption_appends_negative_rows_and_never_mutates_grants() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "one-time", 100).await;

    ledger
        .apply_session(&paid_session(&order_no, &format!("pi_{order_no}")))
        .await
        .expect("paid");

    let order = orders::find_by_order_no(&pool, &order_no)
        .await
        .expect("query order")
        .expect("order exists");
    let store = CreditStore::new(pool.clone(), ids.clone());

    let transaction_no = store
        .consume(order.user_id, 30, "api usage")
        .await
        .expect("consume");
    assert_eq!(store.balance(order.user_id).await.expect("balance"), 70);

    // The balance is derivable by summing the signed rows.
    let sum: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(credits) FROM credits WHERE user_id = $1 \
         AND status = 'active' AND (expires_at IS NULL OR expires_at > NOW()) \
         AND deleted_at IS NULL",
    )
    .bind(order.user_id)
    .fetch_one(&pool)
    .await
    .expect("sum rows");
    assert_eq!(sum.0, Some(70));

    // The consume row is negative and snapshots the balance it left behind.
    let consume_row: (i64, i64) = sqlx::query_as(
        "SELECT credits, remaining_credits FROM credits WHERE transaction_no = $1",
    )
    .bind(&transaction_no)
    .fetch_one(&pool)
    .await
    .expect("consume row");
    assert_eq!(consume_row, (-30, 70));

    // The grant itself is untouched.
    let grant_row: (i64, i64) = sqlx::query_as(
        "SELECT credits, remaining_credits FROM credits \
         WHERE order_no = $1 AND transaction_type = 'grant'",
    )
    .bind(&order_no)
    .fetch_one(&pool)
    .await
    .expect("grant row");
    assert_eq!(grant_row, (100, 100));

    // Overspending fails before anything is written.
    let err = store.consume(order.user_id, 1000, "api usage").await;
    assert!(matches!(err, Err(PaymentError::Validation(_))));
    assert_eq!(store.balance(order.user_id).await.expect("balance"), 70);
}

#[tokio::test]
#[ignore]
async fn callback_by_another_user_mutates_nothing() {
    let (ledger, pool, ids) = setup().await;
    let order_no = seed_order(&pool, &ids, "one-time", 100).await;

    let checkout = CheckoutService::new(
        pool.clone(),
        Arc::new(ProviderRegistry::new()),
        PricingCatalog::new(pool.clone()),
        ledger,
        ids,
        "https://app.example.com".to_string(),
    );

    let result = checkout.confirm_callback(&order_no, Uuid::new_v4()).await;
    assert!(matches!(result, Err(PaymentError::Validation(_))));

    let order = orders::find_by_order_no(&pool, &order_no)
        .await
        .expect("query order")
        .expect("order exists");
    assert_eq!(order.status, "created");
    assert_eq!(grant_count(&pool, &order_no).await, 0);
}
