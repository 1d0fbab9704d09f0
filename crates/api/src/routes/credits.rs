//! Account endpoints: credit balance, consumption, orders, subscriptions

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use shipkit_payments::credits::CreditRow;
use shipkit_payments::orders::OrderRow;
use shipkit_payments::subscriptions::SubscriptionRow;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const HISTORY_LIMIT: i64 = 100;
const LIST_LIMIT: i64 = 50;

pub async fn balance(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let remaining = state.credits.balance(user.user_id).await?;
    Ok(Json(json!({
        "code": 0,
        "data": { "remainingCredits": remaining },
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn consume(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ConsumeRequest>,
) -> ApiResult<Json<Value>> {
    if request.amount <= 0 {
        return Err(ApiError::Validation(
            "amount must be positive".to_string(),
        ));
    }

    let description = request.description.as_deref().unwrap_or("credit consumption");
    let transaction_no = state
        .credits
        .consume(user.user_id, request.amount, description)
        .await?;
    let remaining = state.credits.balance(user.user_id).await?;

    tracing::info!(
        user_id = %user.user_id,
        amount = request.amount,
        transaction_no = %transaction_no,
        "credits consumed"
    );

    Ok(Json(json!({
        "code": 0,
        "data": { "remainingCredits": remaining },
    })))
}

#[derive(Debug, Serialize)]
pub struct CreditEntry {
    pub transaction_no: String,
    pub transaction_type: String,
    pub credits: i64,
    pub remaining_credits: i64,
    pub order_no: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

impl From<CreditRow> for CreditEntry {
    fn from(row: CreditRow) -> Self {
        CreditEntry {
            transaction_no: row.transaction_no,
            transaction_type: row.transaction_type,
            credits: row.credits,
            remaining_credits: row.remaining_credits,
            order_no: row.order_no,
            expires_at: row.expires_at.and_then(format_rfc3339),
            created_at: format_rfc3339(row.created_at).unwrap_or_default(),
        }
    }
}

pub async fn history(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let rows = state.credits.history(user.user_id, HISTORY_LIMIT).await?;
    let entries: Vec<CreditEntry> = rows.into_iter().map(CreditEntry::from).collect();
    Ok(Json(json!({ "transactions": entries })))
}

#[derive(Debug, Serialize)]
pub struct OrderEntry {
    pub order_no: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub product_name: Option<String>,
    pub payment_type: Option<String>,
    pub payment_provider: String,
    pub paid_at: Option<String>,
    pub created_at: String,
}

impl From<OrderRow> for OrderEntry {
    fn from(row: OrderRow) -> Self {
        OrderEntry {
            order_no: row.order_no,
            status: row.status,
            amount: row.amount,
            currency: row.currency,
            product_name: row.product_name,
            payment_type: row.payment_type,
            payment_provider: row.payment_provider,
            paid_at: row.paid_at.and_then(format_rfc3339),
            created_at: format_rfc3339(row.created_at).unwrap_or_default(),
        }
    }
}

pub async fn orders(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let rows = state.orders.list_for_user(user.user_id, LIST_LIMIT).await?;
    let entries: Vec<OrderEntry> = rows.into_iter().map(OrderEntry::from).collect();
    Ok(Json(json!({ "orders": entries })))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionEntry {
    pub subscription_no: String,
    pub status: String,
    pub payment_provider: String,
    pub plan_name: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<String>,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub canceled_at: Option<String>,
}

impl From<SubscriptionRow> for SubscriptionEntry {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionEntry {
            subscription_no: row.subscription_no,
            status: row.status,
            payment_provider: row.payment_provider,
            plan_name: row.plan_name,
            amount: row.amount,
            currency: row.currency,
            interval: row.interval,
            current_period_start: row.current_period_start.and_then(format_rfc3339),
            current_period_end: row.current_period_end.and_then(format_rfc3339),
            canceled_at: row.canceled_at.and_then(format_rfc3339),
        }
    }
}

pub async fn subscriptions(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Value>> {
    let rows = state
        .subscriptions
        .list_for_user(user.user_id, LIST_LIMIT)
        .await?;
    let entries: Vec<SubscriptionEntry> = rows.into_iter().map(SubscriptionEntry::from).collect();
    Ok(Json(json!({ "subscriptions": entries })))
}

fn format_rfc3339(ts: OffsetDateTime) -> Option<String> {
    ts.format(&Rfc3339).ok()
}
