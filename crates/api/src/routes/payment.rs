//! Checkout, callback, and webhook endpoints

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Redirect,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use shipkit_payments::checkout::{CallbackOutcome, CheckoutRequest, CheckoutUser};
use shipkit_payments::provider::WebhookRequest;
use shipkit_payments::PaymentResult;

use crate::auth::AuthUser;
use crate::state::AppState;

/// Start a checkout. Success answers `{code: 0, data: {...}}`; any failure
/// answers `{code: -1, message}` so the pricing page can show it inline.
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Json<Value> {
    let checkout_user = CheckoutUser {
        user_id: user.user_id,
        email: user.email,
    };

    match state.checkout.create_checkout(&checkout_user, &request).await {
        Ok(info) => {
            tracing::info!(
                order_no = %info.order_no,
                provider = %info.provider,
                "checkout session created"
            );
            Json(json!({
                "code": 0,
                "data": {
                    "checkoutUrl": info.checkout_url,
                    "sessionId": info.session_id,
                }
            }))
        }
        Err(err) => {
            tracing::error!(item_id = %request.item_id, error = %err, "checkout failed");
            Json(json!({ "code": -1, "message": err.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub order_no: String,
}

/// The browser returning from the vendor. Always answers with a redirect:
/// the vendor session is re-fetched and reconciled, and the user lands on
/// the success or failure page depending on what the vendor reports.
pub async fn callback(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let outcome = state
        .checkout
        .confirm_callback(&query.order_no, user.user_id)
        .await;

    match outcome {
        Ok(CallbackOutcome::Paid) => Redirect::to(&state.config.pay_success_url),
        Ok(CallbackOutcome::Pending) => {
            tracing::info!(order_no = %query.order_no, "payment still processing at callback");
            Redirect::to(&state.config.pay_success_url)
        }
        Ok(CallbackOutcome::Failed) => Redirect::to(&state.config.pay_fail_url),
        Err(err) => {
            tracing::error!(order_no = %query.order_no, error = %err, "payment callback failed");
            Redirect::to(&state.config.pay_fail_url)
        }
    }
}

/// Vendor webhook delivery. Verification and parsing are the provider's
/// job; anything short of full success answers 500 so the vendor retries.
pub async fn notify(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    match handle_notify(&state, &provider, &headers, body).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "message": "success" }))),
        Err(err) => {
            tracing::error!(provider = %provider, error = %err, "webhook handling failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": format!("handle payment notify failed: {err}") })),
            )
        }
    }
}

async fn handle_notify(
    state: &AppState,
    provider_name: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> PaymentResult<()> {
    let provider = state.registry.get_exact(provider_name)?;

    let mut request = WebhookRequest::new(body.to_vec());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    let event = provider.parse_webhook(&request).await?;
    tracing::info!(
        provider = %provider_name,
        event_type = %event.event_type.as_str(),
        "webhook event verified"
    );

    state.ledger.apply_event(&event).await?;
    Ok(())
}
