//! Checkout orchestration.
//!
//! Order numbers are minted before the vendor is called, so every vendor
//! session can be tied back to a row that already exists. A vendor failure
//! closes the order terminally instead of leaving it pending.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use shipkit_shared::SnowflakeGenerator;

use crate::catalog::PricingCatalog;
use crate::error::{PaymentError, PaymentResult};
use crate::ledger::Ledger;
use crate::model::{OrderStatus, PaymentCustomer, PaymentOrder, PaymentStatus};
use crate::orders::{self, NewOrder};
use crate::registry::ProviderRegistry;

#[derive(Debug, Clone)]
pub struct CheckoutUser {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    /// Catalog item to purchase.
    #[serde(alias = "product_id")]
    pub item_id: String,
    /// Provider name; empty or unknown falls back to the default.
    #[serde(default, alias = "payment_provider")]
    pub provider: String,
    /// Optional currency check; must match the catalog item when present.
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutInfo {
    pub order_no: String,
    pub provider: String,
    pub session_id: String,
    pub checkout_url: String,
}

/// Where a finished callback should send the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Paid,
    Pending,
    Failed,
}

pub struct CheckoutService {
    pool: PgPool,
    registry: Arc<ProviderRegistry>,
    catalog: PricingCatalog,
    ledger: Ledger,
    ids: Arc<SnowflakeGenerator>,
    app_url: String,
}

impl CheckoutService {
    pub fn new(
        pool: PgPool,
        registry: Arc<ProviderRegistry>,
        catalog: PricingCatalog,
        ledger: Ledger,
        ids: Arc<SnowflakeGenerator>,
        app_url: String,
    ) -> Self {
        CheckoutService {
            pool,
            registry,
            catalog,
            ledger,
            ids,
            app_url: app_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn create_checkout(
        &self,
        user: &CheckoutUser,
        request: &CheckoutRequest,
    ) -> PaymentResult<CheckoutInfo> {
        if user.email.is_empty() {
            return Err(PaymentError::Validation(
                "checkout requires a user email".to_string(),
            ));
        }

        let item = self.catalog.find(&request.item_id).await?;
        if let Some(currency) = &request.currency {
            if !currency.eq_ignore_ascii_case(&item.currency) {
                return Err(PaymentError::Validation(format!(
                    "item {} is priced in {}, not {currency}",
                    item.item_id, item.currency
                )));
            }
        }
        let provider = self.registry.get(&request.provider)?;
        let price = item.price_for(provider.name())?;
        let payment_type = item.payment_type()?;

        let order_no = self.ids.next_id();
        let success_url = callback_url(&self.app_url, &order_no);
        let cancel_url = format!("{}/pricing", self.app_url);

        let new_order = NewOrder {
            order_no: order_no.clone(),
            user_id: user.user_id,
            user_email: user.email.clone(),
            amount: price.amount,
            currency: price.currency.clone(),
            product_id: price.product_id.clone(),
            product_name: price.product_name.clone(),
            payment_type: payment_type.as_str().to_string(),
            payment_interval: price.interval.as_str().to_string(),
            payment_provider: provider.name().to_string(),
            checkout_info: json!({
                "item_id": item.item_id,
                "provider": provider.name(),
                "success_url": success_url,
                "cancel_url": cancel_url,
            }),
            credits_amount: item.credits_amount,
            credits_valid_days: item.credits_valid_days,
            plan_name: item.plan_name.clone(),
        };
        orders::insert_pending(&self.pool, &new_order).await?;

        let payment_order = PaymentOrder {
            order_no: order_no.clone(),
            payment_type,
            price,
            customer: PaymentCustomer {
                user_id: user.user_id.to_string(),
                email: user.email.clone(),
            },
            success_url,
            cancel_url,
            metadata: json!({ "item_id": item.item_id }),
        };

        let session = match provider.create_checkout(&payment_order).await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    order_no = %order_no,
                    provider = provider.name(),
                    error = %e,
                    "vendor checkout failed, closing order"
                );
                orders::mark_completed(&self.pool, &order_no).await?;
                return Err(e);
            }
        };

        orders::mark_created(
            &self.pool,
            &order_no,
            &session.session_id,
            &session.checkout_url,
            &session.checkout_result,
        )
        .await?;

        info!(
            order_no = %order_no,
            provider = provider.name(),
            item_id = %item.item_id,
            "checkout created"
        );

        Ok(CheckoutInfo {
            order_no,
            provider: provider.name().to_string(),
            session_id: session.session_id,
            checkout_url: session.checkout_url,
        })
    }

    /// The browser came back from the vendor. Re-fetch the session from the
    /// vendor itself, reconcile, and report where to send the user. The
    /// order number in the query string is never trusted as proof of
    /// payment.
    pub async fn confirm_callback(
        &self,
        order_no: &str,
        user_id: Uuid,
    ) -> PaymentResult<CallbackOutcome> {
        let order = orders::find_by_order_no(&self.pool, order_no)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(order_no.to_string()))?;

        if order.user_id != user_id {
            return Err(PaymentError::Validation(format!(
                "order {order_no} does not belong to the requesting user"
            )));
        }

        match order.status()? {
            OrderStatus::Paid => return Ok(CallbackOutcome::Paid),
            OrderStatus::Failed | OrderStatus::Completed => return Ok(CallbackOutcome::Failed),
            OrderStatus::Pending | OrderStatus::Created => {}
        }

        let session_id = order.payment_session_id.as_deref().ok_or_else(|| {
            PaymentError::Validation(format!("order {order_no} has no vendor session"))
        })?;
        let provider = self.registry.get_exact(&order.payment_provider)?;
        let session = provider.retrieve_session(session_id).await?;

        if let Some(session_order_no) = session.order_no.as_deref() {
            if session_order_no != order_no {
                return Err(PaymentError::Validation(format!(
                    "session {session_id} does not belong to order {order_no}"
                )));
            }
        }

        self.ledger.apply_session(&session).await?;

        Ok(match session.status {
            PaymentStatus::Success => CallbackOutcome::Paid,
            PaymentStatus::Processing => CallbackOutcome::Pending,
            PaymentStatus::Failed | PaymentStatus::Cancelled => CallbackOutcome::Failed,
        })
    }
}

fn callback_url(app_url: &str, order_no: &str) -> String {
    format!("{app_url}/api/payment/callback?order_no={order_no}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn callback_url_carries_order_no() {
        assert_eq!(
            callback_url("https://app.example.com", "20260830007"),
            "https://app.example.com/api/payment/callback?order_no=20260830007"
        );
    }
}
