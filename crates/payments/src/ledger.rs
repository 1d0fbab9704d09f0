//! The reconciliation ledger.
//!
//! Every payment fact, whether it arrived by webhook or by callback
//! polling, lands here and is applied to orders, subscriptions, and
//! credits in one database transaction. Applying the same fact twice is
//! always safe: settlement updates are guarded by order status, renewal
//! orders are keyed by (provider, transaction_id), and credit grants are
//! keyed by order_no.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{info, warn};

use shipkit_shared::SnowflakeGenerator;

use crate::credits::{self, NewGrant, SCENE_PAYMENT, SCENE_SUBSCRIPTION};
use crate::error::{is_unique_violation, PaymentError, PaymentResult};
use crate::model::{
    PaymentEvent, PaymentEventType, PaymentSession, PaymentStatus, PaymentType,
    SubscriptionDetails,
};
use crate::orders;
use crate::subscriptions::{self, NewSubscription};

#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
    ids: Arc<SnowflakeGenerator>,
}

impl Ledger {
    pub fn new(pool: PgPool, ids: Arc<SnowflakeGenerator>) -> Self {
        Ledger { pool, ids }
    }

    /// Apply a verified webhook event.
    pub async fn apply_event(&self, event: &PaymentEvent) -> PaymentResult<()> {
        match event.event_type {
            PaymentEventType::CheckoutSuccess | PaymentEventType::PaymentSuccess => {
                match &event.session {
                    Some(session) => self.apply_session(session).await,
                    // Settled elsewhere (e.g. a first-cycle invoice whose
                    // checkout event carries the grant).
                    None => Ok(()),
                }
            }
            PaymentEventType::PaymentFailed => match &event.session {
                Some(session) => self.apply_failure(session).await,
                None => {
                    warn!("payment failed event without session context");
                    Ok(())
                }
            },
            PaymentEventType::PaymentRefunded => {
                // Refunds are recorded by the vendor; the ledger keeps the
                // paid order as the audit trail.
                info!("payment refunded event acknowledged");
                Ok(())
            }
            PaymentEventType::SubscribeUpdated | PaymentEventType::SubscribeCanceled => {
                match &event.subscription {
                    Some(details) => self.apply_subscription_change(details).await,
                    None => {
                        warn!(event_type = %event.event_type.as_str(), "subscription event without details");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Apply a normalized session, from either a webhook or the callback
    /// path's session lookup.
    pub async fn apply_session(&self, session: &PaymentSession) -> PaymentResult<()> {
        match (session.payment_type, session.status) {
            (PaymentType::Renew, PaymentStatus::Success) => self.apply_renewal(session).await,
            (_, PaymentStatus::Success) => self.apply_checkout_success(session).await,
            (_, PaymentStatus::Failed) | (_, PaymentStatus::Cancelled) => {
                self.apply_failure(session).await
            }
            // Nothing to settle yet; the vendor will report again.
            (_, PaymentStatus::Processing) => Ok(()),
        }
    }

    async fn apply_checkout_success(&self, session: &PaymentSession) -> PaymentResult<()> {
        let order_no = session.order_no.as_deref().ok_or_else(|| {
            PaymentError::Validation("successful session carries no order number".to_string())
        })?;

        let mut tx = self.pool.begin().await?;

        let order = orders::find_by_order_no(&mut *tx, order_no)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(order_no.to_string()))?;

        let paid_at = session
            .payment
            .paid_at
            .unwrap_or_else(OffsetDateTime::now_utc);
        let payment_result = serde_json::to_value(&session.payment)?;
        let subscription_result = session
            .subscription
            .as_ref()
            .map(|s| s.raw.clone())
            .unwrap_or(Value::Null);

        let transitioned = orders::mark_paid(
            &mut *tx,
            order_no,
            session.payment.transaction_id.as_deref(),
            session.payment.amount,
            session.payment.currency.as_deref(),
            session.payment.customer_email.as_deref(),
            paid_at,
            &payment_result,
            session
                .subscription
                .as_ref()
                .map(|s| s.provider_subscription_id.as_str()),
            Some(&subscription_result),
        )
        .await?;

        if !transitioned {
            info!(order_no, "order already settled, nothing to apply");
            tx.commit().await?;
            return Ok(());
        }

        let period_end = if let Some(details) = &session.subscription {
            subscriptions::upsert(
                &mut *tx,
                &NewSubscription {
                    subscription_no: self.ids.next_id(),
                    user_id: order.user_id,
                    user_email: order.user_email.clone(),
                    status: details.status.clone(),
                    payment_provider: session.provider.clone(),
                    provider_subscription_id: details.provider_subscription_id.clone(),
                    subscription_result: details.raw.clone(),
                    amount: Some(order.amount),
                    currency: Some(order.currency.clone()),
                    interval: order.payment_interval.clone(),
                    current_period_start: details.current_period_start,
                    current_period_end: details.current_period_end,
                    plan_name: order.plan_name.clone(),
                },
            )
            .await?;
            details.current_period_end
        } else {
            None
        };

        let credits_amount = order.credits_amount.unwrap_or(0);
        if credits_amount > 0 && !credits::grant_exists_for_order(&mut *tx, order_no).await? {
            let scene = if session.subscription.is_some() {
                SCENE_SUBSCRIPTION
            } else {
                SCENE_PAYMENT
            };
            let grant = NewGrant {
                transaction_no: self.ids.next_id(),
                user_id: order.user_id,
                user_email: order.user_email.clone(),
                order_no: Some(order_no.to_string()),
                provider_subscription_id: session
                    .subscription
                    .as_ref()
                    .map(|s| s.provider_subscription_id.clone()),
                scene,
                credits: credits_amount,
                expires_at: credits::calculate_expiration(
                    paid_at,
                    order.credits_valid_days,
                    period_end,
                ),
                description: order.plan_name.clone(),
            };
            match credits::insert_grant(&mut *tx, &grant).await {
                Ok(_) => {}
                Err(PaymentError::Database(e)) if is_unique_violation(&e) => {
                    info!(order_no, "credit grant already recorded");
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().await?;

        info!(
            order_no,
            provider = %session.provider,
            credits = credits_amount,
            "checkout success applied"
        );
        Ok(())
    }

    async fn apply_failure(&self, session: &PaymentSession) -> PaymentResult<()> {
        let order_no = session.order_no.as_deref().ok_or_else(|| {
            PaymentError::Validation("failed session carries no order number".to_string())
        })?;

        let payment_result = serde_json::to_value(&session.payment)?;
        let transitioned = orders::mark_failed(&self.pool, order_no, &payment_result).await?;
        if transitioned {
            info!(order_no, provider = %session.provider, "order marked failed");
        }
        Ok(())
    }

    /// Record a renewal charge: an already-paid order of its own, an
    /// advanced billing period, and a fresh credit grant.
    async fn apply_renewal(&self, session: &PaymentSession) -> PaymentResult<()> {
        let transaction_id = session.payment.transaction_id.as_deref().ok_or_else(|| {
            PaymentError::Validation("renewal without a transaction id".to_string())
        })?;
        let details = session.subscription.as_ref().ok_or_else(|| {
            PaymentError::Validation("renewal without subscription details".to_string())
        })?;

        let mut tx = self.pool.begin().await?;

        if orders::find_by_provider_transaction(&mut *tx, &session.provider, transaction_id)
            .await?
            .is_some()
        {
            info!(transaction_id, "renewal already recorded");
            tx.commit().await?;
            return Ok(());
        }

        // A charge that settles the originating checkout order is not a
        // renewal; attach the transaction id and stop. This absorbs the
        // first-cycle charge on vendors that report it separately from
        // the checkout event.
        if let Some(order_no) = session.order_no.as_deref() {
            if let Some(origin) = orders::find_by_order_no(&mut *tx, order_no).await? {
                if origin.transaction_id.is_none() {
                    orders::attach_transaction(&mut *tx, order_no, transaction_id).await?;
                    subscriptions::advance_period(
                        &mut *tx,
                        &session.provider,
                        &details.provider_subscription_id,
                        details.current_period_start,
                        details.current_period_end,
                        &details.raw,
                    )
                    .await?;
                    tx.commit().await?;
                    info!(order_no, transaction_id, "first cycle attached to checkout order");
                    return Ok(());
                }
            }
        }

        let origin = orders::find_subscription_origin(
            &mut *tx,
            &session.provider,
            &details.provider_subscription_id,
        )
        .await?
        .ok_or_else(|| {
            PaymentError::SubscriptionNotFound(details.provider_subscription_id.clone())
        })?;

        let order_no = self.ids.next_id();
        let paid_at = session
            .payment
            .paid_at
            .unwrap_or_else(OffsetDateTime::now_utc);
        let payment_result = serde_json::to_value(&session.payment)?;

        match orders::insert_renewal(
            &mut *tx,
            &order_no,
            &origin,
            transaction_id,
            session.payment.amount,
            session.payment.currency.as_deref(),
            paid_at,
            &payment_result,
        )
        .await
        {
            Ok(_) => {}
            Err(PaymentError::Database(e)) if is_unique_violation(&e) => {
                info!(transaction_id, "renewal lost the insert race, already applied");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        subscriptions::advance_period(
            &mut *tx,
            &session.provider,
            &details.provider_subscription_id,
            details.current_period_start,
            details.current_period_end,
            &details.raw,
        )
        .await?;

        let credits_amount = origin.credits_amount.unwrap_or(0);
        if credits_amount > 0 {
            credits::insert_grant(
                &mut *tx,
                &NewGrant {
                    transaction_no: self.ids.next_id(),
                    user_id: origin.user_id,
                    user_email: origin.user_email.clone(),
                    order_no: Some(order_no.clone()),
                    provider_subscription_id: Some(details.provider_subscription_id.clone()),
                    scene: SCENE_SUBSCRIPTION,
                    credits: credits_amount,
                    expires_at: credits::calculate_expiration(
                        paid_at,
                        origin.credits_valid_days,
                        details.current_period_end,
                    ),
                    description: origin.plan_name.clone(),
                },
            )
            .await?;
        }

        tx.commit().await?;

        info!(
            order_no = %order_no,
            transaction_id,
            subscription = %details.provider_subscription_id,
            credits = credits_amount,
            "renewal applied"
        );
        Ok(())
    }

    async fn apply_subscription_change(&self, details: &SubscriptionDetails) -> PaymentResult<()> {
        let updated = subscriptions::update_status(
            &self.pool,
            &details.provider_subscription_id,
            &details.status,
            details.current_period_start,
            details.current_period_end,
            &details.raw,
        )
        .await?;

        if !updated {
            // The checkout event that creates the row may still be in
            // flight; erroring makes the vendor redeliver later.
            return Err(PaymentError::SubscriptionNotFound(
                details.provider_subscription_id.clone(),
            ));
        }

        info!(
            subscription = %details.provider_subscription_id,
            status = %details.status,
            "subscription change applied"
        );
        Ok(())
    }
}
