//! Stripe adapter built on Checkout Sessions and signed webhooks.

use async_trait::async_trait;
use serde_json::{json, Value};
use stripe::{
    CheckoutSessionMode, CheckoutSessionPaymentStatus, CheckoutSessionStatus,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval, Currency, EventObject, EventType,
    Expandable, Invoice, InvoiceBillingReason, Subscription, SubscriptionStatus, Webhook,
    WebhookError,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::model::{
    CheckoutSession as Session, PaymentDetails, PaymentEvent, PaymentEventType, PaymentInterval,
    PaymentOrder, PaymentSession, PaymentStatus, PaymentType, SubscriptionCycleType,
    SubscriptionDetails,
};
use crate::provider::{PaymentProvider, WebhookRequest};

pub const PROVIDER_NAME: &str = "stripe";

const SIGNATURE_HEADER: &str = "stripe-signature";

pub struct StripeProvider {
    client: stripe::Client,
    signing_secret: Option<String>,
}

impl StripeProvider {
    pub fn new(secret_key: String, signing_secret: Option<String>) -> Self {
        StripeProvider {
            client: stripe::Client::new(secret_key),
            signing_secret,
        }
    }

    fn signing_secret(&self) -> PaymentResult<&str> {
        self.signing_secret
            .as_deref()
            .ok_or_else(|| PaymentError::Config("stripe_signing_secret is not set".to_string()))
    }

    async fn fetch_subscription(
        &self,
        id: &str,
        cycle: SubscriptionCycleType,
    ) -> PaymentResult<SubscriptionDetails> {
        let sub_id = id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, format!("bad subscription id: {e}")))?;
        let sub = Subscription::retrieve(&self.client, &sub_id, &[])
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;
        Ok(subscription_details(&sub, cycle)?)
    }

    async fn normalize_session(
        &self,
        session: &stripe::CheckoutSession,
    ) -> PaymentResult<PaymentSession> {
        let order_no = session.client_reference_id.clone().or_else(|| {
            session
                .metadata
                .as_ref()
                .and_then(|m| m.get("order_no").cloned())
        });

        let status = match session.payment_status {
            CheckoutSessionPaymentStatus::Paid
            | CheckoutSessionPaymentStatus::NoPaymentRequired => PaymentStatus::Success,
            CheckoutSessionPaymentStatus::Unpaid => match session.status {
                Some(CheckoutSessionStatus::Expired) => PaymentStatus::Cancelled,
                _ => PaymentStatus::Processing,
            },
        };

        let payment_type = match session.mode {
            CheckoutSessionMode::Subscription => PaymentType::Subscription,
            _ => PaymentType::OneTime,
        };

        let transaction_id = session.payment_intent.as_ref().map(|pi| match pi {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(obj) => obj.id.to_string(),
        });

        let customer_email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| session.customer_email.clone());

        let payment = PaymentDetails {
            transaction_id,
            amount: session.amount_total,
            currency: session.currency.map(|c| c.to_string()),
            paid_at: OffsetDateTime::from_unix_timestamp(session.created).ok(),
            customer_email,
        };

        let subscription = match (&session.subscription, payment_type) {
            (Some(Expandable::Object(sub)), PaymentType::Subscription) => {
                Some(subscription_details(sub, SubscriptionCycleType::Create)?)
            }
            (Some(Expandable::Id(id)), PaymentType::Subscription) => Some(
                self.fetch_subscription(id.as_str(), SubscriptionCycleType::Create)
                    .await?,
            ),
            _ => None,
        };

        Ok(PaymentSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: session.id.to_string(),
            order_no,
            status,
            payment_type,
            payment,
            subscription,
        })
    }

    async fn invoice_session(&self, invoice: &Invoice) -> PaymentResult<PaymentSession> {
        let sub_id = invoice
            .subscription
            .as_ref()
            .map(|s| match s {
                Expandable::Id(id) => id.to_string(),
                Expandable::Object(obj) => obj.id.to_string(),
            })
            .ok_or_else(|| {
                PaymentError::vendor(PROVIDER_NAME, "renewal invoice without subscription")
            })?;

        let subscription = self
            .fetch_subscription(&sub_id, SubscriptionCycleType::Renewal)
            .await?;

        let paid_at = invoice
            .status_transitions
            .as_ref()
            .and_then(|t| t.paid_at)
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let payment = PaymentDetails {
            transaction_id: Some(invoice.id.to_string()),
            amount: invoice.amount_paid,
            currency: invoice.currency.map(|c| c.to_string()),
            paid_at,
            customer_email: invoice.customer_email.clone(),
        };

        Ok(PaymentSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: invoice.id.to_string(),
            order_no: None,
            status: PaymentStatus::Success,
            payment_type: PaymentType::Renew,
            payment,
            subscription: Some(subscription),
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn create_checkout(&self, order: &PaymentOrder) -> PaymentResult<Session> {
        let currency = parse_currency(&order.price.currency)?;
        let recurring = match order.price.interval {
            PaymentInterval::OneTime => None,
            interval => Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                interval: recurring_interval(interval)?,
                interval_count: Some(1),
            }),
        };

        let mode = if recurring.is_some() {
            CheckoutSessionMode::Subscription
        } else {
            CheckoutSessionMode::Payment
        };

        let line_item = CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(order.price.amount),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: order.price.product_name.clone(),
                    ..Default::default()
                }),
                recurring,
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        };

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("order_no".to_string(), order.order_no.clone());
        metadata.insert("user_id".to_string(), order.customer.user_id.clone());

        let params = CreateCheckoutSession {
            mode: Some(mode),
            line_items: Some(vec![line_item]),
            success_url: Some(&order.success_url),
            cancel_url: Some(&order.cancel_url),
            client_reference_id: Some(&order.order_no),
            customer_email: Some(&order.customer.email),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = stripe::CheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        let checkout_url = session.url.clone().ok_or_else(|| {
            PaymentError::vendor(PROVIDER_NAME, "checkout session has no url")
        })?;

        info!(
            order_no = %order.order_no,
            session_id = %session.id,
            mode = ?mode,
            "created stripe checkout session"
        );

        Ok(Session {
            provider: PROVIDER_NAME.to_string(),
            session_id: session.id.to_string(),
            checkout_url,
            checkout_result: serde_json::to_value(&session)?,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        let id = session_id
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, format!("bad session id: {e}")))?;

        let session = stripe::CheckoutSession::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        self.normalize_session(&session).await
    }

    async fn parse_webhook(&self, request: &WebhookRequest) -> PaymentResult<PaymentEvent> {
        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| PaymentError::MissingSignature(SIGNATURE_HEADER.to_string()))?;
        let secret = self.signing_secret()?;
        let body = std::str::from_utf8(&request.body)
            .map_err(|_| PaymentError::vendor(PROVIDER_NAME, "webhook body is not utf-8"))?;

        let event = Webhook::construct_event(body, signature, secret).map_err(|e| match e {
            WebhookError::BadParse(parse) => {
                PaymentError::vendor(PROVIDER_NAME, format!("webhook parse failed: {parse}"))
            }
            other => {
                warn!(error = %other, "stripe webhook signature rejected");
                PaymentError::SignatureInvalid
            }
        })?;

        let raw = serde_json::to_value(&event).unwrap_or_else(|_| json!({}));
        debug!(event_type = %event.type_, "stripe webhook verified");

        match (event.type_, event.data.object) {
            (EventType::CheckoutSessionCompleted, EventObject::CheckoutSession(session)) => {
                let normalized = self.normalize_session(&session).await?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::CheckoutSuccess,
                    session: Some(normalized),
                    subscription: None,
                    raw,
                })
            }
            (EventType::InvoicePaymentSucceeded, EventObject::Invoice(invoice)) => {
                match invoice.billing_reason {
                    Some(InvoiceBillingReason::SubscriptionCycle) => {
                        let session = self.invoice_session(&invoice).await?;
                        Ok(PaymentEvent {
                            event_type: PaymentEventType::PaymentSuccess,
                            session: Some(session),
                            subscription: None,
                            raw,
                        })
                    }
                    // First-cycle invoices are settled by checkout.session.completed.
                    _ => Ok(PaymentEvent {
                        event_type: PaymentEventType::PaymentSuccess,
                        session: None,
                        subscription: None,
                        raw,
                    }),
                }
            }
            (EventType::InvoicePaymentFailed, EventObject::Invoice(_)) => Ok(PaymentEvent {
                event_type: PaymentEventType::PaymentFailed,
                session: None,
                subscription: None,
                raw,
            }),
            (EventType::CustomerSubscriptionUpdated, EventObject::Subscription(sub)) => {
                Ok(PaymentEvent {
                    event_type: PaymentEventType::SubscribeUpdated,
                    session: None,
                    subscription: Some(subscription_details(&sub, SubscriptionCycleType::Renewal)?),
                    raw,
                })
            }
            (EventType::CustomerSubscriptionDeleted, EventObject::Subscription(sub)) => {
                Ok(PaymentEvent {
                    event_type: PaymentEventType::SubscribeCanceled,
                    session: None,
                    subscription: Some(subscription_details(&sub, SubscriptionCycleType::Renewal)?),
                    raw,
                })
            }
            (EventType::ChargeRefunded, _) => Ok(PaymentEvent {
                event_type: PaymentEventType::PaymentRefunded,
                session: None,
                subscription: None,
                raw,
            }),
            (other, _) => Err(PaymentError::UnknownEvent {
                provider: PROVIDER_NAME.to_string(),
                event: other.to_string(),
            }),
        }
    }
}

fn subscription_details(
    sub: &Subscription,
    cycle: SubscriptionCycleType,
) -> PaymentResult<SubscriptionDetails> {
    Ok(SubscriptionDetails {
        provider_subscription_id: sub.id.to_string(),
        status: map_subscription_status(sub.status, sub.cancel_at_period_end).to_string(),
        cycle,
        current_period_start: OffsetDateTime::from_unix_timestamp(sub.current_period_start).ok(),
        current_period_end: OffsetDateTime::from_unix_timestamp(sub.current_period_end).ok(),
        cancel_at_period_end: Some(sub.cancel_at_period_end),
        raw: serde_json::to_value(sub)?,
    })
}

fn map_subscription_status(status: SubscriptionStatus, cancel_at_period_end: bool) -> &'static str {
    match status {
        SubscriptionStatus::Active if cancel_at_period_end => "pending_cancel",
        SubscriptionStatus::Active
        | SubscriptionStatus::PastDue
        | SubscriptionStatus::Incomplete => "active",
        SubscriptionStatus::Trialing => "trialing",
        SubscriptionStatus::Canceled => "canceled",
        SubscriptionStatus::IncompleteExpired | SubscriptionStatus::Unpaid => "expired",
        SubscriptionStatus::Paused => "paused",
    }
}

fn recurring_interval(
    interval: PaymentInterval,
) -> PaymentResult<CreateCheckoutSessionLineItemsPriceDataRecurringInterval> {
    match interval {
        PaymentInterval::Day => Ok(CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Day),
        PaymentInterval::Week => Ok(CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Week),
        PaymentInterval::Month => {
            Ok(CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month)
        }
        PaymentInterval::Year => Ok(CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Year),
        PaymentInterval::OneTime => Err(PaymentError::Validation(
            "one-time prices cannot recur".to_string(),
        )),
    }
}

/// Stripe currencies serialize as lowercase ISO codes, so reuse serde
/// instead of enumerating the whole currency table.
fn parse_currency(code: &str) -> PaymentResult<Currency> {
    serde_json::from_value(Value::String(code.to_lowercase()))
        .map_err(|_| PaymentError::Validation(format!("unsupported currency: {code}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn currency_codes_parse_case_insensitively() {
        assert_eq!(parse_currency("USD").unwrap(), Currency::USD);
        assert_eq!(parse_currency("eur").unwrap(), Currency::EUR);
        assert!(parse_currency("not-a-currency").is_err());
    }

    #[test]
    fn recurring_interval_rejects_one_time() {
        assert!(recurring_interval(PaymentInterval::OneTime).is_err());
        assert!(matches!(
            recurring_interval(PaymentInterval::Month),
            Ok(CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month)
        ));
    }

    #[test]
    fn cancel_flag_maps_to_pending_cancel() {
        assert_eq!(
            map_subscription_status(SubscriptionStatus::Active, true),
            "pending_cancel"
        );
        assert_eq!(
            map_subscription_status(SubscriptionStatus::Active, false),
            "active"
        );
        assert_eq!(
            map_subscription_status(SubscriptionStatus::Unpaid, false),
            "expired"
        );
    }

    #[test]
    fn missing_signature_is_rejected_before_parsing() {
        let provider = StripeProvider::new("sk_test_123".to_string(), Some("whsec_x".to_string()));
        let request = WebhookRequest::new(b"{}".to_vec());
        let err = futures_block(provider.parse_webhook(&request)).unwrap_err();
        assert!(matches!(err, PaymentError::MissingSignature(_)));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let provider = StripeProvider::new("sk_test_123".to_string(), Some("whsec_x".to_string()));
        let request = WebhookRequest::new(b"{}".to_vec())
            .with_header("stripe-signature", "t=1,v1=deadbeef");
        let err = futures_block(provider.parse_webhook(&request)).unwrap_err();
        assert!(matches!(err, PaymentError::SignatureInvalid));
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
