//! Creem adapter.
//!
//! Creem signs webhooks with an HMAC-SHA256 hex digest of the raw body in
//! the `creem-signature` header; verification happens before any parsing.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::model::{
    CheckoutSession, PaymentDetails, PaymentEvent, PaymentEventType, PaymentOrder, PaymentSession,
    PaymentStatus, PaymentType, SubscriptionCycleType, SubscriptionDetails,
};
use crate::provider::{PaymentProvider, WebhookRequest};
use crate::registry::PaymentEnvironment;

pub const PROVIDER_NAME: &str = "creem";

const SIGNATURE_HEADER: &str = "creem-signature";
const PROD_BASE_URL: &str = "https://api.creem.io";
const SANDBOX_BASE_URL: &str = "https://test-api.creem.io";

pub struct CreemProvider {
    client: reqwest::Client,
    api_key: String,
    signing_secret: Option<String>,
    base_url: String,
}

impl CreemProvider {
    pub fn new(
        api_key: String,
        signing_secret: Option<String>,
        environment: PaymentEnvironment,
    ) -> PaymentResult<Self> {
        let base_url = match environment {
            PaymentEnvironment::Production => PROD_BASE_URL,
            PaymentEnvironment::Sandbox => SANDBOX_BASE_URL,
        };
        Ok(Self::with_base_url(api_key, signing_secret, base_url))
    }

    /// Point the adapter at a different API host. Used by tests.
    pub fn with_base_url(
        api_key: String,
        signing_secret: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        CreemProvider {
            client: reqwest::Client::new(),
            api_key,
            signing_secret,
            base_url: base_url.into(),
        }
    }

    fn verify_signature(&self, request: &WebhookRequest) -> PaymentResult<()> {
        let secret = self
            .signing_secret
            .as_deref()
            .ok_or_else(|| PaymentError::Config("creem_signing_secret is not set".to_string()))?;
        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| PaymentError::MissingSignature(SIGNATURE_HEADER.to_string()))?;

        let expected = compute_signature(secret, &request.body);
        if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
            Ok(())
        } else {
            warn!("creem webhook signature rejected");
            Err(PaymentError::SignatureInvalid)
        }
    }

    async fn fetch_checkout(&self, checkout_id: &str) -> PaymentResult<CreemCheckout> {
        let response = self
            .client
            .get(format!("{}/v1/checkouts", self.base_url))
            .query(&[("checkout_id", checkout_id)])
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::vendor(
                PROVIDER_NAME,
                format!("checkout lookup failed: {status}: {body}"),
            ));
        }

        response
            .json::<CreemCheckout>()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))
    }
}

#[async_trait]
impl PaymentProvider for CreemProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn create_checkout(&self, order: &PaymentOrder) -> PaymentResult<CheckoutSession> {
        let product_id = order.price.product_id.as_deref().ok_or_else(|| {
            PaymentError::Validation("creem checkout requires a product id".to_string())
        })?;

        let body = json!({
            "product_id": product_id,
            "request_id": order.order_no,
            "units": 1,
            "success_url": order.success_url,
            "customer": { "email": order.customer.email },
            "metadata": {
                "order_no": order.order_no,
                "user_id": order.customer.user_id,
            },
        });

        let response = self
            .client
            .post(format!("{}/v1/checkouts", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::vendor(
                PROVIDER_NAME,
                format!("checkout create failed: {status}: {body}"),
            ));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;
        let checkout: CreemCheckout = serde_json::from_value(raw.clone())?;

        let checkout_url = checkout.checkout_url.ok_or_else(|| {
            PaymentError::vendor(PROVIDER_NAME, "checkout response has no checkout_url")
        })?;

        info!(
            order_no = %order.order_no,
            session_id = %checkout.id,
            "created creem checkout"
        );

        Ok(CheckoutSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: checkout.id,
            checkout_url,
            checkout_result: raw,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        let checkout = self.fetch_checkout(session_id).await?;
        normalize_checkout(&checkout)
    }

    async fn parse_webhook(&self, request: &WebhookRequest) -> PaymentResult<PaymentEvent> {
        self.verify_signature(request)?;

        let envelope: CreemEvent = serde_json::from_slice(&request.body)?;
        let raw: Value = serde_json::from_slice(&request.body)?;
        debug!(event_type = %envelope.event_type, "creem webhook verified");

        match envelope.event_type.as_str() {
            "checkout.completed" => {
                let checkout: CreemCheckout = serde_json::from_value(envelope.object)?;
                let session = normalize_checkout(&checkout)?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::CheckoutSuccess,
                    session: Some(session),
                    subscription: None,
                    raw,
                })
            }
            "subscription.paid" => {
                let sub: CreemSubscription = serde_json::from_value(envelope.object)?;
                let session = renewal_session(&sub)?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::PaymentSuccess,
                    session: Some(session),
                    subscription: None,
                    raw,
                })
            }
            "subscription.active" | "subscription.update" | "subscription.trialing" => {
                let sub: CreemSubscription = serde_json::from_value(envelope.object)?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::SubscribeUpdated,
                    session: None,
                    subscription: Some(subscription_details(&sub, SubscriptionCycleType::Renewal)?),
                    raw,
                })
            }
            "subscription.canceled" | "subscription.expired" => {
                let sub: CreemSubscription = serde_json::from_value(envelope.object)?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::SubscribeCanceled,
                    session: None,
                    subscription: Some(subscription_details(&sub, SubscriptionCycleType::Renewal)?),
                    raw,
                })
            }
            "refund.created" => Ok(PaymentEvent {
                event_type: PaymentEventType::PaymentRefunded,
                session: None,
                subscription: None,
                raw,
            }),
            other => Err(PaymentError::UnknownEvent {
                provider: PROVIDER_NAME.to_string(),
                event: other.to_string(),
            }),
        }
    }
}

fn compute_signature(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length, new_from_slice cannot fail.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Deserialize)]
struct CreemEvent {
    #[serde(rename = "eventType")]
    event_type: String,
    object: Value,
}

#[derive(Debug, Deserialize)]
struct CreemCheckout {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    checkout_url: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    order: Option<CreemOrder>,
    #[serde(default)]
    subscription: Option<Value>,
    #[serde(default)]
    customer: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CreemOrder {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    transaction: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreemSubscription {
    id: String,
    status: String,
    #[serde(default)]
    current_period_start_date: Option<String>,
    #[serde(default)]
    current_period_end_date: Option<String>,
    #[serde(default)]
    last_transaction_id: Option<String>,
    #[serde(default)]
    last_transaction: Option<CreemOrder>,
    #[serde(default)]
    customer: Option<Value>,
}

fn normalize_checkout(checkout: &CreemCheckout) -> PaymentResult<PaymentSession> {
    let order_no = checkout.request_id.clone().or_else(|| {
        checkout
            .metadata
            .as_ref()
            .and_then(|m| m.get("order_no"))
            .and_then(Value::as_str)
            .map(String::from)
    });

    let raw_status = checkout
        .order
        .as_ref()
        .and_then(|o| o.status.as_deref())
        .unwrap_or(checkout.status.as_str());
    let status = map_payment_status(raw_status)?;

    let subscription = match &checkout.subscription {
        Some(obj @ Value::Object(_)) => {
            let sub: CreemSubscription = serde_json::from_value(obj.clone())?;
            Some(subscription_details(&sub, SubscriptionCycleType::Create)?)
        }
        Some(Value::String(id)) => Some(SubscriptionDetails {
            provider_subscription_id: id.clone(),
            status: "active".to_string(),
            cycle: SubscriptionCycleType::Create,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            raw: Value::String(id.clone()),
        }),
        _ => None,
    };

    let payment_type = if subscription.is_some() {
        PaymentType::Subscription
    } else {
        PaymentType::OneTime
    };

    let payment = PaymentDetails {
        transaction_id: checkout.order.as_ref().and_then(|o| o.transaction.clone()),
        amount: checkout.order.as_ref().and_then(|o| o.amount),
        currency: checkout.order.as_ref().and_then(|o| o.currency.clone()),
        paid_at: None,
        customer_email: extract_email(checkout.customer.as_ref()),
    };

    Ok(PaymentSession {
        provider: PROVIDER_NAME.to_string(),
        session_id: checkout.id.clone(),
        order_no,
        status,
        payment_type,
        payment,
        subscription,
    })
}

fn renewal_session(sub: &CreemSubscription) -> PaymentResult<PaymentSession> {
    let transaction_id = sub
        .last_transaction_id
        .clone()
        .or_else(|| {
            sub.last_transaction
                .as_ref()
                .and_then(|t| t.transaction.clone())
        })
        .ok_or_else(|| {
            PaymentError::vendor(PROVIDER_NAME, "subscription.paid without transaction id")
        })?;

    let payment = PaymentDetails {
        transaction_id: Some(transaction_id),
        amount: sub.last_transaction.as_ref().and_then(|t| t.amount),
        currency: sub.last_transaction.as_ref().and_then(|t| t.currency.clone()),
        paid_at: None,
        customer_email: extract_email(sub.customer.as_ref()),
    };

    Ok(PaymentSession {
        provider: PROVIDER_NAME.to_string(),
        session_id: sub.id.clone(),
        order_no: None,
        status: PaymentStatus::Success,
        payment_type: PaymentType::Renew,
        payment,
        subscription: Some(subscription_details(sub, SubscriptionCycleType::Renewal)?),
    })
}

fn subscription_details(
    sub: &CreemSubscription,
    cycle: SubscriptionCycleType,
) -> PaymentResult<SubscriptionDetails> {
    Ok(SubscriptionDetails {
        provider_subscription_id: sub.id.clone(),
        status: map_subscription_status(&sub.status)?.to_string(),
        cycle,
        current_period_start: parse_rfc3339(sub.current_period_start_date.as_deref()),
        current_period_end: parse_rfc3339(sub.current_period_end_date.as_deref()),
        cancel_at_period_end: None,
        raw: json!({ "id": sub.id, "status": sub.status }),
    })
}

fn map_payment_status(status: &str) -> PaymentResult<PaymentStatus> {
    match status {
        "paid" | "completed" => Ok(PaymentStatus::Success),
        "pending" | "processing" => Ok(PaymentStatus::Processing),
        "failed" => Ok(PaymentStatus::Failed),
        "canceled" | "cancelled" | "expired" => Ok(PaymentStatus::Cancelled),
        other => Err(PaymentError::UnknownStatus {
            provider: PROVIDER_NAME.to_string(),
            status: other.to_string(),
        }),
    }
}

fn map_subscription_status(status: &str) -> PaymentResult<&'static str> {
    match status {
        "active" => Ok("active"),
        "trialing" => Ok("trialing"),
        "canceled" | "cancelled" => Ok("canceled"),
        "expired" | "unpaid" => Ok("expired"),
        "paused" => Ok("paused"),
        other => Err(PaymentError::UnknownStatus {
            provider: PROVIDER_NAME.to_string(),
            status: other.to_string(),
        }),
    }
}

fn parse_rfc3339(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
}

fn extract_email(customer: Option<&Value>) -> Option<String> {
    customer
        .and_then(|c| c.get("email"))
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{PaymentCustomer, PaymentInterval, PaymentPrice};

    fn provider(base_url: &str) -> CreemProvider {
        CreemProvider::with_base_url(
            "ck_test_123".to_string(),
            Some("whsec_creem".to_string()),
            base_url,
        )
    }

    fn sample_order() -> PaymentOrder {
        PaymentOrder {
            order_no: "20260830001".to_string(),
            payment_type: PaymentType::OneTime,
            price: PaymentPrice {
                currency: "usd".to_string(),
                amount: 990,
                interval: PaymentInterval::OneTime,
                product_id: Some("prod_abc".to_string()),
                product_name: "Starter".to_string(),
            },
            customer: PaymentCustomer {
                user_id: "user-1".to_string(),
                email: "buyer@example.com".to_string(),
            },
            success_url: "https://app.example.com/api/payment/callback?order_no=20260830001"
                .to_string(),
            cancel_url: "https://app.example.com/pricing".to_string(),
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn create_checkout_posts_request_id_and_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/checkouts")
            .match_header("x-api-key", "ck_test_123")
            .match_body(mockito::Matcher::PartialJson(json!({
                "product_id": "prod_abc",
                "request_id": "20260830001",
            })))
            .with_status(200)
            .with_body(
                json!({
                    "id": "ch_123",
                    "status": "pending",
                    "checkout_url": "https://creem.io/pay/ch_123"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = provider(&server.url())
            .create_checkout(&sample_order())
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(session.session_id, "ch_123");
        assert_eq!(session.checkout_url, "https://creem.io/pay/ch_123");
    }

    #[tokio::test]
    async fn create_checkout_requires_product_id() {
        let mut order = sample_order();
        order.price.product_id = None;
        let err = provider("http://localhost:1")
            .create_checkout(&order)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn retrieve_session_normalizes_paid_checkout() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/checkouts")
            .match_query(mockito::Matcher::UrlEncoded(
                "checkout_id".into(),
                "ch_123".into(),
            ))
            .with_status(200)
            .with_body(
                json!({
                    "id": "ch_123",
                    "status": "completed",
                    "request_id": "20260830001",
                    "order": {
                        "status": "paid",
                        "amount": 990,
                        "currency": "usd",
                        "transaction": "txn_9"
                    },
                    "customer": { "id": "cus_1", "email": "buyer@example.com" }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = provider(&server.url())
            .retrieve_session("ch_123")
            .await
            .unwrap();
        assert_eq!(session.order_no.as_deref(), Some("20260830001"));
        assert_eq!(session.status, PaymentStatus::Success);
        assert_eq!(session.payment_type, PaymentType::OneTime);
        assert_eq!(session.payment.transaction_id.as_deref(), Some("txn_9"));
    }

    #[tokio::test]
    async fn webhook_rejects_bad_signature_before_parsing() {
        let p = provider("http://localhost:1");
        let body = b"not even json".to_vec();
        let request = WebhookRequest::new(body).with_header(SIGNATURE_HEADER, "deadbeef");
        let err = p.parse_webhook(&request).await.unwrap_err();
        assert!(matches!(err, PaymentError::SignatureInvalid));
    }

    #[tokio::test]
    async fn webhook_requires_signature_header() {
        let p = provider("http://localhost:1");
        let request = WebhookRequest::new(b"{}".to_vec());
        let err = p.parse_webhook(&request).await.unwrap_err();
        assert!(matches!(err, PaymentError::MissingSignature(_)));
    }

    #[tokio::test]
    async fn webhook_accepts_valid_signature() {
        let p = provider("http://localhost:1");
        let body = json!({
            "id": "evt_1",
            "eventType": "checkout.completed",
            "object": {
                "id": "ch_123",
                "status": "completed",
                "request_id": "20260830001",
                "order": { "status": "paid", "amount": 990, "currency": "usd" }
            }
        })
        .to_string()
        .into_bytes();
        let signature = compute_signature("whsec_creem", &body);
        let request = WebhookRequest::new(body).with_header(SIGNATURE_HEADER, &signature);

        let event = p.parse_webhook(&request).await.unwrap();
        assert_eq!(event.event_type, PaymentEventType::CheckoutSuccess);
        let session = event.session.unwrap();
        assert_eq!(session.order_no.as_deref(), Some("20260830001"));
        assert_eq!(session.status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn webhook_renewal_carries_transaction_id() {
        let p = provider("http://localhost:1");
        let body = json!({
            "id": "evt_2",
            "eventType": "subscription.paid",
            "object": {
                "id": "sub_1",
                "status": "active",
                "last_transaction_id": "txn_42",
                "current_period_start_date": "2026-08-01T00:00:00Z",
                "current_period_end_date": "2026-09-01T00:00:00Z"
            }
        })
        .to_string()
        .into_bytes();
        let signature = compute_signature("whsec_creem", &body);
        let request = WebhookRequest::new(body).with_header(SIGNATURE_HEADER, &signature);

        let event = p.parse_webhook(&request).await.unwrap();
        assert_eq!(event.event_type, PaymentEventType::PaymentSuccess);
        let session = event.session.unwrap();
        assert_eq!(session.payment_type, PaymentType::Renew);
        assert_eq!(session.payment.transaction_id.as_deref(), Some("txn_42"));
        let sub = session.subscription.unwrap();
        assert_eq!(sub.cycle, SubscriptionCycleType::Renewal);
        assert!(sub.current_period_end.is_some());
    }

    #[tokio::test]
    async fn unknown_event_type_is_an_error() {
        let p = provider("http://localhost:1");
        let body = json!({ "id": "evt_3", "eventType": "dispute.created", "object": {} })
            .to_string()
            .into_bytes();
        let signature = compute_signature("whsec_creem", &body);
        let request = WebhookRequest::new(body).with_header(SIGNATURE_HEADER, &signature);

        let err = p.parse_webhook(&request).await.unwrap_err();
        assert!(matches!(err, PaymentError::UnknownEvent { .. }));
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(matches!(
            map_payment_status("weird"),
            Err(PaymentError::UnknownStatus { .. })
        ));
        assert!(map_subscription_status("active").is_ok());
        assert!(map_subscription_status("weird").is_err());
    }
}
