//! PayPal adapter.
//!
//! One-time purchases go through the Orders v2 API; subscriptions go through
//! Catalog Products, Billing Plans, and Billing Subscriptions. Webhooks are
//! verified server-side via the verify-webhook-signature endpoint, so the
//! adapter needs live credentials even to accept a delivery.
//!
//! The originating order number rides along as `custom_id` on orders and
//! subscriptions so webhook resources can be tied back to our ledger.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PaymentError, PaymentResult};
use crate::model::{
    CheckoutSession, PaymentDetails, PaymentEvent, PaymentEventType, PaymentInterval,
    PaymentOrder, PaymentSession, PaymentStatus, PaymentType, SubscriptionCycleType,
    SubscriptionDetails,
};
use crate::provider::{PaymentProvider, WebhookRequest};
use crate::registry::PaymentEnvironment;

pub const PROVIDER_NAME: &str = "paypal";

const PROD_BASE_URL: &str = "https://api-m.paypal.com";
const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";

const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-transmission-id",
    "paypal-transmission-time",
    "paypal-transmission-sig",
    "paypal-cert-url",
    "paypal-auth-algo",
];

struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

pub struct PayPalProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    webhook_id: Option<String>,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalProvider {
    pub fn new(
        client_id: String,
        client_secret: String,
        webhook_id: Option<String>,
        environment: PaymentEnvironment,
    ) -> PaymentResult<Self> {
        let base_url = match environment {
            PaymentEnvironment::Production => PROD_BASE_URL,
            PaymentEnvironment::Sandbox => SANDBOX_BASE_URL,
        };
        Ok(Self::with_base_url(
            client_id,
            client_secret,
            webhook_id,
            base_url,
        ))
    }

    /// Point the adapter at a different API host. Used by tests.
    pub fn with_base_url(
        client_id: String,
        client_secret: String,
        webhook_id: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        PayPalProvider {
            client: reqwest::Client::new(),
            client_id,
            client_secret,
            webhook_id,
            base_url: base_url.into(),
            token: Mutex::new(None),
        }
    }

    /// Client-credentials token, cached until shortly before expiry.
    async fn access_token(&self) -> PaymentResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > OffsetDateTime::now_utc() + Duration::seconds(60) {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(PaymentError::vendor(
                PROVIDER_NAME,
                format!("oauth token request failed: {status}"),
            ));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        let access_token = token.access_token.clone();
        *guard = Some(CachedToken {
            access_token: token.access_token,
            expires_at: OffsetDateTime::now_utc() + Duration::seconds(token.expires_in),
        });
        Ok(access_token)
    }

    async fn post_json(&self, path: &str, body: &Value) -> PaymentResult<Value> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::vendor(
                PROVIDER_NAME,
                format!("{path} failed: {status}: {body}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))
    }

    async fn get_json(&self, path: &str) -> PaymentResult<Value> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(PaymentError::vendor(
                PROVIDER_NAME,
                format!("{path} failed: {status}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| PaymentError::vendor(PROVIDER_NAME, e.to_string()))
    }

    async fn create_one_time_checkout(
        &self,
        order: &PaymentOrder,
    ) -> PaymentResult<CheckoutSession> {
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "custom_id": order.order_no,
                "description": order.price.product_name,
                "amount": {
                    "currency_code": order.price.currency.to_uppercase(),
                    "value": format_amount(order.price.amount),
                },
            }],
            "payment_source": {
                "paypal": {
                    "experience_context": {
                        "return_url": order.success_url,
                        "cancel_url": order.cancel_url,
                        "user_action": "PAY_NOW",
                    }
                }
            },
        });

        let raw = self.post_json("/v2/checkout/orders", &body).await?;
        let id = string_field(&raw, "id")
            .ok_or_else(|| PaymentError::vendor(PROVIDER_NAME, "order response has no id"))?;
        let checkout_url = approve_link(&raw).ok_or_else(|| {
            PaymentError::vendor(PROVIDER_NAME, "order response has no approval link")
        })?;

        Ok(CheckoutSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: id,
            checkout_url,
            checkout_result: raw,
        })
    }

    async fn create_subscription_checkout(
        &self,
        order: &PaymentOrder,
    ) -> PaymentResult<CheckoutSession> {
        // A pinned catalog product id skips product creation.
        let product_id = match &order.price.product_id {
            Some(id) => id.clone(),
            None => {
                let product = self
                    .post_json(
                        "/v1/catalogs/products",
                        &json!({
                            "name": order.price.product_name,
                            "type": "SERVICE",
                        }),
                    )
                    .await?;
                string_field(&product, "id").ok_or_else(|| {
                    PaymentError::vendor(PROVIDER_NAME, "product response has no id")
                })?
            }
        };

        let plan = self
            .post_json(
                "/v1/billing/plans",
                &json!({
                    "product_id": product_id,
                    "name": order.price.product_name,
                    "billing_cycles": [{
                        "frequency": {
                            "interval_unit": interval_unit(order.price.interval)?,
                            "interval_count": 1,
                        },
                        "tenure_type": "REGULAR",
                        "sequence": 1,
                        "total_cycles": 0,
                        "pricing_scheme": {
                            "fixed_price": {
                                "currency_code": order.price.currency.to_uppercase(),
                                "value": format_amount(order.price.amount),
                            }
                        },
                    }],
                    "payment_preferences": { "auto_bill_outstanding": true },
                }),
            )
            .await?;
        let plan_id = string_field(&plan, "id")
            .ok_or_else(|| PaymentError::vendor(PROVIDER_NAME, "plan response has no id"))?;

        let subscription = self
            .post_json(
                "/v1/billing/subscriptions",
                &json!({
                    "plan_id": plan_id,
                    "custom_id": order.order_no,
                    "subscriber": { "email_address": order.customer.email },
                    "application_context": {
                        "return_url": order.success_url,
                        "cancel_url": order.cancel_url,
                        "user_action": "SUBSCRIBE_NOW",
                    },
                }),
            )
            .await?;
        let id = string_field(&subscription, "id").ok_or_else(|| {
            PaymentError::vendor(PROVIDER_NAME, "subscription response has no id")
        })?;
        let checkout_url = approve_link(&subscription).ok_or_else(|| {
            PaymentError::vendor(PROVIDER_NAME, "subscription response has no approval link")
        })?;

        Ok(CheckoutSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: id,
            checkout_url,
            checkout_result: subscription,
        })
    }

    async fn retrieve_order(&self, order_id: &str) -> PaymentResult<PaymentSession> {
        let raw = self.get_json(&format!("/v2/checkout/orders/{order_id}")).await?;
        let status = string_field(&raw, "status").unwrap_or_default();
        let unit = raw
            .get("purchase_units")
            .and_then(Value::as_array)
            .and_then(|units| units.first());

        let order_no = unit
            .and_then(|u| u.get("custom_id"))
            .and_then(Value::as_str)
            .map(String::from);

        let capture = unit
            .and_then(|u| u.pointer("/payments/captures/0"))
            .cloned()
            .unwrap_or(Value::Null);

        let payment = PaymentDetails {
            transaction_id: string_field(&capture, "id"),
            amount: capture
                .pointer("/amount/value")
                .and_then(Value::as_str)
                .and_then(parse_amount),
            currency: capture
                .pointer("/amount/currency_code")
                .and_then(Value::as_str)
                .map(str::to_lowercase),
            paid_at: string_field(&capture, "create_time")
                .and_then(|t| OffsetDateTime::parse(&t, &Rfc3339).ok()),
            customer_email: raw
                .pointer("/payer/email_address")
                .and_then(Value::as_str)
                .map(String::from),
        };

        Ok(PaymentSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: order_id.to_string(),
            order_no,
            status: map_order_status(&status)?,
            payment_type: PaymentType::OneTime,
            payment,
            subscription: None,
        })
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> PaymentResult<PaymentSession> {
        let raw = self
            .get_json(&format!("/v1/billing/subscriptions/{subscription_id}"))
            .await?;
        let status = string_field(&raw, "status").unwrap_or_default();
        let order_no = string_field(&raw, "custom_id");

        let payment = PaymentDetails {
            transaction_id: None,
            amount: raw
                .pointer("/billing_info/last_payment/amount/value")
                .and_then(Value::as_str)
                .and_then(parse_amount),
            currency: raw
                .pointer("/billing_info/last_payment/amount/currency_code")
                .and_then(Value::as_str)
                .map(str::to_lowercase),
            paid_at: raw
                .pointer("/billing_info/last_payment/time")
                .and_then(Value::as_str)
                .and_then(|t| OffsetDateTime::parse(t, &Rfc3339).ok()),
            customer_email: raw
                .pointer("/subscriber/email_address")
                .and_then(Value::as_str)
                .map(String::from),
        };

        Ok(PaymentSession {
            provider: PROVIDER_NAME.to_string(),
            session_id: subscription_id.to_string(),
            order_no,
            status: subscription_payment_status(&status)?,
            payment_type: PaymentType::Subscription,
            payment,
            subscription: Some(subscription_details_from_value(
                &raw,
                SubscriptionCycleType::Create,
            )?),
        })
    }

    async fn verify_signature(&self, request: &WebhookRequest, event: &Value) -> PaymentResult<()> {
        let webhook_id = self
            .webhook_id
            .as_deref()
            .ok_or_else(|| PaymentError::Config("paypal_webhook_id is not set".to_string()))?;

        let mut verification = serde_json::Map::new();
        for header in TRANSMISSION_HEADERS {
            let value = request
                .header(header)
                .ok_or_else(|| PaymentError::MissingSignature(header.to_string()))?;
            // paypal-transmission-id -> transmission_id, paypal-auth-algo -> auth_algo
            let key = header.trim_start_matches("paypal-").replace('-', "_");
            verification.insert(key, Value::String(value.to_string()));
        }
        verification.insert("webhook_id".to_string(), Value::String(webhook_id.into()));
        verification.insert("webhook_event".to_string(), event.clone());

        let result = self
            .post_json(
                "/v1/notifications/verify-webhook-signature",
                &Value::Object(verification),
            )
            .await?;

        match string_field(&result, "verification_status").as_deref() {
            Some("SUCCESS") => Ok(()),
            _ => {
                warn!("paypal webhook signature rejected");
                Err(PaymentError::SignatureInvalid)
            }
        }
    }
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn create_checkout(&self, order: &PaymentOrder) -> PaymentResult<CheckoutSession> {
        let session = if order.price.interval.is_recurring() {
            self.create_subscription_checkout(order).await?
        } else {
            self.create_one_time_checkout(order).await?
        };
        info!(
            order_no = %order.order_no,
            session_id = %session.session_id,
            "created paypal checkout"
        );
        Ok(session)
    }

    async fn retrieve_session(&self, session_id: &str) -> PaymentResult<PaymentSession> {
        // Billing subscription ids carry an I- prefix; everything else is
        // an Orders v2 id.
        if session_id.starts_with("I-") {
            self.retrieve_subscription(session_id).await
        } else {
            self.retrieve_order(session_id).await
        }
    }

    async fn parse_webhook(&self, request: &WebhookRequest) -> PaymentResult<PaymentEvent> {
        let raw: Value = serde_json::from_slice(&request.body)?;
        self.verify_signature(request, &raw).await?;

        let event_type = string_field(&raw, "event_type").unwrap_or_default();
        let resource = raw.get("resource").cloned().unwrap_or(Value::Null);
        debug!(event_type = %event_type, "paypal webhook verified");

        match event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => {
                let session = capture_session(&resource)?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::CheckoutSuccess,
                    session: Some(session),
                    subscription: None,
                    raw,
                })
            }
            "BILLING.SUBSCRIPTION.ACTIVATED" => {
                let session = PaymentSession {
                    provider: PROVIDER_NAME.to_string(),
                    session_id: string_field(&resource, "id").unwrap_or_default(),
                    order_no: string_field(&resource, "custom_id"),
                    status: PaymentStatus::Success,
                    payment_type: PaymentType::Subscription,
                    payment: PaymentDetails::default(),
                    subscription: Some(subscription_details_from_value(
                        &resource,
                        SubscriptionCycleType::Create,
                    )?),
                };
                Ok(PaymentEvent {
                    event_type: PaymentEventType::CheckoutSuccess,
                    session: Some(session),
                    subscription: None,
                    raw,
                })
            }
            "PAYMENT.SALE.COMPLETED" => {
                let session = sale_session(&resource)?;
                Ok(PaymentEvent {
                    event_type: PaymentEventType::PaymentSuccess,
                    session: Some(session),
                    subscription: None,
                    raw,
                })
            }
            "BILLING.SUBSCRIPTION.UPDATED" | "BILLING.SUBSCRIPTION.SUSPENDED" => {
                Ok(PaymentEvent {
                    event_type: PaymentEventType::SubscribeUpdated,
                    session: None,
                    subscription: Some(subscription_details_from_value(
                        &resource,
                        SubscriptionCycleType::Renewal,
                    )?),
                    raw,
                })
            }
            "BILLING.SUBSCRIPTION.CANCELLED" | "BILLING.SUBSCRIPTION.EXPIRED" => {
                Ok(PaymentEvent {
                    event_type: PaymentEventType::SubscribeCanceled,
                    session: None,
                    subscription: Some(subscription_details_from_value(
                        &resource,
                        SubscriptionCycleType::Renewal,
                    )?),
                    raw,
                })
            }
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.SALE.REFUNDED" => Ok(PaymentEvent {
                event_type: PaymentEventType::PaymentRefunded,
                session: None,
                subscription: None,
                raw,
            }),
            "PAYMENT.CAPTURE.DENIED" | "PAYMENT.SALE.DENIED" => Ok(PaymentEvent {
                event_type: PaymentEventType::PaymentFailed,
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

fn capture_session(resource: &Value) -> PaymentResult<PaymentSession> {
    let session_id = resource
        .pointer("/supplementary_data/related_ids/order_id")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| string_field(resource, "id"))
        .unwrap_or_default();

    let payment = PaymentDetails {
        transaction_id: string_field(resource, "id"),
        amount: resource
            .pointer("/amount/value")
            .and_then(Value::as_str)
            .and_then(parse_amount),
        currency: resource
            .pointer("/amount/currency_code")
            .and_then(Value::as_str)
            .map(str::to_lowercase),
        paid_at: string_field(resource, "create_time")
            .and_then(|t| OffsetDateTime::parse(&t, &Rfc3339).ok()),
        customer_email: None,
    };

    Ok(PaymentSession {
        provider: PROVIDER_NAME.to_string(),
        session_id,
        order_no: string_field(resource, "custom_id"),
        status: PaymentStatus::Success,
        payment_type: PaymentType::OneTime,
        payment,
        subscription: None,
    })
}

fn sale_session(resource: &Value) -> PaymentResult<PaymentSession> {
    let subscription_id = string_field(resource, "billing_agreement_id").ok_or_else(|| {
        PaymentError::vendor(PROVIDER_NAME, "sale without billing_agreement_id")
    })?;
    let transaction_id = string_field(resource, "id")
        .ok_or_else(|| PaymentError::vendor(PROVIDER_NAME, "sale without id"))?;

    let payment = PaymentDetails {
        transaction_id: Some(transaction_id),
        amount: resource
            .pointer("/amount/total")
            .and_then(Value::as_str)
            .and_then(parse_amount),
        currency: resource
            .pointer("/amount/currency")
            .and_then(Value::as_str)
            .map(str::to_lowercase),
        paid_at: string_field(resource, "create_time")
            .and_then(|t| OffsetDateTime::parse(&t, &Rfc3339).ok()),
        customer_email: None,
    };

    Ok(PaymentSession {
        provider: PROVIDER_NAME.to_string(),
        session_id: subscription_id.clone(),
        // Round-tripped order number of the originating checkout, when the
        // sale carries one.
        order_no: string_field(resource, "custom"),
        status: PaymentStatus::Success,
        payment_type: PaymentType::Renew,
        payment,
        subscription: Some(SubscriptionDetails {
            provider_subscription_id: subscription_id,
            status: "active".to_string(),
            cycle: SubscriptionCycleType::Renewal,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            raw: resource.clone(),
        }),
    })
}

fn subscription_details_from_value(
    resource: &Value,
    cycle: SubscriptionCycleType,
) -> PaymentResult<SubscriptionDetails> {
    let id = string_field(resource, "id")
        .ok_or_else(|| PaymentError::vendor(PROVIDER_NAME, "subscription without id"))?;
    let status = string_field(resource, "status").unwrap_or_default();

    let period_start = resource
        .pointer("/billing_info/last_payment/time")
        .and_then(Value::as_str)
        .and_then(|t| OffsetDateTime::parse(t, &Rfc3339).ok());
    let period_end = resource
        .pointer("/billing_info/next_billing_time")
        .and_then(Value::as_str)
        .and_then(|t| OffsetDateTime::parse(t, &Rfc3339).ok());

    Ok(SubscriptionDetails {
        provider_subscription_id: id,
        status: map_subscription_status(&status)?.to_string(),
        cycle,
        current_period_start: period_start,
        current_period_end: period_end,
        cancel_at_period_end: None,
        raw: resource.clone(),
    })
}

fn map_order_status(status: &str) -> PaymentResult<PaymentStatus> {
    match status {
        "COMPLETED" => Ok(PaymentStatus::Success),
        "CREATED" | "SAVED" | "APPROVED" | "PAYER_ACTION_REQUIRED" => Ok(PaymentStatus::Processing),
        "VOIDED" => Ok(PaymentStatus::Cancelled),
        other => Err(PaymentError::UnknownStatus {
            provider: PROVIDER_NAME.to_string(),
            status: other.to_string(),
        }),
    }
}

fn subscription_payment_status(status: &str) -> PaymentResult<PaymentStatus> {
    match status {
        "ACTIVE" => Ok(PaymentStatus::Success),
        "APPROVAL_PENDING" | "APPROVED" => Ok(PaymentStatus::Processing),
        "CANCELLED" | "EXPIRED" => Ok(PaymentStatus::Cancelled),
        "SUSPENDED" => Ok(PaymentStatus::Failed),
        other => Err(PaymentError::UnknownStatus {
            provider: PROVIDER_NAME.to_string(),
            status: other.to_string(),
        }),
    }
}

fn map_subscription_status(status: &str) -> PaymentResult<&'static str> {
    match status {
        "ACTIVE" => Ok("active"),
        "APPROVAL_PENDING" | "APPROVED" => Ok("trialing"),
        "CANCELLED" => Ok("canceled"),
        "EXPIRED" => Ok("expired"),
        "SUSPENDED" => Ok("paused"),
        other => Err(PaymentError::UnknownStatus {
            provider: PROVIDER_NAME.to_string(),
            status: other.to_string(),
        }),
    }
}

fn interval_unit(interval: PaymentInterval) -> PaymentResult<&'static str> {
    match interval {
        PaymentInterval::Day => Ok("DAY"),
        PaymentInterval::Week => Ok("WEEK"),
        PaymentInterval::Month => Ok("MONTH"),
        PaymentInterval::Year => Ok("YEAR"),
        PaymentInterval::OneTime => Err(PaymentError::Validation(
            "one-time prices cannot recur".to_string(),
        )),
    }
}

/// Minor units to PayPal's decimal string, e.g. 990 -> "9.90".
fn format_amount(minor_units: i64) -> String {
    format!("{}.{:02}", minor_units / 100, (minor_units % 100).abs())
}

/// Decimal string back to minor units.
fn parse_amount(value: &str) -> Option<i64> {
    let mut parts = value.splitn(2, '.');
    let whole: i64 = parts.next()?.parse().ok()?;
    let cents = match parts.next() {
        Some(frac) => {
            let mut padded = frac.to_string();
            while padded.len() < 2 {
                padded.push('0');
            }
            padded[..2].parse::<i64>().ok()?
        }
        None => 0,
    };
    Some(whole * 100 + cents)
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(String::from)
}

fn approve_link(value: &Value) -> Option<String> {
    value
        .get("links")
        .and_then(Value::as_array)?
        .iter()
        .find(|link| link.get("rel").and_then(Value::as_str) == Some("approve"))
        .and_then(|link| link.get("href"))
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{PaymentCustomer, PaymentPrice};

    fn provider(base_url: &str) -> PayPalProvider {
        PayPalProvider::with_base_url(
            "client-id".to_string(),
            "client-secret".to_string(),
            Some("WH-123".to_string()),
            base_url,
        )
    }

    async fn token_mock(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(json!({ "access_token": "A.token", "expires_in": 3600 }).to_string())
            .create_async()
            .await
    }

    fn sample_order(interval: PaymentInterval) -> PaymentOrder {
        PaymentOrder {
            order_no: "20260830002".to_string(),
            payment_type: if interval.is_recurring() {
                PaymentType::Subscription
            } else {
                PaymentType::OneTime
            },
            price: PaymentPrice {
                currency: "usd".to_string(),
                amount: 1990,
                interval,
                product_id: None,
                product_name: "Pro".to_string(),
            },
            customer: PaymentCustomer {
                user_id: "user-2".to_string(),
                email: "buyer@example.com".to_string(),
            },
            success_url: "https://app.example.com/api/payment/callback?order_no=20260830002"
                .to_string(),
            cancel_url: "https://app.example.com/pricing".to_string(),
            metadata: Value::Null,
        }
    }

    #[test]
    fn amounts_format_and_parse() {
        assert_eq!(format_amount(990), "9.90");
        assert_eq!(format_amount(1900), "19.00");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(parse_amount("9.90"), Some(990));
        assert_eq!(parse_amount("19"), Some(1900));
        assert_eq!(parse_amount("0.5"), Some(50));
        assert_eq!(parse_amount("oops"), None);
    }

    #[test]
    fn unknown_statuses_are_errors() {
        assert!(matches!(
            map_order_status("WEIRD"),
            Err(PaymentError::UnknownStatus { .. })
        ));
        assert!(matches!(
            map_subscription_status("WEIRD"),
            Err(PaymentError::UnknownStatus { .. })
        ));
        assert_eq!(map_order_status("COMPLETED").unwrap(), PaymentStatus::Success);
    }

    #[tokio::test]
    async fn one_time_checkout_returns_approval_link() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let order_mock = server
            .mock("POST", "/v2/checkout/orders")
            .match_body(mockito::Matcher::PartialJson(json!({
                "intent": "CAPTURE",
                "purchase_units": [{ "custom_id": "20260830002" }],
            })))
            .with_status(201)
            .with_body(
                json!({
                    "id": "5O190127TN364715T",
                    "status": "CREATED",
                    "links": [
                        { "rel": "self", "href": "https://api-m.paypal.com/v2/checkout/orders/5O190127TN364715T" },
                        { "rel": "approve", "href": "https://www.paypal.com/checkoutnow?token=5O190127TN364715T" }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = provider(&server.url())
            .create_checkout(&sample_order(PaymentInterval::OneTime))
            .await
            .unwrap();
        order_mock.assert_async().await;
        assert_eq!(session.session_id, "5O190127TN364715T");
        assert!(session.checkout_url.contains("checkoutnow"));
    }

    #[tokio::test]
    async fn subscription_checkout_creates_product_plan_subscription() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let product = server
            .mock("POST", "/v1/catalogs/products")
            .with_status(201)
            .with_body(json!({ "id": "PROD-1" }).to_string())
            .create_async()
            .await;
        let plan = server
            .mock("POST", "/v1/billing/plans")
            .match_body(mockito::Matcher::PartialJson(json!({ "product_id": "PROD-1" })))
            .with_status(201)
            .with_body(json!({ "id": "P-1" }).to_string())
            .create_async()
            .await;
        let subscription = server
            .mock("POST", "/v1/billing/subscriptions")
            .match_body(mockito::Matcher::PartialJson(json!({
                "plan_id": "P-1",
                "custom_id": "20260830002",
            })))
            .with_status(201)
            .with_body(
                json!({
                    "id": "I-BW452GLLEP1G",
                    "status": "APPROVAL_PENDING",
                    "links": [
                        { "rel": "approve", "href": "https://www.paypal.com/webapps/billing/subscriptions?ba_token=BA-1" }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let session = provider(&server.url())
            .create_checkout(&sample_order(PaymentInterval::Month))
            .await
            .unwrap();
        product.assert_async().await;
        plan.assert_async().await;
        subscription.assert_async().await;
        assert_eq!(session.session_id, "I-BW452GLLEP1G");
    }

    #[tokio::test]
    async fn webhook_is_verified_server_side() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        let verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .match_body(mockito::Matcher::PartialJson(json!({
                "webhook_id": "WH-123",
                "transmission_id": "tid-1",
            })))
            .with_status(200)
            .with_body(json!({ "verification_status": "SUCCESS" }).to_string())
            .create_async()
            .await;

        let body = json!({
            "event_type": "PAYMENT.SALE.COMPLETED",
            "resource": {
                "id": "SALE-1",
                "billing_agreement_id": "I-BW452GLLEP1G",
                "amount": { "total": "19.90", "currency": "USD" },
                "create_time": "2026-08-30T10:00:00Z"
            }
        })
        .to_string()
        .into_bytes();

        let request = WebhookRequest::new(body)
            .with_header("paypal-transmission-id", "tid-1")
            .with_header("paypal-transmission-time", "2026-08-30T10:00:01Z")
            .with_header("paypal-transmission-sig", "sig")
            .with_header("paypal-cert-url", "https://api.paypal.com/cert")
            .with_header("paypal-auth-algo", "SHA256withRSA");

        let event = provider(&server.url()).parse_webhook(&request).await.unwrap();
        verify.assert_async().await;
        assert_eq!(event.event_type, PaymentEventType::PaymentSuccess);
        let session = event.session.unwrap();
        assert_eq!(session.payment_type, PaymentType::Renew);
        assert_eq!(session.payment.transaction_id.as_deref(), Some("SALE-1"));
        assert_eq!(session.payment.amount, Some(1990));
    }

    #[tokio::test]
    async fn failed_verification_rejects_the_event() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server).await;
        server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(json!({ "verification_status": "FAILURE" }).to_string())
            .create_async()
            .await;

        let body = json!({ "event_type": "PAYMENT.SALE.COMPLETED", "resource": {} })
            .to_string()
            .into_bytes();
        let request = WebhookRequest::new(body)
            .with_header("paypal-transmission-id", "tid-1")
            .with_header("paypal-transmission-time", "t")
            .with_header("paypal-transmission-sig", "sig")
            .with_header("paypal-cert-url", "https://api.paypal.com/cert")
            .with_header("paypal-auth-algo", "SHA256withRSA");

        let err = provider(&server.url()).parse_webhook(&request).await.unwrap_err();
        assert!(matches!(err, PaymentError::SignatureInvalid));
    }

    #[tokio::test]
    async fn missing_transmission_header_is_rejected_without_api_call() {
        let body = json!({ "event_type": "PAYMENT.SALE.COMPLETED", "resource": {} })
            .to_string()
            .into_bytes();
        let request = WebhookRequest::new(body);
        let err = provider("http://localhost:1")
            .parse_webhook(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::MissingSignature(_)));
    }
}
