//! The vendor adapter contract.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::PaymentResult;
use crate::model::{CheckoutSession, PaymentEvent, PaymentOrder, PaymentSession};

/// A raw webhook delivery, captured before any parsing.
///
/// Header names are stored lowercase; adapters must verify the vendor
/// signature against `body` before deserializing it.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl WebhookRequest {
    pub fn new(body: Vec<u8>) -> Self {
        WebhookRequest {
            body,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// One payment vendor integration.
///
/// Implementations translate between the vendor's wire formats and the
/// canonical model; nothing outside an adapter sees vendor payloads.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Stable provider name used in order rows and webhook routes.
    fn name(&self) -> &'static str;

    /// Create a vendor checkout session for an order.
    async fn create_checkout(&self, order: &PaymentOrder) -> PaymentResult<CheckoutSession>;

    /// Fetch a session from the vendor and normalize it. Used by the
    /// callback path, where only a session id is trustworthy.
    async fn retrieve_session(&self, session_id: &str) -> PaymentResult<PaymentSession>;

    /// Verify a webhook delivery's signature and normalize the event.
    /// Must reject before parsing if the signature is missing or wrong.
    async fn parse_webhook(&self, request: &WebhookRequest) -> PaymentResult<PaymentEvent>;
}
