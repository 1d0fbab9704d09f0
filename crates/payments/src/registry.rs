//! Provider registry and payment settings.
//!
//! The registry is built explicitly at startup from the config store and
//! handed to services; providers are never resolved through globals.

use std::sync::Arc;

use shipkit_shared::Configs;
use tracing::info;

use crate::creem::CreemProvider;
use crate::error::{PaymentError, PaymentResult};
use crate::paypal::PayPalProvider;
use crate::provider::PaymentProvider;
use crate::stripe::StripeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaymentEnvironment {
    #[default]
    Production,
    Sandbox,
}

impl PaymentEnvironment {
    pub fn parse(s: &str) -> Self {
        match s {
            "sandbox" | "test" | "development" => PaymentEnvironment::Sandbox,
            _ => PaymentEnvironment::Production,
        }
    }
}

/// Payment credentials loaded from the config store.
#[derive(Debug, Clone, Default)]
pub struct PaymentSettings {
    pub environment: PaymentEnvironment,
    pub default_provider: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_signing_secret: Option<String>,
    pub creem_api_key: Option<String>,
    pub creem_signing_secret: Option<String>,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    pub paypal_webhook_id: Option<String>,
}

impl PaymentSettings {
    pub fn from_configs(configs: &Configs) -> Self {
        let get = |name: &str| {
            configs
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        PaymentSettings {
            environment: get("payment_environment")
                .map(|v| PaymentEnvironment::parse(&v))
                .unwrap_or_default(),
            default_provider: get("default_payment_provider"),
            stripe_secret_key: get("stripe_secret_key"),
            stripe_signing_secret: get("stripe_signing_secret"),
            creem_api_key: get("creem_api_key"),
            creem_signing_secret: get("creem_signing_secret"),
            paypal_client_id: get("paypal_client_id"),
            paypal_client_secret: get("paypal_client_secret"),
            paypal_webhook_id: get("paypal_webhook_id"),
        }
    }
}

/// All configured providers, with one marked as default.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn PaymentProvider>>,
    default_name: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            providers: Vec::new(),
            default_name: None,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.push(provider);
    }

    pub fn set_default(&mut self, name: &str) {
        self.default_name = Some(name.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Resolve by exact name. Used for webhook routes, where falling back
    /// to a different provider would verify with the wrong secret.
    pub fn get_exact(&self, name: &str) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| PaymentError::ProviderNotFound(name.to_string()))
    }

    /// Resolve by name, falling back to the default provider when the name
    /// is empty or unknown. Used for checkout, where any configured
    /// provider can serve the purchase.
    pub fn get(&self, name: &str) -> PaymentResult<Arc<dyn PaymentProvider>> {
        if !name.is_empty() {
            if let Some(found) = self.providers.iter().find(|p| p.name() == name) {
                return Ok(found.clone());
            }
        }
        self.default()
    }

    /// The marked default, or the first registered provider.
    pub fn default(&self) -> PaymentResult<Arc<dyn PaymentProvider>> {
        if let Some(name) = &self.default_name {
            if let Some(found) = self.providers.iter().find(|p| p.name() == name.as_str()) {
                return Ok(found.clone());
            }
        }
        self.providers
            .first()
            .cloned()
            .ok_or(PaymentError::NoProviderConfigured)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the registry from settings, registering every vendor whose
/// credentials are present.
pub fn build_registry(settings: &PaymentSettings) -> PaymentResult<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(secret_key) = &settings.stripe_secret_key {
        registry.register(Arc::new(StripeProvider::new(
            secret_key.clone(),
            settings.stripe_signing_secret.clone(),
        )));
    }

    if let Some(api_key) = &settings.creem_api_key {
        registry.register(Arc::new(CreemProvider::new(
            api_key.clone(),
            settings.creem_signing_secret.clone(),
            settings.environment,
        )?));
    }

    if let (Some(client_id), Some(client_secret)) =
        (&settings.paypal_client_id, &settings.paypal_client_secret)
    {
        registry.register(Arc::new(PayPalProvider::new(
            client_id.clone(),
            client_secret.clone(),
            settings.paypal_webhook_id.clone(),
            settings.environment,
        )?));
    }

    if let Some(default) = &settings.default_provider {
        registry.set_default(default);
    }

    info!(providers = ?registry.names(), "payment providers registered");
    Ok(registry)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::PaymentResult;
    use crate::model::{CheckoutSession, PaymentEvent, PaymentOrder, PaymentSession};
    use crate::provider::WebhookRequest;

    struct FakeProvider(&'static str);

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn create_checkout(&self, _order: &PaymentOrder) -> PaymentResult<CheckoutSession> {
            unimplemented!()
        }

        async fn retrieve_session(&self, _session_id: &str) -> PaymentResult<PaymentSession> {
            unimplemented!()
        }

        async fn parse_webhook(&self, _request: &WebhookRequest) -> PaymentResult<PaymentEvent> {
            unimplemented!()
        }
    }

    fn registry_with(names: &[&'static str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for name in names {
            registry.register(Arc::new(FakeProvider(name)));
        }
        registry
    }

    #[test]
    fn exact_lookup_never_falls_back() {
        let registry = registry_with(&["stripe", "creem"]);
        assert!(registry.get_exact("creem").is_ok());
        assert!(matches!(
            registry.get_exact("paypal"),
            Err(PaymentError::ProviderNotFound(_))
        ));
    }

    #[test]
    fn checkout_lookup_falls_back_to_default() {
        let mut registry = registry_with(&["stripe", "creem"]);
        registry.set_default("creem");
        assert_eq!(registry.get("").unwrap().name(), "creem");
        assert_eq!(registry.get("unknown").unwrap().name(), "creem");
        assert_eq!(registry.get("stripe").unwrap().name(), "stripe");
    }

    #[test]
    fn first_registered_is_default_when_unmarked() {
        let registry = registry_with(&["stripe", "creem"]);
        assert_eq!(registry.default().unwrap().name(), "stripe");
    }

    #[test]
    fn empty_registry_errors() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.get(""),
            Err(PaymentError::NoProviderConfigured)
        ));
    }

    #[test]
    fn settings_skip_blank_values() {
        let mut configs = Configs::new();
        configs.insert("stripe_secret_key".into(), "sk_test_123".into());
        configs.insert("creem_api_key".into(), String::new());
        configs.insert("payment_environment".into(), "sandbox".into());
        let settings = PaymentSettings::from_configs(&configs);
        assert_eq!(settings.stripe_secret_key.as_deref(), Some("sk_test_123"));
        assert!(settings.creem_api_key.is_none());
        assert_eq!(settings.environment, PaymentEnvironment::Sandbox);
    }
}
