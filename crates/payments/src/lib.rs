//! Shipkit Payments
//!
//! The payment-event-to-ledger reconciliation engine: vendor adapters
//! (Stripe, Creem, PayPal) normalize checkout sessions and webhook events
//! onto a canonical model, and the ledger applies them to orders,
//! subscriptions, and prepaid credits atomically and idempotently.

pub mod catalog;
pub mod checkout;
pub mod creem;
pub mod credits;
pub mod error;
pub mod ledger;
pub mod model;
pub mod orders;
pub mod paypal;
pub mod provider;
pub mod registry;
pub mod stripe;
pub mod subscriptions;

pub use catalog::{PricingCatalog, PricingItem};
pub use checkout::{CheckoutInfo, CheckoutRequest, CheckoutService, CheckoutUser};
pub use error::{PaymentError, PaymentResult};
pub use ledger::Ledger;
pub use model::{
    CheckoutSession, PaymentEvent, PaymentEventType, PaymentInterval, PaymentOrder,
    PaymentSession, PaymentStatus, PaymentType, SubscriptionCycleType,
};
pub use provider::{PaymentProvider, WebhookRequest};
pub use registry::{build_registry, PaymentEnvironment, PaymentSettings, ProviderRegistry};
