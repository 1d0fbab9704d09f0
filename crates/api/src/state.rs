//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use shipkit_payments::credits::CreditStore;
use shipkit_payments::orders::OrderStore;
use shipkit_payments::registry::ProviderRegistry;
use shipkit_payments::subscriptions::SubscriptionStore;
use shipkit_payments::{CheckoutService, Ledger};

use crate::auth::JwtManager;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt: Arc<JwtManager>,
    pub registry: Arc<ProviderRegistry>,
    pub checkout: Arc<CheckoutService>,
    pub ledger: Ledger,
    pub orders: OrderStore,
    pub subscriptions: SubscriptionStore,
    pub credits: CreditStore,
}
