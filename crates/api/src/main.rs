//! shipkit-api server entry point

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use shipkit_api::routes::create_router;
use shipkit_api::{AppState, Config};
use shipkit_payments::catalog::PricingCatalog;
use shipkit_payments::credits::CreditStore;
use shipkit_payments::orders::OrderStore;
use shipkit_payments::subscriptions::SubscriptionStore;
use shipkit_payments::{build_registry, CheckoutService, Ledger, PaymentSettings};
use shipkit_shared::{
    create_migration_pool, create_pool, get_all_configs, run_migrations, SnowflakeGenerator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shipkit_api=info,shipkit_payments=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    {
        let migration_pool = create_migration_pool(&config.database_url)
            .await
            .context("failed to connect for migrations")?;
        run_migrations(&migration_pool)
            .await
            .context("failed to run migrations")?;
        migration_pool.close().await;
    }

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    let configs = get_all_configs(&pool)
        .await
        .context("failed to load runtime configuration")?;
    let settings = PaymentSettings::from_configs(&configs);
    let registry = Arc::new(build_registry(&settings)?);
    tracing::info!(providers = ?registry.names(), "payment providers registered");

    let ids = Arc::new(SnowflakeGenerator::new());
    let ledger = Ledger::new(pool.clone(), ids.clone());
    let catalog = PricingCatalog::new(pool.clone());
    let checkout = Arc::new(CheckoutService::new(
        pool.clone(),
        registry.clone(),
        catalog,
        ledger.clone(),
        ids.clone(),
        config.public_url.clone(),
    ));

    let jwt = Arc::new(shipkit_api::auth::JwtManager::new(
        &config.jwt_secret,
        config.jwt_expiry_hours,
    ));

    let state = AppState {
        pool: pool.clone(),
        config: Arc::new(config.clone()),
        jwt,
        registry,
        checkout,
        ledger,
        orders: OrderStore::new(pool.clone()),
        subscriptions: SubscriptionStore::new(pool.clone()),
        credits: CreditStore::new(pool, ids),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "server listening");

    axum::serve(listener, app)
        .await
        .context("server exited with an error")?;

    Ok(())
}
