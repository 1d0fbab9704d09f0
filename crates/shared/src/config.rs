//! Key-value config store
//!
//! Provider credentials, signing secrets, and storefront settings live in the
//! `config` table so they can be rotated without a redeploy. Values are read
//! once at startup and resolved into typed settings; nothing in the request
//! path re-reads this table.

use std::collections::HashMap;

use sqlx::PgPool;

/// All config values, keyed by name.
pub type Configs = HashMap<String, String>;

/// Fetch every config row.
pub async fn get_all_configs(pool: &PgPool) -> Result<Configs, sqlx::Error> {
    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT name, value FROM config")
            .fetch_all(pool)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or_default()))
        .collect())
}

/// Fetch a single config value by name.
pub async fn get_config_value(pool: &PgPool, name: &str) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT value FROM config WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(value,)| value.unwrap_or_default()))
}

/// Upsert a batch of config values in one transaction.
pub async fn save_configs(pool: &PgPool, configs: &Configs) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for (name, value) in configs {
        sqlx::query(
            r#"
            INSERT INTO config (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
