//! Pricing catalog.
//!
//! Purchasable plans live in the config store under `pricing_items` as a
//! JSON array, so prices never come from the client. Checkout requests name
//! an item id and everything else is looked up here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use shipkit_shared::get_config_value;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{PaymentInterval, PaymentPrice, PaymentType};

pub const PRICING_ITEMS_CONFIG: &str = "pricing_items";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingItem {
    pub item_id: String,
    pub plan_name: String,
    pub amount: i64,
    pub currency: String,
    pub interval: String,
    #[serde(default)]
    pub credits_amount: i64,
    #[serde(default)]
    pub credits_valid_days: Option<i64>,
    /// Vendor-side product ids, keyed by provider name.
    #[serde(default)]
    pub product_ids: HashMap<String, String>,
}

impl PricingItem {
    pub fn interval(&self) -> PaymentResult<PaymentInterval> {
        PaymentInterval::parse(&self.interval).ok_or_else(|| {
            PaymentError::Validation(format!(
                "pricing item {} has unknown interval: {}",
                self.item_id, self.interval
            ))
        })
    }

    pub fn payment_type(&self) -> PaymentResult<PaymentType> {
        Ok(if self.interval()?.is_recurring() {
            PaymentType::Subscription
        } else {
            PaymentType::OneTime
        })
    }

    pub fn price_for(&self, provider: &str) -> PaymentResult<PaymentPrice> {
        Ok(PaymentPrice {
            currency: self.currency.clone(),
            amount: self.amount,
            interval: self.interval()?,
            product_id: self.product_ids.get(provider).cloned(),
            product_name: self.plan_name.clone(),
        })
    }

    fn validate(&self) -> PaymentResult<()> {
        if self.amount <= 0 {
            return Err(PaymentError::Validation(format!(
                "pricing item {} has non-positive amount",
                self.item_id
            )));
        }
        if self.currency.len() != 3 {
            return Err(PaymentError::Validation(format!(
                "pricing item {} has invalid currency: {}",
                self.item_id, self.currency
            )));
        }
        self.interval()?;
        Ok(())
    }
}

pub struct PricingCatalog {
    pool: PgPool,
}

impl PricingCatalog {
    pub fn new(pool: PgPool) -> Self {
        PricingCatalog { pool }
    }

    /// All catalog items, freshly loaded from the config store.
    pub async fn items(&self) -> PaymentResult<Vec<PricingItem>> {
        let raw = get_config_value(&self.pool, PRICING_ITEMS_CONFIG)
            .await?
            .ok_or_else(|| PaymentError::Config("pricing_items is not configured".to_string()))?;
        parse_items(&raw)
    }

    /// A single item by id, or a validation error naming it.
    pub async fn find(&self, item_id: &str) -> PaymentResult<PricingItem> {
        self.items()
            .await?
            .into_iter()
            .find(|item| item.item_id == item_id)
            .ok_or_else(|| {
                PaymentError::Validation(format!("unknown pricing item: {item_id}"))
            })
    }
}

pub fn parse_items(raw: &str) -> PaymentResult<Vec<PricingItem>> {
    let items: Vec<PricingItem> = serde_json::from_str(raw)?;
    for item in &items {
        item.validate()?;
    }
    Ok(items)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "item_id": "starter",
            "plan_name": "Starter",
            "amount": 990,
            "currency": "usd",
            "interval": "one-time",
            "credits_amount": 100,
            "credits_valid_days": 30,
            "product_ids": { "creem": "prod_starter" }
        },
        {
            "item_id": "pro-monthly",
            "plan_name": "Pro",
            "amount": 1990,
            "currency": "usd",
            "interval": "month",
            "credits_amount": 1000
        }
    ]"#;

    #[test]
    fn parses_and_classifies_items() {
        let items = parse_items(SAMPLE).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].payment_type().unwrap(), PaymentType::OneTime);
        assert_eq!(items[1].payment_type().unwrap(), PaymentType::Subscription);
        assert_eq!(items[1].credits_valid_days, None);
    }

    #[test]
    fn price_carries_provider_product_id() {
        let items = parse_items(SAMPLE).unwrap();
        let price = items[0].price_for("creem").unwrap();
        assert_eq!(price.product_id.as_deref(), Some("prod_starter"));
        let price = items[0].price_for("stripe").unwrap();
        assert_eq!(price.product_id, None);
    }

    #[test]
    fn rejects_bad_items() {
        let bad_amount = r#"[{ "item_id": "x", "plan_name": "X", "amount": 0,
            "currency": "usd", "interval": "month" }]"#;
        assert!(matches!(
            parse_items(bad_amount),
            Err(PaymentError::Validation(_))
        ));

        let bad_interval = r#"[{ "item_id": "x", "plan_name": "X", "amount": 10,
            "currency": "usd", "interval": "fortnight" }]"#;
        assert!(parse_items(bad_interval).is_err());
    }
}
