//! Service configuration loaded from the environment (and `.env`).

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::pricing::PricingPolicy;
use crate::{Result, StorefrontError};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// `None` runs against the in-process store.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    pub webhook_secret: String,
    pub payment_base_url: String,
    pub currency: String,
    pub pricing: PricingPolicy,
    pub order_lock_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        tracing::info!(port = config.port, database = config.database_url.is_some(), "configuration loaded");
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = PricingPolicy::default();

        let webhook_secret = get("WEBHOOK_SECRET")
            .ok_or_else(|| StorefrontError::Config("missing environment variable 'WEBHOOK_SECRET'".into()))?;

        let pricing = PricingPolicy {
            tax_rate: parse_or(&get, "TAX_RATE", defaults.tax_rate)?,
            free_shipping_threshold: parse_or(&get, "FREE_SHIPPING_THRESHOLD", defaults.free_shipping_threshold)?,
            flat_shipping_fee: parse_or(&get, "FLAT_SHIPPING_FEE", defaults.flat_shipping_fee)?,
        };
        for (name, value) in [
            ("TAX_RATE", pricing.tax_rate),
            ("FREE_SHIPPING_THRESHOLD", pricing.free_shipping_threshold),
            ("FLAT_SHIPPING_FEE", pricing.flat_shipping_fee),
        ] {
            if value < Decimal::ZERO {
                return Err(StorefrontError::Config(format!("{name} must not be negative")));
            }
        }

        let lock_timeout_ms: u64 = parse_or(&get, "ORDER_LOCK_TIMEOUT_MS", 5000)?;
        if lock_timeout_ms == 0 {
            return Err(StorefrontError::Config("ORDER_LOCK_TIMEOUT_MS must be positive".into()));
        }

        Ok(Self {
            port: parse_or(&get, "PORT", 8083)?,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            nats_url: get("NATS_URL"),
            webhook_secret,
            payment_base_url: get("PAYMENT_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8083".to_string())
                .trim_end_matches('/')
                .to_string(),
            currency: get("CURRENCY").unwrap_or_else(|| "NGN".to_string()),
            pricing,
            order_lock_timeout: Duration::from_millis(lock_timeout_ms),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| StorefrontError::Config(format!("invalid {key} '{raw}': {e}"))),
    }
}
