//! Storefront order service: checkout, order totals and payment reconciliation.

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_orders::api::{router, AppState};
use storefront_orders::store::StoreOptions;
use storefront_orders::webhook::SignatureVerifier;
use storefront_orders::{AppConfig, MemoryStore, OrderStore, PgOrderStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let options = StoreOptions::from(&config);

    let store: Arc<dyn OrderStore> = match &config.database_url {
        Some(url) => {
            let db = PgPoolOptions::new().max_connections(config.database_max_connections).connect(url).await?;
            sqlx::migrate!("./migrations").run(&db).await?;
            Arc::new(PgOrderStore::new(db, options))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; orders are kept in memory and lost on restart");
            Arc::new(MemoryStore::new(options))
        }
    };

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable; order events will not be published");
                None
            }
        },
        None => None,
    };

    let state = AppState {
        store,
        verifier: SignatureVerifier::new(&config.webhook_secret),
        payment_base_url: config.payment_base_url.clone(),
        nats,
    };

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("storefront orders listening on 0.0.0.0:{}", config.port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
