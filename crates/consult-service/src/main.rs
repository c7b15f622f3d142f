//! Consult Service - HTTP API for metered consultations
//!
//! This is the main entry point for the consultation service.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consult_service::{create_router, AppState, ServiceConfig};
use consult_store::{PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,consult=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Consult Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        postgres_configured = %config.database_url.is_some(),
        data_dir = %config.data_dir,
        ai_configured = %config.ai_api_url.is_some(),
        voice_configured = %config.voice_api_url.is_some(),
        push_configured = %config.push_url.is_some(),
        chat_markup = config.pricing.chat_markup,
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;

    // Build app state
    let state = AppState::new(store, config.clone());
    let seeded = state.rates.seed_plans(&config.pricing.plans).await?;
    tracing::info!(plans = seeded, "Rate table seeded");

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Pick the storage backend: PostgreSQL when `DATABASE_URL` is set, otherwise
/// RocksDB when compiled in, otherwise process memory.
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    if let Some(url) = &config.database_url {
        tracing::info!(max_connections = config.database_max_connections, "Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(url)
            .await?;
        let store = PgStore::from_pool(pool);
        store.migrate().await?;
        tracing::info!("PostgreSQL migrations applied");
        return Ok(Arc::new(store));
    }

    #[cfg(feature = "rocksdb-backend")]
    {
        tracing::info!(path = %config.data_dir, "Opening RocksDB store");
        Ok(Arc::new(consult_store::RocksStore::open(&config.data_dir)?))
    }

    #[cfg(not(feature = "rocksdb-backend"))]
    {
        tracing::warn!("No DATABASE_URL and RocksDB not compiled in - using in-memory store");
        Ok(Arc::new(consult_store::MemoryStore::new()))
    }
}
