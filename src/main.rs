use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use cadence_api::{
    app::{self, Persistence},
    create_router,
    db::{create_pool, CacheStore, MemoryStore, RedisStore},
    Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cadence_api=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let cache_store: Arc<dyn CacheStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            tracing::warn!("REDIS_URL not set, using in-process cache");
            Arc::new(MemoryStore::new())
        }
    };

    let persistence = match &config.database_url {
        Some(url) => Persistence::postgres(create_pool(url).await?),
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            Persistence::in_memory()
        }
    };

    let (state, background) = app::build(&config, cache_store, persistence, |limiter, cache| {
        app::http_catalog(&config, limiter, cache)
    });
    let router = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
