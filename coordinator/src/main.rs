//! AtomicLedger service binary.
//!
//! Serves the ledger API and runs the settlement worker until Ctrl+C.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atomicledger_coordinator::{
    create_router, Coordinator, CoordinatorConfig, LogNotifier, Notifier, TelegramNotifier,
};
use atomicledger_ledger::{InMemoryStore, JournalSink, LedgerStore, PgStore, TracingJournal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoordinatorConfig::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(config.log_filter())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting AtomicLedger service");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    // Generate node ID if not provided
    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| format!("ledger-{}", uuid::Uuid::new_v4()));

    info!(node_id = %node_id, "Node ID assigned");

    let (store, journal): (Arc<dyn LedgerStore>, Arc<dyn JournalSink>) = match &config.database_url {
        Some(url) => {
            let pg = Arc::new(
                PgStore::connect(url, config.max_db_connections)
                    .await
                    .context("Failed to connect to database")?,
            );
            pg.migrate().await.context("Failed to migrate schema")?;
            info!("Using PostgreSQL store");
            let store: Arc<dyn LedgerStore> = pg.clone();
            let journal: Arc<dyn JournalSink> = pg;
            (store, journal)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory store");
            let store: Arc<dyn LedgerStore> = Arc::new(InMemoryStore::new());
            let journal: Arc<dyn JournalSink> = Arc::new(TracingJournal);
            (store, journal)
        }
    };

    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_config(&config.notifier)
        .context("Failed to build Telegram notifier")?
    {
        Some(telegram) => Arc::new(telegram),
        None => Arc::new(LogNotifier),
    };

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        node_id.clone(),
        store,
        journal,
        notifier,
    ));
    coordinator.start().await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    info!(
        node_id = %node_id,
        listen_addr = %config.listen_addr,
        listen_port = %config.listen_port,
        "Ledger service running"
    );

    let shutdown = coordinator.clone();
    axum::serve(listener, create_router(coordinator.clone()))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutdown signal received");
            if let Err(e) = shutdown.stop().await {
                error!(error = %e, "Error during shutdown");
            }
        })
        .await
        .context("Server error")?;

    info!("Ledger service shutdown complete");
    Ok(())
}
