use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rss_aggregator::config::Config;
use rss_aggregator::db::Database;
use rss_aggregator::fetcher::FeedClient;
use rss_aggregator::routes::{self, AppState};
use rss_aggregator::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rss_aggregator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("RSS_AGGREGATOR_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(path = %config_path, feeds = config.feeds.len(), "Loaded configuration");

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or(config.database_url.clone());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    db.sync_feeds(&config.feeds).await?;
    info!("Database initialized");

    let db = Arc::new(db);

    // Create scheduler
    let client = FeedClient::new(config.scheduler.fetch_timeout())?;
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        db.clone(),
        client,
        config.scheduler.clone(),
    ));

    // Start background fetch loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bg_scheduler = scheduler.clone();
    let scheduler_task = tokio::spawn(async move {
        bg_scheduler.run(shutdown_rx).await;
    });

    let state = Arc::new(AppState {
        db: db.clone(),
        scheduler: scheduler.clone(),
    });
    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, waiting for the scheduler to finish");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
