use std::process::ExitCode;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use walletback_engine::api;
use walletback_engine::config::Config;
use walletback_engine::endpoint_pool::EndpointPool;
use walletback_engine::error::BackfillError;
use walletback_engine::fetcher::Fetcher;
use walletback_engine::manager::Manager;
use walletback_engine::queue_client::{QueueClient, RedisQueueClient};
use walletback_engine::writer::PgWriter;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error report handler: {}", e);
    }

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e @ BackfillError::Config(_)) => {
            init_fallback_logging();
            tracing::error!(error = %e, "configuration validation failed");
            return ExitCode::from(1);
        }
        Err(e) => {
            init_fallback_logging();
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_target(true)
        .init();

    tracing::info!("wallet back-fill engine starting");

    match run(config).await {
        Ok(()) => {
            tracing::info!("shut down gracefully");
            ExitCode::from(0)
        }
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable startup failure");
            ExitCode::from(2)
        }
    }
}

fn init_fallback_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .try_init();
}

async fn run(config: Config) -> eyre::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("failed to connect to database: {}", e))?;
    tracing::info!("connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("failed to run migrations: {}", e))?;
    tracing::info!("database migrations complete");

    let queue_client: Arc<dyn QueueClient> = Arc::new(
        RedisQueueClient::connect(&config.queue.queue_url)
            .await
            .map_err(|e| eyre::eyre!("failed to connect to queue store: {}", e))?,
    );
    tracing::info!("connected to queue store");

    let endpoint_pool = Arc::new(EndpointPool::new(
        &config.rpc.rpc_endpoints,
        config.rpc.rate_per_second,
        config.rpc.burst,
    ));
    let fetcher = Arc::new(Fetcher::new(endpoint_pool));
    let writer = Arc::new(PgWriter::new(pool));

    let shutdown = CancellationToken::new();
    let manager = Arc::new(Manager::new(
        queue_client,
        fetcher,
        writer,
        config.scaling,
        config.watchdog,
        shutdown.clone(),
    ));

    manager.start().await;
    tracing::info!("manager started, workers running");

    let admin_manager = Arc::clone(&manager);
    let admin_port = config.admin.metrics_port;
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(admin_manager, admin_port).await {
            tracing::error!(error = %e, "admin HTTP surface failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre::eyre!("failed to listen for shutdown signal: {}", e))?;
    tracing::info!("shutdown signal received, stopping manager");

    manager.stop().await;
    admin_handle.abort();

    Ok(())
}
