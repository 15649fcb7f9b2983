use std::process::ExitCode;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use obtura_control::auth::PermissionResolver;
use obtura_control::clock::{Clock, SystemClock};
use obtura_control::config::Config;
use obtura_control::db;
use obtura_control::dispatch::{
    exit_process, BuildDispatcher, BuildQueue, NatsConnector, QueueSettings, BUILD_EXCHANGE,
};
use obtura_control::github::{GithubClient, VcsGateway};
use obtura_control::routes;
use obtura_control::state::AppState;
use obtura_control::store::{CredentialStore, PgCredentialStore};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    tracing::info!(addr = %config.listen_addr, "Starting Obtura control plane");
    tracing::debug!(config = ?config, "Loaded configuration");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Connect to PostgreSQL
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to PostgreSQL");
    let store: Arc<dyn CredentialStore> = Arc::new(PgCredentialStore::new(pool.clone()));

    // Build broker; a failed first connect falls into the reconnect schedule.
    let queue = BuildQueue::new(
        Arc::new(NatsConnector::new(config.broker.clone(), BUILD_EXCHANGE)),
        QueueSettings {
            max_reconnect_attempts: config.broker.max_reconnect_attempts,
            reconnect_delay: config.broker.reconnect_delay,
            operation_timeout: config.broker.operation_timeout,
        },
        exit_process(),
    );
    if let Err(e) = queue.connect().await {
        tracing::warn!(error = %e, "Build broker not reachable at startup");
    }

    let provider = GithubClient::new(&config.github, config.provider_timeout, clock.clone())?;
    let dispatcher = BuildDispatcher::new(store.clone(), queue.clone());
    let gateway = VcsGateway::new(
        store.clone(),
        Arc::new(provider),
        dispatcher,
        &config.github.webhook_secret,
        clock.clone(),
    );

    let state = AppState {
        resolver: PermissionResolver::new(store.clone(), clock.clone()),
        store,
        gateway,
        queue: queue.clone(),
        clock,
        db: Some(pool),
    };

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.close().await;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .ok();
    tracing::info!("Received shutdown signal");
}
