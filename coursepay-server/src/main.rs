use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use coursepay_server::config::Config;
use coursepay_server::provider::ProviderClient;
use coursepay_server::webhook::{dead_letters_handler, health_handler, webhook_router};
use coursepay_server::{
    AppState, ChargeResolver, ReconcileJob, Reconciler, Repository, Scheduler, SqliteRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting coursepay payment reconciliation engine");

    let config = Config::from_env()?;

    let db_path = config.state_dir.join("coursepay-state.db");
    info!("Using state database: {}", db_path.display());
    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::new(&db_path)?);

    let provider = ProviderClient::new(
        config.provider_base_url.clone(),
        config.provider_api_key.clone(),
        config.provider_timeout,
    )?;
    let resolver = ChargeResolver::new(Arc::new(provider), config.provider_timeout);
    let reconciler = Arc::new(Reconciler::new(repository.clone(), resolver));

    let scheduler = Scheduler::start(
        reconciler.clone(),
        repository.clone(),
        config.retry_policy(),
        config.worker_count,
        config.queue_depth,
        config.sweep_interval,
    );

    // Crash recovery before accepting any requests: events orphaned in
    // `processing` go back to `received`, and everything unprocessed is
    // re-enqueued.
    let released = repository.release_in_flight_events().await?;
    if released > 0 {
        info!("released {} event(s) orphaned by a previous run", released);
    }
    let unprocessed = repository.stale_received_events(0).await?;
    if !unprocessed.is_empty() {
        info!("re-enqueueing {} unprocessed event(s)", unprocessed.len());
    }
    for id in unprocessed {
        scheduler.enqueue(ReconcileJob::new(id)).await;
    }

    let app_state = Arc::new(AppState {
        repository,
        scheduler,
        webhook_secret: config.webhook_secret.clone(),
        signature_tolerance_secs: config.signature_tolerance_secs,
        deadletter_auth_token: config.deadletter_auth_token.clone(),
    });

    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/dead-letters", get(dead_letters_handler))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
