use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use voxgate_config::Settings;
use voxgate_gateway::state::AppState;
use voxgate_gateway::{build_router, heartbeat};
use voxgate_providers::registry::ProviderRegistry;
use voxgate_services::auth::JwtAuthService;
use voxgate_services::usage::{HttpSink, MemorySink, UsageRecorder, UsageSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    info!(port = settings.server.port, "starting voxgate");

    let registry = ProviderRegistry::from_settings(&settings.providers);
    let verifier = Arc::new(JwtAuthService::new(&settings.auth.jwt_secret));
    let sink: Arc<dyn UsageSink> = match &settings.usage.sink_url {
        Some(url) => Arc::new(HttpSink::new(url.clone())),
        None => Arc::new(MemorySink::new()),
    };
    let recorder = Arc::new(UsageRecorder::new(sink));

    let state = AppState::new(settings.clone(), registry, verifier, recorder);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(heartbeat::run_heartbeat(
        state.connections.clone(),
        Duration::from_secs(settings.heartbeat.interval_secs),
        shutdown_rx.clone(),
    ));
    tokio::spawn(state.admission.clone().run_sweeper(
        Duration::from_secs(settings.admission.sweep_interval_secs),
        shutdown_rx,
    ));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
