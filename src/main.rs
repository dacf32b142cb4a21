use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod adapters;
mod api;
mod auth;
mod cache;
mod config;
mod cooldown;
mod driver;
mod error;
mod forward;
mod keypick;
mod logs;
mod matching;
mod selector;
mod settings;
mod store;
mod tokenizer;
mod usage;

pub use config::Config;
pub use error::{AppError, ProxyError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ccload=info,tower_http=warn".into()),
        )
        .init();

    // Presence-only gate: the proxy core never compares CCLOAD_PASS against
    // anything. The admin surface runs out-of-process and reads the same
    // variable; starting the proxy without one would leave that control
    // plane unprotected, so boot is refused up front.
    if std::env::var("CCLOAD_PASS").map(|v| v.is_empty()).unwrap_or(true) {
        eprintln!("CCLOAD_PASS is required; refusing to start");
        std::process::exit(1);
    }

    let config_path = std::env::var("CCLOAD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ccload.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let store = Arc::new(
        store::Store::open(std::path::Path::new(&config.server.db_path))
            .context("store init failed")?,
    );

    // Rebuild daily_stats from any log rows that predate the rollup table.
    logs::backfill_daily_stats(&store);

    let (log_sender, log_workers) = logs::start(store.clone(), &config.logs);
    let retention = logs::spawn_retention(store.clone(), config.logs.retention_days);
    let rollup = logs::spawn_rollup(store.clone());

    let max_concurrency = config::max_concurrency();
    let port = config.server.port;
    let settings_reload = Duration::from_secs(config.server.settings_reload_secs);
    let auth_reload = Duration::from_secs(config.server.auth_reload_secs);
    let drain_deadline = Duration::from_secs(config.server.shutdown_drain_secs);

    let state = Arc::new(
        driver::ProxyState::build(config, store.clone(), log_sender.clone(), max_concurrency)
            .context("state init failed")?,
    );

    info!(port, max_concurrency, "ccload starting");

    // Background refreshers: runtime settings and the auth-token map are
    // copy-on-write snapshots republished on their own ticks.
    let settings_task = tokio::spawn(settings_refresher(Arc::clone(&state), settings_reload));
    let auth_task = tokio::spawn(auth_refresher(Arc::clone(&state), auth_reload));
    let oauth_task = tokio::spawn(oauth_sweeper(Arc::clone(&state)));

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "proxy listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(Arc::clone(&state)).layer(trace_layer);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("proxy server error")?;

    info!("shutdown signal received — draining log pipeline");
    retention.abort();
    rollup.abort();
    // The refreshers hold the state (and with it a LogSender clone); they
    // must go before the channel can close and the workers can drain.
    settings_task.abort();
    auth_task.abort();
    oauth_task.abort();
    drop(state);
    drop(log_sender);
    if !log_workers.drain(drain_deadline).await {
        warn!("log workers did not drain before the deadline — abandoning");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `ccload --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("CCLOAD_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: republish the runtime-settings snapshot from the store.
async fn settings_refresher(state: Arc<driver::ProxyState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // skip the immediate first tick
    loop {
        interval.tick().await;
        state.settings.refresh_from(&state.store);
    }
}

/// Background task: reload the auth-token map so admin-issued tokens take
/// effect without a restart.
async fn auth_refresher(state: Arc<driver::ProxyState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        state.auth.reload_from(&state.store);
    }
}

/// Background task: weekly proactive OAuth refresh so rarely-used channels
/// keep working refresh tokens.
async fn oauth_sweeper(state: Arc<driver::ProxyState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(7 * 24 * 3600));
    interval.tick().await;
    loop {
        interval.tick().await;
        state.refresher.sweep().await;
    }
}
