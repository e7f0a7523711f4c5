use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod abtest;
mod api;
mod budget;
mod classifier;
mod config;
mod error;
mod latency;
mod models;
mod pricing;
mod router;
mod upstream;

pub use config::Config;
pub use error::SidecarError;

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
                .unwrap_or_else(|_| "slimclaw=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("SLIMCLAW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/slimclaw/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        port = config.sidecar.port,
        routing_enabled = config.routing.enabled,
        "slimclaw sidecar starting"
    );

    // Restore budget counters from the previous run, if persistence is on
    let snapshot = match &config.sidecar.budget_snapshot_path {
        Some(path) => match budget::load_snapshot(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "budget snapshot unreadable — starting from zero");
                None
            }
        },
        None => None,
    };

    let config = Arc::new(config);
    let state = Arc::new(router::SidecarState::new(
        Arc::clone(&config),
        config_path.clone(),
        snapshot,
    )?);

    if let Some(ab) = &state.ab {
        info!(experiments = ab.list_experiments().len(), "A/B testing enabled");
    }

    // Background tasks: config hot-reload, budget persistence, pricing refresh
    tokio::spawn(config_watcher(Arc::clone(&state)));
    if let Some(path) = config.sidecar.budget_snapshot_path.clone() {
        tokio::spawn(budget_flusher(Arc::clone(&state), path));
    }
    if let Some(url) = config.pricing.refresh_url.clone() {
        tokio::spawn(pricing_refresher(
            Arc::clone(&state),
            url,
            config.pricing.refresh_ttl_secs,
        ));
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.sidecar.port).parse()?;
    info!(%addr, "sidecar listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = api::sidecar::router(Arc::clone(&state)).layer(
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
    );

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("sidecar server error")?;
        }
        _ = shutdown_signal() => {
            info!(uptime_secs = state.started_at.elapsed().as_secs(), "shutdown signal received");
        }
    }

    // Final budget flush so a clean shutdown loses nothing
    if let (Some(path), Some(tracker)) = (&config.sidecar.budget_snapshot_path, &state.budget) {
        if let Err(e) = budget::write_snapshot(path, &tracker.serialize()) {
            warn!(error = %e, "final budget flush failed");
        }
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
/// Invoked via `slimclaw --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("SLIMCLAW_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8484);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on change.
///
/// Uses filesystem `mtime` for change detection — no inotify/kqueue
/// dependencies. Parse failures are logged and ignored; the running config is
/// unchanged. Trackers (budget, A/B, latency) and upstream clients are built
/// at startup and are NOT rebuilt on reload; restart to change those.
async fn config_watcher(state: Arc<router::SidecarState>) {
    let path = &state.config_path;

    let mut last_mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(path) {
            Ok(new_cfg) => {
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}

/// Background task: flushes budget counters to disk every 30 seconds.
///
/// Writes are atomic (temp file + rename), so a crash mid-flush leaves the
/// previous snapshot intact.
async fn budget_flusher(state: Arc<router::SidecarState>, path: PathBuf) {
    let Some(tracker) = &state.budget else {
        return;
    };

    let mut interval = tokio::time::interval(Duration::from_secs(30));
    interval.tick().await;

    loop {
        interval.tick().await;
        if let Err(e) = budget::write_snapshot(&path, &tracker.serialize()) {
            warn!(path = %path.display(), error = %e, "budget flush failed");
        }
    }
}

/// Background task: refreshes dynamic pricing on half the TTL so entries
/// never expire between refreshes. Fetch failures keep the previous rates.
async fn pricing_refresher(state: Arc<router::SidecarState>, url: String, ttl_secs: u64) {
    let Some(cache) = state.pricing.dynamic() else {
        return;
    };
    let client = reqwest::Client::new();
    let mut interval = tokio::time::interval(Duration::from_secs((ttl_secs / 2).max(60)));

    loop {
        interval.tick().await;
        match cache.refresh(&client, &url).await {
            Ok(count) => info!(models = count, "pricing refreshed"),
            Err(e) => warn!(error = %e, "pricing refresh failed — keeping cached rates"),
        }
    }
}
