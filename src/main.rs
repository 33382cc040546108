mod api;
mod audio;
mod backend;
mod config;
mod error;
mod formats;

use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{build_router, AppState};
use crate::backend::build_backend;
use crate::config::AppConfig;

const DEFAULT_LOG_FILTER: &str = "fraudsense_gateway=info,axum=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .compact()
        .init();

    let cfg = AppConfig::from_env()?;
    cfg.warn_on_loopback_defaults();
    for upstream in [&cfg.text_backend, &cfg.audio_backend] {
        info!(
            backend = upstream.name,
            base_url = %upstream.base_url,
            model = %upstream.model,
            timeout_secs = upstream.timeout.as_secs(),
            "configured upstream backend"
        );
    }

    let classifier = build_backend(&cfg)?;
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let health_timeout_secs = cfg.health_timeout.as_secs();
    let app = build_router(Arc::new(AppState::new(cfg, classifier)));

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| format!("failed to bind {addr}: {err}"))?;
    info!(%addr, health_timeout_secs, "fraudsense-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("fraudsense-gateway stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Open audio streams are drained by axum.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "shutdown requested");
}
