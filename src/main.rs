//! Minimal HTTP file browser.
//!
//! Serves directory listings and file downloads below a single root, with
//! optional form uploads and a Prometheus-style metrics endpoint. The main
//! entry point resolves configuration, builds the Axum router and runs a
//! single HTTP listener until a termination signal arrives.

mod app;
mod breadcrumb;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod logging;
mod metrics;
mod storage;
mod upload;
mod view;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::config::{Args, Settings};
use crate::metrics::Metrics;
use crate::storage::Storage;

shadow!(build);

/// Starts the file browser and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let settings = Arc::new(Settings::resolve(&args, |key| std::env::var(key).ok()));
    let storage = Arc::new(Storage::new(settings.root.clone())?);
    storage.ensure_root().await?;
    let metrics = Arc::new(Metrics::new());

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);

    info!(root = %storage.root_path().display(), "serving files");
    info!(
        uploads = settings.upload_enabled,
        metrics = settings.metrics_enabled,
        commit = settings.build.commit,
        "feature toggles"
    );
    if settings.upload_enabled {
        warn!("uploads are enabled without authentication");
    }

    let app = app::build_router(storage, settings, metrics);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
