//! File drop server binary.
//!
//! Exposes a one-page upload form on the local network. Uploads are accepted
//! only with the secret code generated at startup; wrong codes and upload
//! bursts are tracked per client address, and repeat offenders are blocked
//! for good.

mod atomic;
mod blocklist;
mod clients;
mod config;
mod error;
mod form;
mod frontend;
mod guard;
mod http;
mod ingest;
mod logging;
mod router;
mod session;
mod storage;
mod upload;

use axum_server::Handle;
use clap::Parser;
use rand::Rng;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::config::{Args, BLOCKLIST_FILE, RANDOM_PORT_RANGE, STATE_DIR, Settings};
use crate::frontend::PageContext;
use crate::guard::{AbuseGuard, GuardConfig};
use crate::router::{AppState, build_router};
use crate::session::SessionAuthenticator;
use crate::storage::UploadDir;

shadow!(build);

/// Starts the file drop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let settings = Settings::resolve(&args)?;

    let mut reserved = vec![STATE_DIR.to_string(), BLOCKLIST_FILE.to_string()];
    if let Some(name) = settings.blocklist_path.file_name() {
        reserved.push(name.to_string_lossy().into_owned());
    }
    let upload_dir = Arc::new(UploadDir::new(settings.upload_dir.clone(), reserved));
    upload_dir.ensure_root().await?;
    match upload_dir.sweep_temp_files().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "cleaned up interrupted uploads"),
        Err(err) => warn!(error = %err, "temp file sweep failed"),
    }

    let guard = Arc::new(
        AbuseGuard::load(
            GuardConfig {
                max_failed_attempts: args.max_failed_attempts,
                failure_window: Duration::from_secs(args.failed_attempt_window_secs),
                max_uploads: args.max_uploads_per_window,
                upload_window: Duration::from_secs(args.upload_window_secs),
            },
            settings.blocklist_path.clone(),
        )
        .await?,
    );
    let session = Arc::new(SessionAuthenticator::generate());

    let app = build_router(AppState {
        session: session.clone(),
        guard,
        upload_dir: upload_dir.clone(),
        page: Arc::new(PageContext {
            username: settings.username.clone(),
        }),
        upload_max_size: args.upload_max_size,
    });

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let port = match args.port {
        0 => rand::rng().random_range(RANDOM_PORT_RANGE.0..=RANDOM_PORT_RANGE.1),
        port => port,
    };
    let addr = SocketAddr::new(host, port);
    let url = http::connect_url(host, http::discover_lan_ip().await, port);

    info!(user = settings.username, "file drop server starting");
    info!("connect to: {url}");
    info!(created_at = %session.created_at(), "code: {}", session.code());
    info!(upload_dir = ?upload_dir.root_path(), "files will be saved here");
    info!("Starting HTTP server at {}", addr);

    let handle = Handle::new();
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
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
