//! relaycast - realtime publish/subscribe relay server

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use relaycast::{AppState, Authorizer, Config, Handler, Hub, LicenseAuthorizer, router, serve};

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Realtime publish/subscribe relay")]
#[command(version)]
struct Args {
    /// Print more feedback from the server
    #[arg(long)]
    debug: bool,

    /// Listen port (default 8001)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Config file, instead of searching for realtime.conf
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory realtime.conf and license.txt are searched from
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.root.as_deref(), args.config.as_deref())?;
    if args.debug {
        config.debug = true;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(args.log_level.as_deref().unwrap_or(default_level))
        .init();

    info!("relaycast v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config.config_file {
        info!(path = %path.display(), "config file loaded");
    }
    info!(
        debug = config.debug,
        port = config.port,
        data_queue = config.data_queue_capacity,
        control_queue = config.control_queue_capacity,
        resource = %config.resource,
        "using config"
    );

    if !config.websocket_allowed() {
        anyhow::bail!(
            "websocket transport disabled by allowed-types ({})",
            config.allowed_types.join(", ")
        );
    }

    let authorizer = match config.license_path() {
        Some(path) => LicenseAuthorizer::load(&path, &config.license_secret)?,
        None => LicenseAuthorizer::new(&config.license_secret, Vec::new()),
    };
    if authorizer.key_count() == 0 {
        warn!("no valid licence keys found, only localhost connections are permitted");
    }
    let authorizer: Arc<dyn Authorizer> = Arc::new(authorizer);

    let hub = Arc::new(Hub::new(
        config.control_queue_capacity,
        config.data_queue_capacity,
    ));
    let handler = Arc::new(Handler::new(hub.clone()));
    let app = router(AppState::new(handler, authorizer), &config.resource);

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "accepting connections");

    serve(listener, app, hub, shutdown_signal()).await?;
    info!("relaycast shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("server shutting down");
}
