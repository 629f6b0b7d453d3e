//! pipectl server binary entry point
//!
//! Starts the WebSocket control server on top of the selected media engine.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (ws://0.0.0.0:8080/pipelines, simulated engine)
//! cargo run -p pipectl-server
//!
//! # Load a config file and override the port
//! cargo run -p pipectl-server -- --config pipectl.toml --port 9000
//!
//! # Real GStreamer pipelines
//! cargo run -p pipectl-server --features gstreamer -- --engine gstreamer
//!
//! # With logging
//! RUST_LOG=debug cargo run -p pipectl-server
//! ```
//!
//! # Environment Variables
//!
//! - `PIPECTL_CONFIG`: TOML configuration file
//! - `PIPECTL_WS_HOST`, `PIPECTL_WS_PORT`, `PIPECTL_WS_PATH`: listener overrides
//! - `PIPECTL_ENGINE`: `simulated` or `gstreamer`
//! - `RUST_LOG`: Logging level (default: `info`)

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pipectl_core::{ControlPlane, MediaEngine, SimulatedEngine, SimulatedTelemetry};
use pipectl_ws::{ControlServer, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// pipectl WebSocket control server
///
/// Lets remote clients create, start, stop and delete media pipelines and
/// streams their state changes and stats back to every client.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long, env = "PIPECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "PIPECTL_WS_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "PIPECTL_WS_PORT")]
    port: Option<u16>,

    /// WebSocket endpoint path
    #[arg(long, env = "PIPECTL_WS_PATH")]
    path: Option<String>,

    /// Media engine backend
    #[arg(short, long, default_value = "simulated", env = "PIPECTL_ENGINE")]
    engine: EngineKind,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "PIPECTL_LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EngineKind {
    /// In-process engine with scripted state transitions
    Simulated,
    /// GStreamer (requires the `gstreamer` feature)
    Gstreamer,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = ?args.engine,
        addr = %config.bind_addr(),
        path = %config.path,
        "pipectl server starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("pipectl-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let engine = build_engine(args.engine).map_err(|e| {
            error!("Failed to start media engine: {}", e);
            e
        })?;
        let (control, events) = ControlPlane::new(engine, Arc::new(SimulatedTelemetry::default()));

        let server = ControlServer::bind(config, control, events).await.map_err(|e| {
            error!("Failed to start WebSocket server: {}", e);
            e
        })?;

        server.serve_with_shutdown(shutdown_signal()).await.map_err(|e| {
            error!("Server error: {}", e);
            e
        })?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    info!("pipectl server shutdown complete");
    Ok(())
}

/// File values first, then command line and environment overrides
fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = &args.path {
        config.path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_engine(kind: EngineKind) -> Result<Arc<dyn MediaEngine>, Box<dyn std::error::Error>> {
    match kind {
        EngineKind::Simulated => Ok(Arc::new(SimulatedEngine::new()?)),
        #[cfg(feature = "gstreamer")]
        EngineKind::Gstreamer => Ok(Arc::new(pipectl_core::GstEngine::new()?)),
        #[cfg(not(feature = "gstreamer"))]
        EngineKind::Gstreamer => {
            Err("this build has no GStreamer support; rebuild with --features gstreamer".into())
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
