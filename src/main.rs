//! Sourcekeeper
//!
//! Runs the cache, source health monitor and batch processor as one process
//! and exposes their state over HTTP.
//!
//! # Endpoints
//!
//! ```text
//! GET /metrics   Prometheus text format
//! GET /healthz   200 while the runtime is running
//! GET /readyz    200 when the last supervisor pass raised no warnings
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sourcekeeper::error::{Error, Result};
use sourcekeeper::{Config, Runtime};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Sourcekeeper - resilience layer for unreliable data-source APIs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; built-in defaults when omitted
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Seconds between health supervisor passes
    #[arg(long, env = "HEALTH_INTERVAL_SECONDS", default_value = "60")]
    health_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Sourcekeeper");

    let config = match &args.config {
        Some(path) => {
            info!("  Config file: {}", path.display());
            Config::load(path)?
        }
        None => {
            info!("  Config file: none, using defaults");
            Config::default()
        }
    };
    info!("  Memory cache: {} MB", config.cache.memory_cache_size);
    info!("  Disk cache: {}", config.cache.disk_path.display());
    info!("  Eviction strategy: {}", config.cache.strategy);
    info!("  Workers: {}", config.parallel_processing.max_workers);
    info!("  Configured sources: {}", config.data_sources.len());

    let runtime: Arc<Runtime> = Arc::new(Runtime::new(
        config,
        Duration::from_secs(args.health_interval),
    )?);
    runtime.start().await?;

    let server_runtime = Arc::clone(&runtime);
    let metrics_addr = args.metrics_addr.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_http_server(&metrics_addr, server_runtime).await {
            error!("HTTP server error: {}", e);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    server.abort();
    runtime.shutdown().await;

    info!("Sourcekeeper shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Server
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn handle(runtime: &Runtime, req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    const TEXT: &str = "text/plain; charset=utf-8";

    match req.uri().path() {
        "/metrics" => match runtime.telemetry().encode() {
            Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT, "metrics unavailable")
            }
        },
        "/healthz" | "/livez" => {
            if runtime.is_running() {
                respond(StatusCode::OK, TEXT, "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, TEXT, "stopped")
            }
        }
        "/readyz" => match runtime.last_report() {
            Some(report) if runtime.is_running() => {
                let status = if report.is_healthy() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_vec(&report) {
                    Ok(body) => respond(status, "application/json", body),
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT, e.to_string()),
                }
            }
            _ => respond(StatusCode::SERVICE_UNAVAILABLE, TEXT, "not ready"),
        },
        _ => respond(StatusCode::NOT_FOUND, TEXT, "not found"),
    }
}

async fn run_http_server(addr: &str, runtime: Arc<Runtime>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("HTTP server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let runtime = Arc::clone(&runtime);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handle(&runtime, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP server connection error: {}", e);
            }
        });
    }
}
