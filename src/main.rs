//! hostbind node agent
//!
//! Runs the reconciliation loop, the plugin registrar and the HTTP
//! surfaces for one node.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        hostbind agent                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   HTTP API   │───▶│  Reconcile   │───▶│   Volume     │       │
//! │  │              │    │    Loop      │    │   Registry   │       │
//! │  └──────────────┘    └──────────────┘    └──────▲───────┘       │
//! │                                                  │               │
//! │                                          ┌──────┴───────┐       │
//! │                                          │    Plugin    │       │
//! │                                          │  Registrar   │       │
//! │                                          └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hostbind::adapters::{LoggingEventPublisher, StdHostFilesystem, UnixSocketTransport};
use hostbind::api::{self, ApiState};
use hostbind::controller::{Backoff, ReconcileLoop, ReconcileLoopConfig};
use hostbind::metrics;
use hostbind::plugin::{PluginRegistrar, RegistrarConfig};
use hostbind::status::Readiness;
use hostbind::volume::{NodeName, VolumeRegistry, WorkerPoolConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// hostbind - node-local host-path volume provisioning and validation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of this node (defaults to $HOSTNAME)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Directory plugin backends create their sockets in
    #[arg(
        long,
        env = "PLUGIN_REGISTRATION_DIR",
        default_value = "/var/lib/hostbind/plugins_registry"
    )]
    registration_dir: PathBuf,

    /// API server bind address
    #[arg(long, env = "API_ADDR", default_value = "127.0.0.1:7420")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Concurrent blocking filesystem calls
    #[arg(long, env = "WORKER_POOL_SIZE", default_value = "16")]
    worker_pool_size: usize,

    /// Seconds before a blocking filesystem call is flagged
    #[arg(long, env = "WATCHDOG_THRESHOLD_SECONDS", default_value = "5")]
    watchdog_threshold_seconds: u64,

    /// Plugin handshake timeout in seconds
    #[arg(long, env = "HANDSHAKE_TIMEOUT_SECONDS", default_value = "10")]
    handshake_timeout_seconds: u64,

    /// Plugin heartbeat interval in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value = "10")]
    heartbeat_interval_seconds: u64,

    /// Consecutive missed heartbeats before a backend is deregistered
    #[arg(long, env = "MAX_MISSED_HEARTBEATS", default_value = "3")]
    max_missed_heartbeats: u32,

    /// First retry delay for waiting volumes, in milliseconds
    #[arg(long, env = "INITIAL_BACKOFF_MS", default_value = "1000")]
    initial_backoff_ms: u64,

    /// Retry delay cap for waiting volumes, in milliseconds
    #[arg(long, env = "MAX_BACKOFF_MS", default_value = "30000")]
    max_backoff_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn node(&self) -> anyhow::Result<NodeName> {
        let name = match &self.node_name {
            Some(name) => name.clone(),
            None => std::env::var("HOSTNAME")
                .context("--node-name not set and $HOSTNAME is unavailable")?,
        };
        anyhow::ensure!(!name.trim().is_empty(), "node name must not be empty");
        Ok(NodeName::new(name))
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let node = args.node()?;
    info!("Starting hostbind node agent");
    info!("  Node: {}", node);
    info!("  Registration dir: {}", args.registration_dir.display());
    info!("  Worker pool size: {}", args.worker_pool_size);
    info!(
        "  Watchdog threshold: {}s",
        args.watchdog_threshold_seconds
    );

    let registry = Arc::new(
        VolumeRegistry::new(
            Arc::new(StdHostFilesystem::new()),
            WorkerPoolConfig {
                size: args.worker_pool_size,
                watchdog_threshold: Duration::from_secs(args.watchdog_threshold_seconds),
            },
        )
        .with_event_publisher(Arc::new(LoggingEventPublisher)),
    );

    let reconcile = Arc::new(ReconcileLoop::new(
        ReconcileLoopConfig {
            backoff: Backoff::new(
                Duration::from_millis(args.initial_backoff_ms),
                Duration::from_millis(args.max_backoff_ms),
            ),
            ..Default::default()
        },
        registry.clone(),
    ));

    let registrar = Arc::new(PluginRegistrar::new(
        RegistrarConfig {
            registration_dir: args.registration_dir.clone(),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_seconds),
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_seconds),
            max_missed_heartbeats: args.max_missed_heartbeats,
            ..Default::default()
        },
        Arc::new(UnixSocketTransport::new()),
        registry,
    ));

    let shutdown = CancellationToken::new();

    let loop_handle = tokio::spawn(reconcile.clone().run(shutdown.clone()));
    let registrar_handle = tokio::spawn(registrar.clone().run(shutdown.clone()));

    // Start health server
    let health_addr = args.health_addr.clone();
    let (health_reconcile, health_registrar) = (reconcile.clone(), registrar.clone());
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_reconcile, health_registrar).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    // Start API server
    let state = Arc::new(ApiState {
        node,
        reconcile,
        registrar: Some(registrar),
    });
    let api_addr = args.api_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_api_server(&api_addr, state).await {
            error!("API server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    match loop_handle.await {
        Ok(Err(e)) => error!("Reconciliation loop error: {}", e),
        Err(e) => error!("Reconciliation loop panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = registrar_handle.await {
        error!("Plugin registrar panicked: {}", e);
    }

    info!("Agent shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("h2=warn".parse()?);

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
    Ok(())
}

// =============================================================================
// HTTP Servers
// =============================================================================

async fn bind(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {} server address: {}", name, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} server on {}", name, addr))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

async fn run_health_server(
    addr: &str,
    reconcile: Arc<ReconcileLoop>,
    registrar: Arc<PluginRegistrar>,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        reconcile: Arc<ReconcileLoop>,
        registrar: Arc<PluginRegistrar>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let (status, body) = match req.uri().path() {
            "/healthz" | "/livez" => (StatusCode::OK, Bytes::from("ok")),
            "/readyz" => {
                let readiness = Readiness::check(&reconcile, Some(&registrar));
                let status = if readiness.is_ready() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                let body = serde_json::to_vec(&readiness).unwrap_or_default();
                (status, Bytes::from(body))
            }
            _ => (StatusCode::NOT_FOUND, Bytes::from("not found")),
        };
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        Ok(response)
    }

    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Health server accept error")?;

        let io = TokioIo::new(stream);
        let reconcile = reconcile.clone();
        let registrar = registrar.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                health_handler(req, reconcile.clone(), registrar.clone())
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match (req.uri().path(), metrics::render()) {
            ("/metrics", Ok((content_type, body))) => {
                let mut response = Response::new(Full::new(Bytes::from(body)));
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response
            }
            ("/metrics", Err(e)) => {
                tracing::error!("Failed to render metrics: {}", e);
                let mut response = Response::new(Full::new(Bytes::from("metrics unavailable")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
            _ => {
                let mut response = Response::new(Full::new(Bytes::from("not found")));
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
        };
        Ok(response)
    }

    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Metrics server accept error")?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

async fn run_api_server(addr: &str, state: Arc<ApiState>) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "API").await?;

    loop {
        let (stream, _) = listener.accept().await.context("API server accept error")?;

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| api::handle(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("API server connection error: {}", e);
            }
        });
    }
}
