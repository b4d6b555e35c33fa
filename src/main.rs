//! Storage Pool Manager daemon
//!
//! Runs the storage core with its background tasks: the operation poller
//! advancing balance/scrub rows, the usage sampler, and the health and
//! metrics endpoints.

use anyhow::Context;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_pool_manager::{
    AppConfig, Error, HostProbe, Orchestrator, StorageContext, Store, SystemCommandRunner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Pool Manager - btrfs pool, share and maintenance daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "SPM_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Operation poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL")]
    poll_interval_secs: Option<u64>,

    /// Usage sample interval in seconds
    #[arg(long, env = "SAMPLE_INTERVAL")]
    sample_interval_secs: Option<u64>,

    /// Root of the procfs tree read by the sampler
    #[arg(long, env = "PROCFS_ROOT")]
    procfs_root: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(addr) = &self.health_addr {
            config.server.health_addr = addr.clone();
        }
        if let Some(addr) = &self.metrics_addr {
            config.server.metrics_addr = addr.clone();
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poller.interval_secs = secs;
        }
        if let Some(secs) = self.sample_interval_secs {
            config.sampler.interval_secs = secs;
        }
        if let Some(root) = &self.procfs_root {
            config.sampler.procfs_root = root.clone();
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config.validate().context("validating configuration")?;

    info!("Starting Storage Pool Manager");
    info!("  Version: {}", storage_pool_manager::VERSION);
    info!("  Pool mount root: {}", config.layout.pool_mount_root);
    info!("  Poll interval: {}s", config.poller.interval_secs);
    info!("  Sample interval: {}s", config.sampler.interval_secs);

    let runner = Arc::new(SystemCommandRunner::new(config.executor.runner.clone()));
    let ctx = StorageContext::new(
        Store::in_memory(),
        runner,
        config.btrfs_commands(),
        config.layout.clone(),
    );
    let orchestrator = Arc::new(Orchestrator::new(ctx));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let poller = Arc::new(orchestrator.operation_poller(config.poll_interval()));
    tasks.push(tokio::spawn(poller.run(shutdown.clone())));

    let sampler = Arc::new(orchestrator.usage_sampler(
        HostProbe::new(&config.sampler.procfs_root),
        config.sample_interval(),
    ));
    tasks.push(tokio::spawn(sampler.run(shutdown.clone())));

    let health_addr = config.health_addr()?;
    let health_orchestrator = orchestrator.clone();
    let health_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_orchestrator, health_shutdown).await {
            error!("Health server error: {:#}", e);
        }
    }));

    let metrics_addr = config.metrics_addr()?;
    let metrics_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_shutdown).await {
            error!("Metrics server error: {:#}", e);
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Background task failed: {}", e);
        }
    }

    info!("Storage Pool Manager shutdown complete");
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
        .add_directive("hyper=warn".parse()?);

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
// HTTP Helpers
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(
    addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" => match orchestrator.status().await {
                            Ok(_) => respond(StatusCode::OK, "ok"),
                            Err(e) => respond(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
                        },
                        "/status" => match orchestrator
                            .status()
                            .await
                            .and_then(|status| serde_json::to_vec(&status).map_err(Error::from))
                        {
                            Ok(body) => respond(StatusCode::OK, body),
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("binding health server to {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("health server")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Register storage core metrics before the first scrape
    storage_pool_manager::metrics::metrics();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("binding metrics server to {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("metrics server")?;

    Ok(())
}
