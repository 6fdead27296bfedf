//! alertd service binary.
//!
//! Discovers publishing targets from Kubernetes secrets in one namespace and
//! serves the alert intake and status API.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use publishing::{KubeSecretStore, PublishingConfig, PublishingMetrics, PublishingSystem};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use alertd::{build_router, AppState};

/// Alertmanager++ publishing service
#[derive(Parser)]
#[command(name = "alertd")]
#[command(about = "Publishes alerts to Slack, PagerDuty, webhook and email targets")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "ALERTD_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Namespace holding target secrets (overrides ALERTD_TARGET_NAMESPACE)
    #[arg(long)]
    namespace: Option<String>,

    /// Label selector for target secrets (overrides ALERTD_TARGET_SELECTOR)
    #[arg(long)]
    selector: Option<String>,

    /// Log output format
    #[arg(long, env = "ALERTD_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Timeout for a single provider request, in milliseconds
    #[arg(long, env = "ALERTD_HTTP_TIMEOUT_MS", default_value = "10000")]
    http_timeout_ms: u64,

    /// How long to drain the queue on shutdown, in milliseconds
    #[arg(long, env = "ALERTD_DRAIN_TIMEOUT_MS", default_value = "10000")]
    drain_timeout_ms: u64,

    /// Source name used in rendered payloads
    #[arg(long, env = "ALERTD_SOURCE", default_value = "alertd")]
    source: String,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Cli {
    fn apply(&self, config: &mut PublishingConfig) {
        if let Some(namespace) = &self.namespace {
            config.discovery.namespace.clone_from(namespace);
        }
        if let Some(selector) = &self.selector {
            config.discovery.label_selector.clone_from(selector);
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn,kube=warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting alertd");

    let mut config = PublishingConfig::from_env().context("Invalid ALERTD_* configuration")?;
    cli.apply(&mut config);
    debug!(config = ?config, "Effective configuration");

    let metrics = Arc::new(PublishingMetrics::new().context("Failed to register metrics")?);

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!(namespace = %config.discovery.namespace, selector = %config.discovery.label_selector, "Connected to Kubernetes");
    let store = Arc::new(KubeSecretStore::new(kube_client, &config.discovery.namespace));

    let timeout = Duration::from_millis(cli.http_timeout_ms);
    let http = channels::http_client(timeout).context("Failed to build HTTP client")?;
    let clients = channels::default_registry(http, timeout);
    let formatter = Arc::new(channels::BasicFormatter::new(cli.source.clone()));

    let system = Arc::new(PublishingSystem::new(store, clients, formatter, config, metrics));
    system.start().await;

    let app = build_router(AppState::new(Arc::clone(&system)));
    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", cli.listen))?;
    info!(addr = %cli.listen, "alertd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let abandoned = system
        .shutdown(Duration::from_millis(cli.drain_timeout_ms))
        .await;
    if abandoned > 0 {
        warn!(abandoned, "Alerts abandoned at shutdown");
    }
    info!("alertd stopped");
    Ok(())
}
