mod config_loader;
mod errors;
mod handlers;
mod state;
mod streaming;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use routecodex_core::error::RouteCodexError;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to.
    #[arg(long, default_value = "0.0.0.0:8080", env = "ROUTECODEX_ADDR")]
    addr: String,
    /// Path to the RouteCodex config document. Falls back to
    /// `ROUTECODEX_CONFIG`, then `~/.routecodex/config.json`.
    #[arg(long, env = "ROUTECODEX_CONFIG")]
    config: Option<PathBuf>,
    /// `pretty` for human-readable logs, `json` for structured logs.
    #[arg(long, default_value = "pretty", env = "ROUTECODEX_LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_format);

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!(error = %err, "routecodex failed to start");
            let is_config_error =
                err.chain().any(|cause| cause.downcast_ref::<RouteCodexError>().is_some_and(is_config_invalid));
            let code = if is_config_error { 2 } else { 1 };
            std::process::exit(code);
        }
    }
}

fn is_config_invalid(err: &RouteCodexError) -> bool {
    matches!(err, RouteCodexError::ConfigInvalid(_))
}

fn init_tracing(log_format: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("routecodex=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = config_loader::resolve_path(args.config)?;
    info!(config = %config_path.display(), "loading configuration");
    let doc = config_loader::load(&config_path)?;

    let processed = routecodex_core::config::process(doc)
        .map_err(|e| anyhow::Error::new(e).context("normalizing configuration"))?;
    for warning in &processed.warnings {
        warn!(%warning, "configuration warning");
    }

    let factories = routecodex_codecs::default_factories(json!({}));
    let (pipelines, credentials, route_pool) =
        routecodex_core::pipeline::assemble(&processed.assembler, &processed.normalized, &factories)
            .await
            .map_err(|e| anyhow::Error::new(e).context("assembling pipelines"))?;

    info!(pipelines = pipelines.len(), "pipelines assembled");

    let snapshots_enabled = std::env::var("ROUTECODEX_HUB_SNAPSHOTS").is_ok();
    let input_protocol = processed.normalized.input_protocol;
    let state = Arc::new(AppState {
        pipelines,
        credentials,
        route_pool,
        selector: routecodex_core::route::RouteSelector::new(),
        normalized: processed.normalized,
        input_protocol,
        snapshots_enabled,
        snapshot_ring: std::sync::Mutex::new(std::collections::VecDeque::new()),
    });

    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/messages", post(handlers::messages))
        .route("/healthz", get(handlers::healthz))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = resolve_addr(&args.addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "routecodex listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// `ROUTECODEX_PORT` overrides the port component of `--addr` (spec §6).
fn resolve_addr(addr: &str) -> String {
    let Ok(port) = std::env::var("ROUTECODEX_PORT") else { return addr.to_string() };
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{addr}:{port}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
    info!("shutdown signal received, draining in-flight requests");
}
