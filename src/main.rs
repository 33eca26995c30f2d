use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use http::HeaderValue;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info};

use allocation_workbench as workbench;
use workbench::clients::{HttpClientConfig, UpstreamClient};
use workbench::{AppState, Collaborators};

/// Allocation workbench server.
#[derive(Debug, Parser)]
#[command(name = "allocation-workbench", version, about)]
struct Cli {
    /// Directory holding `default` and per-environment configuration files
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Overrides the configured port
    #[arg(long)]
    port: Option<u16>,

    /// Overrides the configured upstream base URL
    #[arg(long)]
    upstream_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = workbench::config::load_config_from(&cli.config_dir)
        .context("loading configuration")?;
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(upstream_url) = cli.upstream_url {
        cfg.upstream_url = upstream_url;
    }
    workbench::config::init_tracing(cfg.log_level(), cfg.log_json);

    let client = UpstreamClient::new(HttpClientConfig::from(&cfg))
        .context("building upstream client")?;
    info!(upstream = %cfg.upstream_url, "upstream client ready");

    let cors_layer = build_cors(&cfg.allowed_origins());
    let request_timeout = cfg.request_timeout();
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("parsing listen address")?;

    let state = AppState::new(cfg, Collaborators::upstream(client));
    let app = workbench::app_router(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(cors_layer)
        .layer(workbench::tracing::configure_http_tracing());

    info!("allocation-workbench listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let origins = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();

    if origins.is_empty() {
        info!("Using permissive CORS because explicit origins were not configured");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
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
                error!("failed to install SIGTERM handler: {}", err);
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
    info!("shutdown signal received");
}
