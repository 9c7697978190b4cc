use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Router,
    routing::{any, get},
};
use clap::Parser;
use tower_http::trace::TraceLayer;

mod config;
mod error;
mod headers;
mod policy;
mod proxy;
mod registry;
mod resolve;
mod routes;
mod tls;

#[cfg(test)]
mod tests;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Live set of proxy instances, replaced atomically on reconfiguration.
    pub registry: Arc<registry::InstanceRegistry>,
    /// DNS capability used by target policy checks.
    pub resolver: Arc<dyn resolve::Resolve>,
}

#[derive(Parser, Debug)]
#[command(
    name = "ostia",
    version,
    about = "Multi-tenant HTTP(S)/WebSocket forwarding proxy"
)]
struct Args {
    /// Path to the TOML configuration file. Created with defaults if missing.
    #[arg(long, default_value = "ostia.toml")]
    config: PathBuf,

    /// Override the listen address from the config file (e.g. 127.0.0.1:8080).
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Build the application router.
///
/// Proxy instances are served under `/{path_prefix}/{instance}`; `/debug`
/// exposes the sanitized instance snapshot and `/health` a liveness probe.
pub fn build_app(state: AppState, path_prefix: &str) -> Router {
    let proxy_path = format!("/{}/{{instance}}", path_prefix.trim_matches('/'));

    Router::new()
        .route("/health", get(routes::health))
        .route("/debug", get(routes::debug_view))
        .route(&proxy_path, any(proxy::handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tls::init_crypto_provider();

    let args = Args::parse();

    let cfg = match config::Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let registry = Arc::new(registry::InstanceRegistry::new());
    for (name, instance) in &cfg.instances {
        match registry.setup(name, instance) {
            Ok(()) => tracing::info!(instance = %name, "Proxy instance installed"),
            Err(e) => tracing::error!(instance = %name, error = %e, "Rejected proxy instance"),
        }
    }
    if registry.is_empty() {
        tracing::warn!("No proxy instances installed - every proxy request will return 404");
    }

    let state = AppState {
        registry,
        resolver: Arc::new(resolve::SystemResolver::new()),
    };

    let app = build_app(state, &cfg.server.path_prefix);

    let listen = args.listen.unwrap_or(cfg.server.listen);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("Failed to bind to listen address");

    tracing::info!("Server listening on http://{listen}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");
}

/// Resolve on SIGINT or SIGTERM so in-flight relays can drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

    tracing::info!("Shutdown signal received");
}
