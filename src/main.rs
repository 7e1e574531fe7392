use std::{sync::Arc, time::Duration};

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::get;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Level;

mod backend;
mod cli;
mod gateway;
mod info;
mod path;

use crate::backend::Backend;
use crate::backend::kubo::KuboBackend;
use crate::cli::{CliOperations, RunConfig};
use crate::info::health_check;

/// Last-resort circuit breaker: the backend is expected to enforce its own
/// much shorter deadlines.
const REQUEST_DEADLINE: Duration = Duration::from_secs(60 * 60);

pub struct App {
    backend: Arc<dyn Backend>,
    config: RunConfig,
    user_headers: HeaderMap,
}

pub type AppState = Arc<App>;

/// Signal for graceful shutdown
async fn shutdown_signal() {
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
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http::trace=info".into()),
        )
        .compact()
        .init();

    let cli = cli::Cli::parse();
    let config = match cli.command {
        Some(CliOperations::Config(config)) => {
            println!("{config:#?}");
            std::process::exit(0);
        }
        Some(CliOperations::Run(config)) => config,
        _ => cli.config,
    };

    run(config).await;
}

async fn run(config: RunConfig) {
    tracing::debug!(config = ?config, "Loaded configuration");

    if config.writable {
        tracing::warn!(
            "Writable mode is enabled; anyone who can reach this gateway can add content to the node"
        );
    }

    let user_headers = match gateway::user_header_map(&config.header) {
        Ok(headers) => headers,
        Err(e) => {
            tracing::error!(error = %e, "Invalid --header flag");
            std::process::exit(1);
        }
    };

    let backend = KuboBackend::new_with_config(
        config.rpc_address.clone(),
        config.rpc_credentials.clone().map(Into::into),
        config.scratch_prefix.clone(),
    );

    let app_state = Arc::new(App {
        backend: Arc::new(backend),
        config: config.clone(),
        user_headers,
    });

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(gateway::routes())
        .with_state(app_state)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        );

    let listener = config.listen_socket().await;
    tracing::info!(writable = config.writable, "Gateway started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start axum::serve");

    tracing::info!("Server shutdown complete");
}
