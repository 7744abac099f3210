use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use studio_domain::config::{Config, ConfigSeverity};

use studio_gateway::api;
use studio_gateway::cli::{Cli, Command, ConfigCommand};
use studio_gateway::runtime;
use studio_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = studio_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = studio_gateway::cli::load_config(&cli.config)?;
            if !studio_gateway::cli::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = studio_gateway::cli::load_config(&cli.config)?;
            studio_gateway::cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("teststudio {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,studio_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway server with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("TestStudio starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Services (constructed once; torn down in LIFO order) ────────
    let mut state =
        AppState::from_config(config.clone()).context("initializing application state")?;
    tracing::info!("stores and runtime ready");

    // ── API token (read once, hash for constant-time comparison) ────
    state.api_token_hash = read_token_hash(&config.server.api_token_env, "API bearer-token");
    state.callback_token_hash =
        read_token_hash(&config.server.callback_token_env, "agent callback-secret");

    // ── Router ──────────────────────────────────────────────────────
    let mut app = api::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    if !config.server.cors_origins.is_empty() {
        let origins: Vec<HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(tower_http::cors::Any),
        );
    }

    // ── Serve ───────────────────────────────────────────────────────
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, studio_url = %config.server.studio_url, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // ── Teardown (LIFO): stop agents, close hubs, flush transcripts ─
    tracing::info!("shutting down — terminating live agents");
    runtime::shutdown(&state).await;
    tracing::info!("TestStudio stopped");

    Ok(())
}

/// Hash a bearer token from the environment once at startup.
fn read_token_hash(env_var: &str, what: &str) -> Option<Vec<u8>> {
    match std::env::var(env_var) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var, "{what} auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(env_var, "{what} auth DISABLED — set {env_var} to enable");
            None
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "installing SIGTERM handler failed");
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
}
