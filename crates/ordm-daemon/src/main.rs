//! ordm-daemon entry point.
//!
//! Sets up tracing, loads layered config, builds the engine over Postgres
//! (or the in-memory paper ledger), starts the periodic stuck sweep and
//! serves HTTP. Route handlers live in `routes.rs`; shared state in
//! `state.rs`.
//!
//! Environment:
//! - `ORDM_CONFIG`: comma-separated YAML layers (default `config/engine.yaml`)
//! - `ORDM_DATABASE_URL`: Postgres ledger
//! - `ORDM_PAPER=1`: in-memory ledger and paper oracle, no database
//! - `ORDM_DAEMON_ADDR`: overrides `daemon.bind_addr`

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use ordm_config::{
    load_layered_yaml, report_unused_keys, ConfigSurface, EngineConfig, UnusedKeyPolicy,
};
use ordm_daemon::{routes, state};
use ordm_db::{LedgerStore, MemoryLedger, PgLedger};
use ordm_oracle::{ConfirmationOracle, EsploraOracle, PaperOracle};
use ordm_runtime::{Limits, MintEngine};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

const DEFAULT_CONFIG: &str = "config/engine.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = load_config()?;
    let engine = build_engine(&cfg).await?;
    info!(
        store = engine.store_backend(),
        oracle = engine.oracle_source(),
        "engine ready"
    );

    let shared = Arc::new(state::AppState::new(engine));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_stuck_sweep(
        Arc::clone(&shared),
        Duration::from_secs(cfg.stuck.sweep_interval_seconds),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = match bind_addr_from_env() {
        Some(a) => a,
        None => cfg
            .daemon
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid daemon.bind_addr: {}", cfg.daemon.bind_addr))?,
    };
    info!("ordm-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_config() -> anyhow::Result<EngineConfig> {
    let raw = std::env::var("ORDM_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let paths: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let loaded = load_layered_yaml(&paths).context("config load failed")?;
    let unused = report_unused_keys(
        ConfigSurface::Daemon,
        &loaded.config_json,
        UnusedKeyPolicy::Warn,
    )?;
    if !unused.is_clean() {
        warn!(keys = ?unused.unused_leaf_pointers, "CONFIG_UNUSED_KEYS");
    }
    let cfg = EngineConfig::from_loaded(&loaded)?;
    info!(config_hash = %loaded.config_hash, layers = ?paths, "config loaded");
    Ok(cfg)
}

async fn build_engine(cfg: &EngineConfig) -> anyhow::Result<MintEngine> {
    let limits = Limits::from_config(cfg);

    if paper_mode() {
        warn!("ORDM_PAPER set: in-memory ledger and paper oracle, nothing is persisted");
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let oracle: Arc<dyn ConfirmationOracle> = Arc::new(PaperOracle::default());
        return Ok(MintEngine::new(store, oracle, limits));
    }

    let pool = ordm_db::connect_from_env().await?;
    ordm_db::migrate(&pool).await?;
    let store: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(pool));
    let oracle: Arc<dyn ConfirmationOracle> = Arc::new(
        EsploraOracle::new_with_base_url(cfg.oracle.base_url.clone(), cfg.oracle.timeout_ms)
            .context("oracle client init failed")?,
    );
    Ok(MintEngine::new(store, oracle, limits))
}

fn paper_mode() -> bool {
    matches!(
        std::env::var("ORDM_PAPER").as_deref(),
        Ok("1") | Ok("true")
    )
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("ORDM_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
