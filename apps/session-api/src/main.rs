use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_api::config::Config;
use session_api::db::kv::{KeyValueStore, MemoryKv, RedisKv};
use session_api::store::{MemoryStore, PgStore, SessionStore};
use session_api::AppState;

const DB_POOL_SIZE: usize = 16;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "session-api failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let config = Config::from_env()?;
    let port = config.port;
    let readiness_every = Duration::from_secs(config.readiness_interval_secs);

    let store: Arc<dyn SessionStore> = match &config.database_url {
        Some(url) => {
            let applied = session_api::db::run_migrations(url).await?;
            if !applied.is_empty() {
                tracing::info!(count = applied.len(), "migrations applied");
            }
            let pool = session_api::db::pool::connect(url, DB_POOL_SIZE)?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; sessions are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let kv: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisKv::connect(url)
                .await
                .map_err(|e| format!("failed to connect to redis: {e}"))?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set; tokens are kept in memory");
            Arc::new(MemoryKv::new())
        }
    };

    tracing::info!(
        host_occupies_slot = config.host_occupies_slot,
        host_leave = ?config.host_leave,
        dev_login = config.dev_login_enabled,
        "session-api configured"
    );

    let state = AppState::new(config, store, kv);

    let cancel = CancellationToken::new();
    let readiness = tokio::spawn(session_api::tasks::readiness::run(
        state.engine.clone(),
        readiness_every,
        cancel.clone(),
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(session_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, "session-api listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), readiness).await;
    tracing::info!("shutdown complete");

    served
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}
