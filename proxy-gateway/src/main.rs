use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use proxy_gateway::app_state::AppState;
use proxy_gateway::breaker::{BreakerRegistry, BreakerSettings};
use proxy_gateway::config::GatewayConfig;
use proxy_gateway::credential_store::PgCredentialStore;
use proxy_gateway::agent_store::PgAgentStore;
use proxy_gateway::error::{ApiError, ErrorKind};
use proxy_gateway::metrics::GatewayMetrics;
use proxy_gateway::pipeline::{handle_chat, healthz, metrics_handler};
use proxy_gateway::quota::{QuotaReconciler, RedisQuotaStore};
use proxy_gateway::rate_limiter::RedisRateLimiter;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;

    let master_key_bytes = master_key_to_bytes(&config)?;

    let metrics = Arc::new(GatewayMetrics::new()?);

    let credential_store = Arc::new(PgCredentialStore::new(pool.clone(), config.key_cache_ttl));
    let agent_store = Arc::new(PgAgentStore::new(pool.clone(), master_key_bytes, config.agent_cache_ttl));
    let quota_store = Arc::new(RedisQuotaStore::new(redis_conn.clone()));
    let rate_limiter = Arc::new(RedisRateLimiter::new(redis_conn.clone()));

    let breaker_registry = Arc::new(BreakerRegistry::new(
        BreakerSettings {
            failure_threshold: config.breaker_failure_threshold,
            success_threshold: config.breaker_success_threshold,
            open_timeout: config.breaker_open_timeout,
        },
        Some(metrics.clone()),
    ));

    let reconciler = QuotaReconciler::new();
    reconciler.spawn_flush_task(pool.clone(), Duration::from_secs(5));

    let state = AppState {
        config: config.clone(),
        metrics: metrics.clone(),
        credential_store,
        agent_store,
        quota_store,
        quota_reconciler: reconciler,
        rate_limiter,
        breaker_registry,
        http_client: reqwest::Client::builder().build()?,
        pool: Some(pool.clone()),
    };

    let cors = if config.allowed_cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .allowed_cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    let app = Router::new()
        .route("/proxy/v1/agents/:agent_id/chat", post(handle_chat))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "agentlink proxy gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_drain))
        .await?;

    Ok(())
}

/// Turns a handler panic into a uniform `internal` error envelope instead of
/// letting the connection drop, per spec.md's "internal panics never crash
/// the process" requirement.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    ApiError::new(ErrorKind::Internal, "internal server error").into_response()
}

fn master_key_to_bytes(config: &GatewayConfig) -> anyhow::Result<[u8; 32]> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    let decoded = STANDARD.decode(config.prompt_master_key_base64.trim())?;
    decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("PROMPT_MASTER_KEY must decode to exactly 32 bytes"))
}

async fn shutdown_signal(drain: Duration) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(drain_secs = drain.as_secs(), "shutdown signal received, draining in-flight requests");
    // Bound the drain per spec.md §6's `SHUTDOWN_DRAIN_SECONDS`: if
    // in-flight requests haven't finished by then, force the process down
    // rather than hang forever on a stuck connection.
    tokio::spawn(async move {
        tokio::time::sleep(drain).await;
        tracing::warn!("drain window elapsed with requests still in flight, forcing shutdown");
        std::process::exit(0);
    });
}
