use anyhow::Result;
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::Json,
    routing::{any, get},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatekeeper::{
    clock::{Clock, SystemClock},
    config::{CompiledLimit, Settings},
    limiter::{select_limiter, LimiterOptions},
    metrics::Metrics,
    middleware::AdmissionLayer,
    redis::RedisClient,
    store::CounterStore,
    sweeper::{Sweep, SweeperHandle},
};

#[derive(Clone)]
struct AppState {
    store: Option<Arc<dyn CounterStore>>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting gatekeeper");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref())?;
    // Invalid policies stop the process here, before anything is served
    let limits = settings.compile()?;

    let metrics = Metrics::new()?;
    let store = connect_store(&settings).await;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let options = LimiterOptions {
        clock: clock.clone(),
        key_prefix: settings.key_prefix.clone(),
        store_timeout: settings
            .redis_config()
            .map(|redis| redis.command_timeout)
            .unwrap_or(gatekeeper::shared::DEFAULT_STORE_TIMEOUT),
        deny_cache_size: settings.local_deny_cache_size,
        metrics: Some(metrics.clone()),
    };

    let state = AppState {
        store: store.clone(),
        metrics: metrics.clone(),
    };
    let (app, registries) = build_router(&limits, store.as_ref(), &options, state)?;

    let sweeper = SweeperHandle::spawn(registries, settings.sweep_interval(), metrics);

    let addr = settings.http_addr.parse::<SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "HTTP server listening on {} ({} limits, shared store: {})",
        addr,
        limits.len(),
        store.is_some()
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.shutdown().await;
    info!("Service stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gatekeeper=info".into());

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Connect to Redis if configured. Failure leaves the process on local limiters.
async fn connect_store(settings: &Settings) -> Option<Arc<dyn CounterStore>> {
    let config = settings.redis_config()?;

    match RedisClient::new(config).await {
        Ok(client) => {
            info!("Using Redis-based rate limiting");
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("Redis unavailable ({}), continuing with in-memory rate limiting", e);
            None
        }
    }
}

fn build_router(
    limits: &[CompiledLimit],
    store: Option<&Arc<dyn CounterStore>>,
    options: &LimiterOptions,
    state: AppState,
) -> Result<(Router, Vec<Arc<dyn Sweep>>)> {
    let mut registries: Vec<Arc<dyn Sweep>> = Vec::new();
    let mut router = Router::new();
    let mut global = None;

    for limit in limits {
        let selected = select_limiter(&limit.policy, store, options)?;
        if let Some(registry) = selected.local_registry() {
            registries.push(registry as Arc<dyn Sweep>);
        }

        let layer = AdmissionLayer::new(selected.limiter(), limit.scope.extractor())
            .with_clock(options.clock.clone())
            .with_metrics(state.metrics.clone());

        info!(
            path = limit.path.as_deref().unwrap_or("*"),
            scope = ?limit.scope,
            backend = selected.limiter().backend(),
            "Admission limit configured"
        );

        match &limit.path {
            Some(path) => router = router.route(path, any(accepted).layer(layer)),
            None => global = Some(layer),
        }
    }

    if let Some(layer) = global {
        router = router.layer(layer);
    }

    let router = router
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    Ok((router, registries))
}

/// Stand-in for the protected handler behind a limited route
async fn accepted(uri: Uri) -> Json<serde_json::Value> {
    Json(json!({
        "status": "accepted",
        "path": uri.path(),
    }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let store_ok = match &state.store {
        Some(store) => store.health_check().await.is_ok(),
        None => true,
    };

    if store_ok {
        Ok(Json(json!({
            "status": "healthy",
            "shared_store": state.store.is_some(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_err() {
        warn!("Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}
