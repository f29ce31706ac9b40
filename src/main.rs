use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use admission_control::{
    cache::build_store,
    config::{EndpointClass, Settings},
    metrics::Metrics,
    middleware::{admission_middleware, require_admin, AdmissionState, RoutePolicy},
    service::{AdmissionChain, AuthMode},
    tier::StaticTierLookup,
    token::Claim,
    utils::TimeSource,
    Tier,
};

#[derive(Clone)]
struct AppState {
    chain: Arc<AdmissionChain>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admission_control=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting admission control server");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref())?;

    let metrics = Arc::new(Metrics::new()?);
    let time_source = TimeSource::new();
    let store = build_store(&settings.store, time_source.clone()).await?;
    let lookup = Arc::new(StaticTierLookup::from_overrides(&settings.tiers.overrides));
    let chain = Arc::new(AdmissionChain::new(
        &settings,
        lookup,
        store,
        metrics.clone(),
        time_source,
    ));

    let state = AppState { chain, metrics };
    let addr = settings.server.listen.parse::<SocketAddr>()?;

    tokio::select! {
        result = start_http_server(state, addr) => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    let chain = state.chain.clone();
    let admit = |class: EndpointClass, auth_mode: AuthMode| {
        from_fn_with_state(
            AdmissionState::new(chain.clone(), RoutePolicy::new(class, auth_mode)),
            admission_middleware,
        )
    };

    Router::new()
        .route(
            "/auth/register",
            post(register).layer(admit(EndpointClass::Auth, AuthMode::Optional)),
        )
        .route(
            "/auth/login",
            post(login).layer(admit(EndpointClass::Auth, AuthMode::Optional)),
        )
        .route(
            "/users/profile",
            get(profile).layer(admit(EndpointClass::General, AuthMode::Required)),
        )
        .route(
            "/users",
            get(list_users)
                .layer(from_fn(require_admin))
                .layer(admit(EndpointClass::General, AuthMode::Required)),
        )
        .route(
            "/files/upload",
            post(upload).layer(admit(EndpointClass::Upload, AuthMode::Required)),
        )
        .route(
            "/ai/chat",
            post(ai_chat).layer(admit(EndpointClass::Ai, AuthMode::Required)),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn register() -> Json<serde_json::Value> {
    Json(json!({ "message": "Register endpoint" }))
}

async fn login() -> Json<serde_json::Value> {
    Json(json!({ "message": "Login endpoint" }))
}

async fn profile(
    Extension(claim): Extension<Claim>,
    Extension(tier): Extension<Tier>,
) -> Json<serde_json::Value> {
    Json(json!({
        "subject": claim.sub,
        "role": claim.role,
        "tier": tier,
        "expires_at": claim.expires_at().map(|t| t.to_rfc3339()),
    }))
}

async fn list_users() -> Json<serde_json::Value> {
    Json(json!({ "message": "List users endpoint" }))
}

async fn upload() -> Json<serde_json::Value> {
    Json(json!({ "message": "File upload endpoint" }))
}

async fn ai_chat() -> Json<serde_json::Value> {
    Json(json!({ "message": "AI chat endpoint" }))
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.chain.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
