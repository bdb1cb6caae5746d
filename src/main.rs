use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod config;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;
mod store;

use config::AppConfig;
use services::mpesa_gateway::MpesaGateway;
use state::AppState;
use store::memory::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AppConfig::from_env();
    tracing::info!(
        "M-Pesa environment: {} (short code {})",
        config.mpesa_environment,
        config.mpesa_short_code
    );

    let app_state = initialize_app_state(config.clone()).await?;
    let app = build_router(app_state);

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    tracing::info!("server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn initialize_app_state(config: AppConfig) -> anyhow::Result<AppState> {
    let gateway = Arc::new(
        MpesaGateway::new(config.clone())
            .map_err(|e| anyhow::anyhow!("failed to initialize gateway: {}", e))?,
    );

    // Warm up the token cache to surface credential problems at startup.
    // Non-fatal: the gateway re-acquires on first use.
    match gateway.access_token().await {
        Ok(_) => tracing::info!("M-Pesa access token obtained"),
        Err(e) => tracing::warn!("could not obtain M-Pesa access token yet: {}", e),
    }

    let store = Arc::new(MemoryStore::new());
    Ok(AppState::new(
        store.clone(),
        store,
        gateway,
        config.jwt_secret,
        config.phone_country_prefix,
    ))
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .nest("/payments", routes::payments::payment_routes(app_state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
