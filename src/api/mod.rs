//! Admin HTTP surface (spec §6): `/ready`, `/health`, `/metrics`, `/stats`.
//! Grounded on the teacher's `src/api/mod.rs` (shared `AppState` behind
//! `Arc`, `TraceLayer`, one handler per route).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::manager::{Manager, Stats};
use crate::metrics;

pub struct AppState {
    pub manager: Arc<Manager>,
}

pub fn router(manager: Arc<Manager>) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(manager: Arc<Manager>, port: u16) -> eyre::Result<()> {
    let app = router(manager);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "admin HTTP surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.manager.is_started() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "healthy")
}

async fn metrics_handler() -> String {
    metrics::encode()
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(state.manager.stats().await)
}
