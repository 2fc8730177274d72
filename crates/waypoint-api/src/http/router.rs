//! Axum router configuration with middleware.
//!
//! Workflow endpoints live under `/workflows/{name}` (the URL the scheduler
//! delivers to). Management routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/runs", get(handlers::runs::list_runs))
        .route("/runs/{run_id}", get(handlers::runs::get_run))
        .route("/runs/{run_id}/cancel", post(handlers::runs::cancel_run))
        .route("/workflows", get(handlers::runs::list_workflows))
        .route("/workflows/{name}/trigger", post(handlers::runs::trigger_workflow))
        .route("/notify", post(handlers::notify::notify));

    Router::new()
        .route("/workflows/{name}", post(handlers::endpoint::invoke_workflow))
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
