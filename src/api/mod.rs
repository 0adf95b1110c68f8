use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

mod tools;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/tools", tools::routes())
}

/// Full application router. The browser UI is served from another origin, hence permissive CORS.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
