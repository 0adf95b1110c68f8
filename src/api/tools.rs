use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::tools::{self, ToolDefinition, ToolResult};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tools))
        .route("/:id", post(run_tool))
}

async fn list_tools() -> Json<&'static [ToolDefinition]> {
    Json(tools::TOOLS)
}

/// Body is the tool's form. Tool failures are reported inside the result, not as HTTP errors.
async fn run_tool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<ToolResult>, (StatusCode, Json<Value>)> {
    let form = body.map(|Json(form)| form).unwrap_or_else(|| json!({}));

    tools::run_tool(&id, state.client.clone(), state.migration.clone(), form)
        .await
        .map(Json)
        .ok_or_else(|| {
            tracing::debug!("Unknown tool requested: {}", id);
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Unknown tool: {}", id) })),
            )
        })
}
