// Canned-response server for tool tests

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::MigrationConfig;
use crate::services::abs::AbsClient;

use super::ToolContext;

const STATUS_KEY: &str = "__status";

/// Route body that makes the mock answer with `code` instead of JSON
pub fn status(code: u16) -> Value {
    serde_json::json!({ "__status": code })
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub body: Value,
}

#[derive(Default)]
struct MockState {
    /// `"<METHOD> <path>"` (with or without query) -> response body
    routes: HashMap<String, Value>,
    requests: Vec<Recorded>,
}

pub struct MockServer {
    pub base_url: String,
    state: Arc<Mutex<MockState>>,
}

impl MockServer {
    pub async fn start(routes: &[(&str, Value)]) -> Self {
        let state = Arc::new(Mutex::new(MockState {
            routes: routes
                .iter()
                .map(|(route, body)| (route.to_string(), body.clone()))
                .collect(),
            requests: Vec::new(),
        }));

        let router = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn context(&self) -> ToolContext {
        let client = AbsClient::new(&self.base_url, "admin-token", Duration::from_secs(5)).unwrap();
        ToolContext::new(client, MigrationConfig::default())
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests other than GET, in order
    pub fn writes(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET")
            .collect()
    }
}

async fn handle(
    State(state): State<Arc<Mutex<MockState>>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let full_path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let mut state = state.lock().unwrap();
    state.requests.push(Recorded {
        method: method.to_string(),
        path: full_path.clone(),
        body,
    });

    let exact = format!("{} {}", method, full_path);
    let without_query = format!("{} {}", method, uri.path());
    match state
        .routes
        .get(&exact)
        .or_else(|| state.routes.get(&without_query))
    {
        Some(response) => match response.get(STATUS_KEY).and_then(Value::as_u64) {
            Some(code) => StatusCode::from_u16(code as u16)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response(),
            None => Json(response.clone()).into_response(),
        },
        None if method != Method::GET => Json(Value::Null).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
