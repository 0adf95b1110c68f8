// Audiobookshelf REST API client
// Source and destination servers of a migration expose the same surface, so one
// client type talks to both; impersonation is just a second client with another token.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::models::{ApiKey, CreatedApiKey, Library, LibraryItem, NewApiKey, User};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Longest response body excerpt kept in an error message
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{method} {path} failed: {source}")]
    Transport {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("failed to decode response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid server url '{0}' (expected http:// or https://)")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The part of the server API the migration pipeline depends on.
///
/// Kept object safe so the pipeline can run against any server pair, including
/// in-memory fakes in tests.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Base URL used to label log lines
    fn base_url(&self) -> &str;

    async fn libraries(&self) -> Result<Vec<Library>, ApiError>;

    async fn users(&self) -> Result<Vec<User>, ApiError>;

    async fn library_items(&self, library_id: &str) -> Result<Vec<LibraryItem>, ApiError>;

    /// Full item detail, including podcast episode lists
    async fn item(&self, item_id: &str) -> Result<LibraryItem, ApiError>;

    /// Raw `mediaProgress` records of one user
    async fn media_progress(&self, user_id: &str) -> Result<Vec<Value>, ApiError>;

    /// Raw listening sessions of every user, in a single page
    async fn sessions(&self, items_per_page: u64) -> Result<Vec<Value>, ApiError>;

    async fn create_api_key(&self, request: &NewApiKey) -> Result<ApiKey, ApiError>;

    async fn delete_api_key(&self, key_id: &str) -> Result<(), ApiError>;

    /// Upsert progress records of the authenticated user
    async fn batch_update_progress(&self, progress: &[Value]) -> Result<(), ApiError>;

    /// Import finished sessions for the authenticated user
    async fn import_sessions(&self, sessions: &[Value]) -> Result<(), ApiError>;

    /// Same server, authenticated with another bearer token
    fn impersonate(&self, token: &str) -> Box<dyn MediaServer>;
}

/// Audiobookshelf API client
#[derive(Clone)]
pub struct AbsClient {
    client: Client,
    base_url: String,
    token: String,
    timeout: Duration,
    items_page_size: usize,
}

impl std::fmt::Debug for AbsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbsClient")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("timeout", &self.timeout)
            .field("items_page_size", &self.items_page_size)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ResultsPage<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LibrariesResponse {
    #[serde(default)]
    libraries: Vec<Library>,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDetailResponse {
    #[serde(default)]
    media_progress: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<Value>,
}

impl AbsClient {
    /// Create a client for the server at `base_url`
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
            token: token.to_string(),
            timeout,
            items_page_size: 0,
        })
    }

    /// Fetch library items in pages of `size` (0 = one unpaginated request)
    pub fn with_items_page_size(mut self, size: usize) -> Self {
        self.items_page_size = size;
        self
    }

    /// Clone of this client that authenticates with `token`
    pub fn with_token(&self, token: &str) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: token.to_string(),
            timeout: self.timeout,
            items_page_size: self.items_page_size,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<String, ApiError> {
        tracing::debug!("{} {}{}", method, self.base_url, path);

        let mut request = self
            .client
            .request(method.clone(), self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            method: method.clone(),
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| ApiError::Transport {
                method: method.clone(),
                path: path.to_string(),
                source,
            })?;

        if !status.is_success() {
            tracing::warn!("{} {} failed: {}", method, path, status);
            let mut body = text;
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ApiError::Status {
                method,
                path: path.to_string(),
                status,
                body,
            });
        }

        Ok(text)
    }

    fn decode<T: DeserializeOwned>(path: &str, text: &str) -> Result<T, ApiError> {
        // Some endpoints answer with an empty body
        let text = if text.trim().is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let text = self.send::<()>(Method::GET, path, None).await?;
        Self::decode(path, &text)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let text = self.send(Method::POST, path, Some(body)).await?;
        Self::decode(path, &text)
    }

    /// POST whose response body is irrelevant
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        self.send(Method::POST, path, Some(body)).await.map(|_| ())
    }

    /// PATCH whose response body is irrelevant
    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        self.send(Method::PATCH, path, Some(body)).await.map(|_| ())
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send::<()>(Method::DELETE, path, None).await.map(|_| ())
    }

    /// Collect `results` of a list endpoint, page by page when paging is enabled.
    /// Pages are requested strictly one after another.
    pub async fn paged_results<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ApiError> {
        if self.items_page_size == 0 {
            let page: ResultsPage<T> = self.get_json(path).await?;
            return Ok(page.results);
        }

        let separator = if path.contains('?') { '&' } else { '?' };
        let mut results = Vec::new();
        let mut page_index = 0;

        loop {
            let page_path = format!(
                "{}{}limit={}&page={}",
                path, separator, self.items_page_size, page_index
            );
            let page: ResultsPage<T> = self.get_json(&page_path).await?;
            let received = page.results.len();
            results.extend(page.results);

            let total = page.total.unwrap_or(results.len());
            if received == 0 || received < self.items_page_size || results.len() >= total {
                break;
            }
            page_index += 1;
        }

        tracing::debug!("Fetched {} results from {} in {} page(s)", results.len(), path, page_index + 1);
        Ok(results)
    }

    /// Items of a library narrowed by a server side filter (`genres.<b64>`, `series.<b64>`, ...)
    pub async fn filtered_library_items(
        &self,
        library_id: &str,
        filter: &str,
    ) -> Result<Vec<LibraryItem>, ApiError> {
        self.paged_results(&format!(
            "/api/libraries/{}/items?filter={}",
            library_id, filter
        ))
        .await
    }
}

#[async_trait]
impl MediaServer for AbsClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn libraries(&self) -> Result<Vec<Library>, ApiError> {
        let response: LibrariesResponse = self.get_json("/api/libraries").await?;
        Ok(response.libraries)
    }

    async fn users(&self) -> Result<Vec<User>, ApiError> {
        let response: UsersResponse = self.get_json("/api/users").await?;
        Ok(response.users)
    }

    async fn library_items(&self, library_id: &str) -> Result<Vec<LibraryItem>, ApiError> {
        self.paged_results(&format!("/api/libraries/{}/items", library_id))
            .await
    }

    async fn item(&self, item_id: &str) -> Result<LibraryItem, ApiError> {
        self.get_json(&format!("/api/items/{}", item_id)).await
    }

    async fn media_progress(&self, user_id: &str) -> Result<Vec<Value>, ApiError> {
        let response: UserDetailResponse = self.get_json(&format!("/api/users/{}", user_id)).await?;
        Ok(response.media_progress)
    }

    async fn sessions(&self, items_per_page: u64) -> Result<Vec<Value>, ApiError> {
        let response: SessionsResponse = self
            .get_json(&format!("/api/sessions?itemsPerPage={}", items_per_page))
            .await?;
        Ok(response.sessions)
    }

    async fn create_api_key(&self, request: &NewApiKey) -> Result<ApiKey, ApiError> {
        let created: CreatedApiKey = self.post_json("/api/api-keys", request).await?;
        Ok(created.api_key)
    }

    async fn delete_api_key(&self, key_id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/api/api-keys/{}", key_id)).await
    }

    async fn batch_update_progress(&self, progress: &[Value]) -> Result<(), ApiError> {
        self.patch("/api/me/progress/batch/update", progress).await
    }

    async fn import_sessions(&self, sessions: &[Value]) -> Result<(), ApiError> {
        self.post(
            "/api/session/local-all",
            &serde_json::json!({ "sessions": sessions }),
        )
        .await
    }

    fn impersonate(&self, token: &str) -> Box<dyn MediaServer> {
        Box::new(self.with_token(token))
    }
}
