// In-memory media server for pipeline tests

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::models::{ApiKey, Library, LibraryItem, NewApiKey, User};
use crate::services::abs::{ApiError, MediaServer};

pub fn library(id: &str, name: &str) -> Library {
    Library {
        id: id.to_string(),
        name: name.to_string(),
        media_type: None,
    }
}

pub fn user(id: &str, username: &str, email: Option<&str>) -> User {
    User {
        id: id.to_string(),
        username: username.to_string(),
        email: email.map(str::to_string),
        user_type: None,
    }
}

pub fn book(
    id: &str,
    title: &str,
    subtitle: Option<&str>,
    asin: Option<&str>,
    isbn: Option<&str>,
) -> LibraryItem {
    serde_json::from_value(json!({
        "id": id,
        "mediaType": "book",
        "media": {
            "id": format!("{}_media", id),
            "metadata": { "title": title, "subtitle": subtitle, "asin": asin, "isbn": isbn }
        }
    }))
    .unwrap()
}

pub fn podcast(id: &str, title: &str, episode_ids: &[&str]) -> LibraryItem {
    let episodes: Vec<_> = episode_ids
        .iter()
        .map(|e| json!({ "id": e, "title": format!("Episode {}", e) }))
        .collect();
    serde_json::from_value(json!({
        "id": id,
        "mediaType": "podcast",
        "media": {
            "id": format!("{}_media", id),
            "metadata": { "title": title },
            "episodes": episodes
        }
    }))
    .unwrap()
}

#[derive(Default)]
struct State {
    libraries: Vec<Library>,
    users: Vec<User>,
    items: HashMap<String, Vec<LibraryItem>>,
    progress: HashMap<String, Vec<Value>>,
    sessions: Vec<Value>,
    /// `<token> <METHOD> <path>` of every request, in order
    calls: Vec<String>,
    progress_pushed: Vec<(String, Vec<Value>)>,
    sessions_pushed: Vec<(String, Vec<Value>)>,
    keys_created: Vec<NewApiKey>,
    keys_revoked: Vec<String>,
    fail_revoke: bool,
    fail_progress_for: HashSet<String>,
    fail_key_for: HashSet<String>,
    /// GETs whose path starts with one of these fail
    fail_gets: Vec<String>,
}

/// Cloning shares state; `impersonate` yields a view with another token.
#[derive(Clone)]
pub struct FakeServer {
    base_url: String,
    token: String,
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            token: "root".to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn record(&self, method: &str, path: &str) {
        let line = format!("{} {} {}", self.token, method, path);
        self.with(|s| s.calls.push(line));
    }

    /// Record a GET and fail it when its path was marked as failing
    fn get(&self, path: &str) -> Result<(), ApiError> {
        self.record("GET", path);
        if self.with(|s| s.fail_gets.iter().any(|prefix| path.starts_with(prefix.as_str()))) {
            return Err(Self::failure(Method::GET, path));
        }
        Ok(())
    }

    fn failure(method: Method, path: &str) -> ApiError {
        ApiError::Status {
            method,
            path: path.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        }
    }

    pub fn add_library(&self, library: Library) {
        self.with(|s| s.libraries.push(library));
    }

    pub fn add_user(&self, user: User) {
        self.with(|s| s.users.push(user));
    }

    pub fn add_items(&self, library_id: &str, items: Vec<LibraryItem>) {
        self.with(|s| s.items.entry(library_id.to_string()).or_default().extend(items));
    }

    pub fn add_progress(&self, user_id: &str, record: Value) {
        self.with(|s| s.progress.entry(user_id.to_string()).or_default().push(record));
    }

    pub fn add_session(&self, session: Value) {
        self.with(|s| s.sessions.push(session));
    }

    pub fn fail_revocation(&self) {
        self.with(|s| s.fail_revoke = true);
    }

    /// Progress pushes authenticated with the key of `user_id` fail
    pub fn fail_progress_for(&self, user_id: &str) {
        let token = Self::token_for(user_id);
        self.with(|s| s.fail_progress_for.insert(token));
    }

    /// Key creation for `user_id` fails
    pub fn fail_key_creation_for(&self, user_id: &str) {
        self.with(|s| s.fail_key_for.insert(user_id.to_string()));
    }

    pub fn fail_get(&self, path_prefix: &str) {
        self.with(|s| s.fail_gets.push(path_prefix.to_string()));
    }

    pub fn token_for(user_id: &str) -> String {
        format!("tok_{}", user_id)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn progress_pushed(&self) -> Vec<(String, Vec<Value>)> {
        self.with(|s| s.progress_pushed.clone())
    }

    pub fn sessions_pushed(&self) -> Vec<(String, Vec<Value>)> {
        self.with(|s| s.sessions_pushed.clone())
    }

    pub fn keys_created(&self) -> Vec<NewApiKey> {
        self.with(|s| s.keys_created.clone())
    }

    pub fn keys_revoked(&self) -> Vec<String> {
        self.with(|s| s.keys_revoked.clone())
    }
}

#[async_trait]
impl MediaServer for FakeServer {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn libraries(&self) -> Result<Vec<Library>, ApiError> {
        self.get("/api/libraries")?;
        Ok(self.with(|s| s.libraries.clone()))
    }

    async fn users(&self) -> Result<Vec<User>, ApiError> {
        self.get("/api/users")?;
        Ok(self.with(|s| s.users.clone()))
    }

    async fn library_items(&self, library_id: &str) -> Result<Vec<LibraryItem>, ApiError> {
        self.get(&format!("/api/libraries/{}/items", library_id))?;
        Ok(self.with(|s| s.items.get(library_id).cloned().unwrap_or_default()))
    }

    async fn item(&self, item_id: &str) -> Result<LibraryItem, ApiError> {
        let path = format!("/api/items/{}", item_id);
        self.get(&path)?;
        self.with(|s| {
            s.items
                .values()
                .flatten()
                .find(|item| item.id == item_id)
                .cloned()
        })
        .ok_or_else(|| ApiError::Status {
            method: Method::GET,
            path,
            status: StatusCode::NOT_FOUND,
            body: "Not Found".to_string(),
        })
    }

    async fn media_progress(&self, user_id: &str) -> Result<Vec<Value>, ApiError> {
        self.get(&format!("/api/users/{}", user_id))?;
        Ok(self.with(|s| s.progress.get(user_id).cloned().unwrap_or_default()))
    }

    async fn sessions(&self, items_per_page: u64) -> Result<Vec<Value>, ApiError> {
        self.get(&format!("/api/sessions?itemsPerPage={}", items_per_page))?;
        Ok(self.with(|s| s.sessions.clone()))
    }

    async fn create_api_key(&self, request: &NewApiKey) -> Result<ApiKey, ApiError> {
        self.record("POST", "/api/api-keys");
        if self.with(|s| s.fail_key_for.contains(&request.user_id)) {
            return Err(Self::failure(Method::POST, "/api/api-keys"));
        }
        self.with(|s| s.keys_created.push(request.clone()));
        Ok(ApiKey {
            id: format!("key_{}", request.user_id),
            api_key: Self::token_for(&request.user_id),
        })
    }

    async fn delete_api_key(&self, key_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/api-keys/{}", key_id);
        self.record("DELETE", &path);
        if self.with(|s| s.fail_revoke) {
            return Err(Self::failure(Method::DELETE, &path));
        }
        self.with(|s| s.keys_revoked.push(key_id.to_string()));
        Ok(())
    }

    async fn batch_update_progress(&self, progress: &[Value]) -> Result<(), ApiError> {
        let path = "/api/me/progress/batch/update";
        self.record("PATCH", path);
        if self.with(|s| s.fail_progress_for.contains(&self.token)) {
            return Err(Self::failure(Method::PATCH, path));
        }
        let token = self.token.clone();
        self.with(|s| s.progress_pushed.push((token, progress.to_vec())));
        Ok(())
    }

    async fn import_sessions(&self, sessions: &[Value]) -> Result<(), ApiError> {
        self.record("POST", "/api/session/local-all");
        let token = self.token.clone();
        self.with(|s| s.sessions_pushed.push((token, sessions.to_vec())));
        Ok(())
    }

    fn impersonate(&self, token: &str) -> Box<dyn MediaServer> {
        Box::new(Self {
            base_url: self.base_url.clone(),
            token: token.to_string(),
            state: self.state.clone(),
        })
    }
}
