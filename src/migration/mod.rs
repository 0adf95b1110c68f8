// Server to server migration
// Pipeline: fetch -> reconcile libraries -> reconcile users -> reconcile items ->
// rewrite progress -> rewrite sessions -> replay per user under a temporary API key.
// Everything before replay is all-or-nothing; replay is best effort per user.

pub mod identity;
pub mod rewrite;

#[cfg(test)]
pub(crate) mod fake;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::models::NewApiKey;
use crate::services::abs::{ApiError, MediaServer};
use crate::services::audit::AuditLog;
use identity::{IdentityMap, MediaKey};
use rewrite::{deep_replace, SubstitutionTable};

pub const DEFAULT_API_KEY_NAME: &str = "Migration Script";
pub const DEFAULT_SESSIONS_PAGE_SIZE: u64 = 999_999;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("apiKeyExpiresIn must be a numeric string (minutes), got '{0}'")]
    InvalidExpiry(String),

    #[error("no non-podcast item found; at least one matched non-podcast item is required")]
    NoNonPodcastItem,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Caller supplied settings of one run
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Lifetime of each temporary API key, in minutes, as entered by the user
    pub api_key_expires_in: String,
    pub api_key_name: String,
    pub sessions_page_size: u64,
}

impl MigrationSettings {
    pub fn new(api_key_expires_in: impl Into<String>) -> Self {
        Self {
            api_key_expires_in: api_key_expires_in.into(),
            api_key_name: DEFAULT_API_KEY_NAME.to_string(),
            sessions_page_size: DEFAULT_SESSIONS_PAGE_SIZE,
        }
    }
}

/// Parse the key lifetime (minutes) and convert it to seconds
pub fn parse_expiry_seconds(raw: &str) -> Result<u64, MigrationError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(|minutes| minutes.checked_mul(60))
        .ok_or_else(|| MigrationError::InvalidExpiry(raw.to_string()))
}

/// A session that could not be resolved and was attached to the fallback item
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectedSession {
    pub session_id: String,
    /// Original `itemId;episodeId` on the old server
    pub original_key: String,
    pub fallback_item_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    #[serde(skip)]
    pub identity: IdentityMap,
    pub libraries_mapped: usize,
    pub users_mapped: usize,
    pub items_mapped: usize,
    pub progress_migrated: usize,
    pub progress_dropped: usize,
    pub sessions_migrated: usize,
    pub sessions_redirected: Vec<RedirectedSession>,
    pub users_replayed: Vec<String>,
    pub users_failed: Vec<String>,
    pub leaked_api_keys: Vec<String>,
}

impl MigrationReport {
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Migrated {} libraries, {} users, {} items; {} progress records ({} dropped), {} sessions ({} redirected to the fallback item); {} users replayed",
            self.libraries_mapped,
            self.users_mapped,
            self.items_mapped,
            self.progress_migrated,
            self.progress_dropped,
            self.sessions_migrated,
            self.sessions_redirected.len(),
            self.users_replayed.len(),
        );
        if !self.users_failed.is_empty() {
            summary.push_str(&format!(", {} failed", self.users_failed.len()));
        }
        if !self.leaked_api_keys.is_empty() {
            summary.push_str(&format!(
                ". {} API key(s) could not be revoked: {}",
                self.leaked_api_keys.len(),
                self.leaked_api_keys.join(", ")
            ));
        }
        summary
    }
}

/// Rewritten payloads waiting to be replayed for one new user
#[derive(Debug, Default)]
struct UserPayload {
    progress: Vec<Value>,
    sessions: Vec<Value>,
}

/// Per-run context; owns nothing global and is dropped when the run ends.
struct Pipeline<'a> {
    old: &'a dyn MediaServer,
    new: &'a dyn MediaServer,
    log: &'a mut AuditLog,
    settings: &'a MigrationSettings,
    expires_in_secs: u64,
    started: Instant,
    report: MigrationReport,
}

/// Copy libraries' users progress and listening sessions from `old` into `new`.
///
/// Fails before any request when the key lifetime is invalid, and before any
/// replay when fetching or reconciling fails.
pub async fn migrate(
    old: &dyn MediaServer,
    new: &dyn MediaServer,
    settings: &MigrationSettings,
    log: &mut AuditLog,
) -> Result<MigrationReport, MigrationError> {
    let expires_in_secs = parse_expiry_seconds(&settings.api_key_expires_in)?;

    let pipeline = Pipeline {
        old,
        new,
        log,
        settings,
        expires_in_secs,
        started: Instant::now(),
        report: MigrationReport::default(),
    };
    pipeline.run().await
}

impl<'a> Pipeline<'a> {
    async fn run(mut self) -> Result<MigrationReport, MigrationError> {
        self.log.info(format!(
            "Migrating from {} to {}",
            self.old.base_url(),
            self.new.base_url()
        ));

        let identity = self.reconcile().await?;
        let table = identity.substitution_table();
        tracing::debug!("Substitution table has {} entries", table.len());

        let mut payloads = self.collect_progress(&identity, &table).await?;
        self.collect_sessions(&identity, &table, &mut payloads).await?;
        self.report.identity = identity;

        self.replay(payloads).await;

        self.log.info(format!(
            "Migration finished in {:.1}s",
            self.started.elapsed().as_secs_f64()
        ));
        Ok(self.report)
    }

    async fn reconcile(&mut self) -> Result<IdentityMap, MigrationError> {
        let old_libraries = self.old.libraries().await?;
        let new_libraries = self.new.libraries().await?;
        let old_users = self.old.users().await?;
        let new_users = self.new.users().await?;

        let mut identity = IdentityMap::new();
        identity.libraries = identity::reconcile_libraries(&old_libraries, &new_libraries, self.log);
        identity.users = identity::reconcile_users(&old_users, &new_users, self.log);

        self.log.section("Item Mapping");
        for library in &old_libraries {
            let Some(new_library_id) = identity.libraries.get(&library.id).cloned() else {
                continue;
            };
            self.log.info(format!(
                "Processing library: {} -> {}",
                library.id, new_library_id
            ));

            let old_items = self.old.library_items(&library.id).await?;
            let new_items = self.new.library_items(&new_library_id).await?;
            identity::reconcile_items(
                self.old,
                self.new,
                &old_items,
                &new_items,
                &mut identity,
                self.log,
            )
            .await?;
        }

        let Some(fallback) = identity.fallback_item() else {
            return Err(MigrationError::NoNonPodcastItem);
        };
        self.log.info(format!(
            "Sessions that cannot be resolved will be attached to item {}",
            fallback
        ));

        self.report.libraries_mapped = identity.libraries.len();
        self.report.users_mapped = identity.users.len();
        self.report.items_mapped = identity.items.len();
        Ok(identity)
    }

    async fn collect_progress(
        &mut self,
        identity: &IdentityMap,
        table: &SubstitutionTable,
    ) -> Result<BTreeMap<String, UserPayload>, MigrationError> {
        self.log.section("User Progress");
        let mut payloads: BTreeMap<String, UserPayload> = BTreeMap::new();

        for (old_user, new_user) in &identity.users {
            self.log
                .info(format!("Processing user: {} -> {}", old_user, new_user));
            let records = self.old.media_progress(old_user).await?;
            let payload = payloads.entry(new_user.clone()).or_default();

            for record in &records {
                let resolved = MediaKey::from_record(record)
                    .and_then(|key| identity.resolve_item(&key).map(|new| (key, new)));
                match resolved {
                    Some((key, new_key)) => {
                        payload.progress.push(deep_replace(record, table));
                        self.report.progress_migrated += 1;
                        self.log.info(format!(
                            "User {} item {} mapped to {}",
                            old_user, key, new_key
                        ));
                    }
                    None => {
                        self.report.progress_dropped += 1;
                        self.log.warn(format!(
                            "No mapping found for user {} item {}; progress dropped",
                            old_user,
                            describe_record_item(record)
                        ));
                    }
                }
            }
        }

        Ok(payloads)
    }

    async fn collect_sessions(
        &mut self,
        identity: &IdentityMap,
        table: &SubstitutionTable,
        payloads: &mut BTreeMap<String, UserPayload>,
    ) -> Result<(), MigrationError> {
        self.log.section("Listening Sessions");
        let fallback = identity
            .fallback_item()
            .ok_or(MigrationError::NoNonPodcastItem)?
            .to_string();

        let sessions = self.old.sessions(self.settings.sessions_page_size).await?;
        self.log
            .info(format!("Fetched {} sessions from the old server", sessions.len()));

        let mut orphaned = 0;
        for session in &sessions {
            let mut rewritten = deep_replace(session, table);
            let session_id = session
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();

            let resolved = MediaKey::from_record(session)
                .is_some_and(|key| identity.resolve_item(&key).is_some());
            if !resolved {
                let original_key = describe_record_item(session);
                self.log.warn(format!(
                    "The library item {} of session {} could not be found. Using {} as a fallback",
                    original_key, session_id, fallback
                ));
                if let Some(fields) = rewritten.as_object_mut() {
                    fields.insert("libraryItemId".to_string(), Value::String(fallback.clone()));
                    fields.insert("episodeId".to_string(), Value::Null);
                }
                self.report.sessions_redirected.push(RedirectedSession {
                    session_id: session_id.clone(),
                    original_key,
                    fallback_item_id: fallback.clone(),
                });
            }

            let owner = rewritten.get("userId").and_then(Value::as_str);
            match owner.and_then(|id| payloads.get_mut(id)) {
                Some(payload) => {
                    tracing::debug!("Session {} updated", session_id);
                    payload.sessions.push(rewritten);
                    self.report.sessions_migrated += 1;
                }
                None => orphaned += 1,
            }
        }

        if orphaned > 0 {
            self.log.warn(format!(
                "{} sessions belong to users without a match and are not migrated",
                orphaned
            ));
        }
        Ok(())
    }

    async fn replay(&mut self, payloads: BTreeMap<String, UserPayload>) {
        self.log
            .section("Adding Progress (This may take a while)");
        let owners = identity::invert(&self.report.identity.users)
            .into_iter()
            .map(|(new, old)| (new.to_string(), old.join(", ")))
            .collect::<BTreeMap<_, _>>();

        for (user_id, payload) in &payloads {
            let label = owners.get(user_id).map(String::as_str).unwrap_or("?");
            match self.replay_user(user_id, payload).await {
                Ok(()) => {
                    self.log.info(format!(
                        "Added {} progress records and {} sessions for user {} (old {})",
                        payload.progress.len(),
                        payload.sessions.len(),
                        user_id,
                        label
                    ));
                    self.report.users_replayed.push(user_id.clone());
                }
                Err(e) => {
                    self.log
                        .warn(format!("Replay for user {} abandoned: {}", user_id, e));
                    self.report.users_failed.push(user_id.clone());
                }
            }
        }
    }

    /// Create a key for `user_id`, push its data under that key, always revoke the key.
    async fn replay_user(&mut self, user_id: &str, payload: &UserPayload) -> Result<(), ApiError> {
        let key = self
            .new
            .create_api_key(&NewApiKey {
                name: self.settings.api_key_name.clone(),
                expires_in: self.expires_in_secs,
                is_active: true,
                user_id: user_id.to_string(),
            })
            .await?;

        let impersonated = self.new.impersonate(&key.api_key);
        let pushed = async {
            if !payload.progress.is_empty() {
                impersonated.batch_update_progress(&payload.progress).await?;
            }
            if !payload.sessions.is_empty() {
                impersonated.import_sessions(&payload.sessions).await?;
            }
            Ok::<(), ApiError>(())
        }
        .await;

        if let Err(e) = self.new.delete_api_key(&key.id).await {
            self.log.warn(format!(
                "Could not revoke API key {} of user {}: {}. Revoke it manually",
                key.id, user_id, e
            ));
            self.report.leaked_api_keys.push(key.id.clone());
        }

        pushed
    }
}

fn describe_record_item(record: &Value) -> String {
    match MediaKey::from_record(record) {
        Some(key) => key.to_string(),
        None => "<missing libraryItemId>".to_string(),
    }
}
