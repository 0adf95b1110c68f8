// Tool runner
// Every tool gets a fresh ToolContext (client, audit log, run id), runs to completion
// and is turned into a ToolResult; errors never escape as HTTP failures.

mod delete_sessions;
mod force_metadata;
mod listen_date;
mod migrate_server;
mod path_tags;
mod quick_match_chapters;
mod remove_empty_authors;
mod rename_series;
mod split_genres;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::services::abs::{AbsClient, MediaServer};
use crate::services::audit::AuditLog;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub group: &'static str,
}

pub const TOOLS: &[ToolDefinition] = &[
    ToolDefinition {
        id: split_genres::ID,
        title: "Split Genres",
        description: "Separate combined genres or tags into individual entries throughout your libraries.",
        group: "metadata",
    },
    ToolDefinition {
        id: remove_empty_authors::ID,
        title: "Remove Empty Authors",
        description: "Removes all authors who do not have any books associated with them.",
        group: "metadata",
    },
    ToolDefinition {
        id: delete_sessions::ID,
        title: "Delete Large Listening Sessions",
        description: "Deletes all listening sessions that exceed a specified duration.",
        group: "sessions",
    },
    ToolDefinition {
        id: force_metadata::ID,
        title: "Force Metadata",
        description: "Tags every book in the selected libraries to force a metadata refresh.",
        group: "metadata",
    },
    ToolDefinition {
        id: rename_series::ID,
        title: "Rename Series",
        description: "Renames a book series in the selected library.",
        group: "metadata",
    },
    ToolDefinition {
        id: path_tags::ID,
        title: "Path Tag Updater",
        description: "Adds tags or genres to items whose path matches a regular expression.",
        group: "metadata",
    },
    ToolDefinition {
        id: listen_date::ID,
        title: "Listen Date Updater",
        description: "Sets the finished date of the selected items for the current user.",
        group: "sessions",
    },
    ToolDefinition {
        id: quick_match_chapters::ID,
        title: "Match Audiobook Chapters",
        description: "Matches chapters using the provider ASIN lookup or the audio tracks.",
        group: "chapters",
    },
    ToolDefinition {
        id: migrate_server::ID,
        title: "Migrate Server",
        description: "Copies progress and listening sessions from another server into this one.",
        group: "migration",
    },
];

pub fn find_tool(id: &str) -> Option<&'static ToolDefinition> {
    TOOLS.iter().find(|tool| tool.id == id)
}

/// Outcome of one tool run, as returned to the UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// State of a single tool execution; never shared between runs
pub struct ToolContext {
    pub client: AbsClient,
    pub migration: MigrationConfig,
    pub log: AuditLog,
    pub run_id: Uuid,
    data: Option<Value>,
    started: Instant,
}

impl ToolContext {
    pub fn new(client: AbsClient, migration: MigrationConfig) -> Self {
        Self {
            client,
            migration,
            log: AuditLog::new(),
            run_id: Uuid::new_v4(),
            data: None,
            started: Instant::now(),
        }
    }

    /// Structured payload returned next to the log
    pub fn attach(&mut self, data: impl Serialize) {
        match serde_json::to_value(data) {
            Ok(value) => self.data = Some(value),
            Err(e) => tracing::warn!("Failed to serialize result data: {}", e),
        }
    }

    fn finish(self, tool: &ToolDefinition, outcome: Result<String>) -> ToolResult {
        let elapsed = self.started.elapsed();
        let (success, message, error) = match outcome {
            Ok(message) => (true, message, None),
            Err(e) => {
                tracing::warn!("Tool run {} failed: {:#}", self.run_id, e);
                (false, format!("{} failed", tool.title), Some(format!("{:#}", e)))
            }
        };
        tracing::debug!(
            "Tool run {} finished in {:?} with {} warnings",
            self.run_id,
            elapsed,
            self.log.warnings().count()
        );

        ToolResult {
            success,
            message,
            error,
            timestamp: Utc::now(),
            run_id: self.run_id,
            logs: self.log.lines(),
            data: self.data,
        }
    }
}

/// Run the tool `id` with the JSON `form`. `None` when no such tool exists.
pub async fn run_tool(
    id: &str,
    client: AbsClient,
    migration: MigrationConfig,
    form: Value,
) -> Option<ToolResult> {
    let tool = find_tool(id)?;
    let mut ctx = ToolContext::new(client, migration);
    tracing::info!("Running tool {} ({})", tool.id, ctx.run_id);

    let outcome = match tool.id {
        split_genres::ID => split_genres::run(&mut ctx, form).await,
        remove_empty_authors::ID => remove_empty_authors::run(&mut ctx, form).await,
        delete_sessions::ID => delete_sessions::run(&mut ctx, form).await,
        force_metadata::ID => force_metadata::run(&mut ctx, form).await,
        rename_series::ID => rename_series::run(&mut ctx, form).await,
        path_tags::ID => path_tags::run(&mut ctx, form).await,
        listen_date::ID => listen_date::run(&mut ctx, form).await,
        quick_match_chapters::ID => quick_match_chapters::run(&mut ctx, form).await,
        migrate_server::ID => migrate_server::run(&mut ctx, form).await,
        _ => return None,
    };

    Some(ctx.finish(tool, outcome))
}

fn parse_form<T: DeserializeOwned>(form: Value) -> Result<T> {
    serde_json::from_value(form).context("Invalid form data")
}

/// Form fields typed in a text box arrive as strings ("24"); accept both forms.
fn lenient_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + DeserializeOwned,
    T::Err: std::fmt::Display,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.trim().parse().map_err(de::Error::custom),
        other => serde_json::from_value(other).map_err(de::Error::custom),
    }
}

/// Requested library ids that exist on the server, or every library when none are requested
async fn library_ids(client: &AbsClient, requested: &[String]) -> Result<Vec<String>> {
    let libraries = client
        .libraries()
        .await
        .context("Failed to fetch libraries")?;
    Ok(libraries
        .into_iter()
        .filter(|lib| requested.is_empty() || requested.contains(&lib.id))
        .map(|lib| lib.id)
        .collect())
}

/// Server side filter expression, e.g. `genres.<base64url>`
fn item_filter(kind: &str, value: &str) -> String {
    format!("{}.{}", kind, URL_SAFE_NO_PAD.encode(value.as_bytes()))
}

/// Append `extra` to `existing`, dropping duplicates and keeping first occurrence order
fn merge_unique<I>(existing: &[String], extra: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    existing
        .iter()
        .cloned()
        .chain(extra)
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

async fn batch_update(client: &AbsClient, payload: &[Value]) -> Result<()> {
    client
        .post("/api/items/batch/update", payload)
        .await
        .context("Batch update failed")
}
