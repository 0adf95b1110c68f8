// Migrate progress and sessions from another server into the configured one

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{parse_form, ToolContext};
use crate::migration::{self, MigrationSettings};
use crate::services::abs::AbsClient;

pub const ID: &str = "migrate-server";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateServerForm {
    /// The old server
    pub server_url: String,
    pub server_token: String,
    /// Minutes; kept verbatim so validation happens in one place
    #[serde(deserialize_with = "as_text")]
    pub api_key_expires_in: String,
}

fn as_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: MigrateServerForm = parse_form(form)?;
    let settings = MigrationSettings {
        api_key_name: ctx.migration.api_key_name.clone(),
        sessions_page_size: ctx.migration.sessions_page_size,
        ..MigrationSettings::new(form.api_key_expires_in)
    };
    // Fail on a bad expiry before the old server is contacted
    migration::parse_expiry_seconds(&settings.api_key_expires_in)?;

    let old = AbsClient::new(&form.server_url, &form.server_token, ctx.client.timeout())
        .context("Invalid old server")?
        .with_items_page_size(ctx.migration.items_page_size);

    let report = migration::migrate(&old, &ctx.client, &settings, &mut ctx.log).await?;
    let summary = report.summary();
    ctx.log.info(summary.clone());
    ctx.attach(&report);

    Ok(summary)
}
