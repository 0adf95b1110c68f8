// Set the finished date of items for the authenticated user

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_form, ToolContext};

pub const ID: &str = "listen-date-updater";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenDateForm {
    #[serde(default)]
    pub library_item_ids: Vec<String>,
    pub date_to_set: String,
}

/// RFC 3339, a `datetime-local` value or a plain date (midnight UTC)
fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Ok(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(date) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(date.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
        .ok_or_else(|| anyhow!("Invalid date format: {}", raw))
}

fn progress_updates(item_ids: &[String], finished_at: DateTime<Utc>) -> Vec<Value> {
    item_ids
        .iter()
        .map(|id| json!({ "libraryItemId": id, "finishedAt": finished_at.timestamp_millis() }))
        .collect()
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: ListenDateForm = parse_form(form)?;
    let date = parse_date(&form.date_to_set)?;
    if form.library_item_ids.is_empty() {
        anyhow::bail!("No library items selected");
    }

    ctx.log.info(format!(
        "Setting listen date to {} for {} items",
        date.to_rfc3339(),
        form.library_item_ids.len()
    ));

    ctx.client
        .patch(
            "/api/me/progress/batch/update",
            &progress_updates(&form.library_item_ids, date),
        )
        .await
        .context("Failed to update listening state")?;

    ctx.log.info("Listen dates updated successfully");
    Ok("Listening state updated successfully".to_string())
}
