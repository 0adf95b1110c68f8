// Rename a series across all books that belong to it

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{batch_update, item_filter, parse_form, ToolContext};
use crate::models::{LibraryItem, SeriesRef};

pub const ID: &str = "rename-series";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameSeriesForm {
    pub library_id: String,
    pub series_id: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchGetResponse {
    #[serde(default)]
    library_items: Vec<LibraryItem>,
}

/// Series list of `item` with the entry `series_id` renamed
fn renamed_series(item: &LibraryItem, series_id: &str, new_name: &str) -> Vec<SeriesRef> {
    item.media
        .metadata
        .series
        .iter()
        .flatten()
        .map(|series| {
            let mut series = series.clone();
            if series.id == series_id {
                series.name = new_name.to_string();
            }
            series
        })
        .collect()
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: RenameSeriesForm = parse_form(form)?;
    let new_name = form.new_name.trim();
    if new_name.is_empty() {
        anyhow::bail!("New series name must not be empty");
    }

    let members = ctx
        .client
        .filtered_library_items(&form.library_id, &item_filter("series", &form.series_id))
        .await
        .with_context(|| format!("Failed to fetch books of series {}", form.series_id))?;
    ctx.log
        .info(format!("Found {} books in series {}", members.len(), form.series_id));
    if members.is_empty() {
        return Ok("No books found for this series".to_string());
    }

    let ids: Vec<&str> = members.iter().map(|item| item.id.as_str()).collect();
    let expanded: BatchGetResponse = ctx
        .client
        .post_json("/api/items/batch/get", &json!({ "libraryItemIds": ids }))
        .await
        .context("Failed to fetch full book records")?;

    let payload: Vec<Value> = expanded
        .library_items
        .iter()
        .map(|item| {
            ctx.log.info(format!("Renaming series of '{}' ({})", item.display_title(), item.id));
            json!({
                "id": item.id,
                "mediaPayload": {
                    "metadata": { "series": renamed_series(item, &form.series_id, new_name) }
                }
            })
        })
        .collect();

    batch_update(&ctx.client, &payload).await?;

    Ok(format!("Series renamed to '{}' on {} books", new_name, payload.len()))
}
