// Tag every item so the server refreshes its metadata on next load

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{batch_update, library_ids, merge_unique, parse_form, ToolContext};
use crate::models::LibraryItem;
use crate::services::abs::MediaServer;

pub const ID: &str = "force-metadata";

const FORCE_TAG: &str = "force-metadata";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceMetadataForm {
    #[serde(default)]
    pub library_ids: Vec<String>,
}

fn tag_update(item: &LibraryItem) -> Value {
    json!({
        "id": item.id,
        "mediaPayload": { "tags": merge_unique(&item.media.tags, [FORCE_TAG.to_string()]) }
    })
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: ForceMetadataForm = parse_form(form)?;
    let libraries = library_ids(&ctx.client, &form.library_ids).await?;

    let mut payload = Vec::new();
    for library_id in &libraries {
        let items = ctx
            .client
            .library_items(library_id)
            .await
            .with_context(|| format!("Failed to fetch items of library {}", library_id))?;
        for item in &items {
            tracing::debug!("Tagging {} ({})", item.display_title(), item.id);
            payload.push(tag_update(item));
        }
    }

    ctx.log.info(format!(
        "Adding \"{}\" tag to {} books in {} libraries",
        FORCE_TAG,
        payload.len(),
        libraries.len()
    ));
    if !payload.is_empty() {
        batch_update(&ctx.client, &payload).await?;
    }

    Ok(format!(
        "Metadata force tag added for {} books in {} libraries. Go to {}/config/item-metadata-utils/tags to remove the tag '{}'.",
        payload.len(),
        libraries.len(),
        ctx.client.base_url(),
        FORCE_TAG
    ))
}
