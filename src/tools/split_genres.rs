// Split combined genres/tags ("Fantasy, Horror") into separate entries

use anyhow::{Context, Result};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{item_filter, library_ids, merge_unique, parse_form, ToolContext};
use crate::models::LibraryItem;

pub const ID: &str = "split-genres";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    Genres,
    Tags,
}

impl ValueKind {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            ValueKind::Genres => "genres",
            ValueKind::Tags => "tags",
        }
    }

    pub(super) fn current(self, item: &LibraryItem) -> &[String] {
        match self {
            ValueKind::Genres => &item.media.metadata.genres,
            ValueKind::Tags => &item.media.tags,
        }
    }

    /// Body of `PATCH /api/items/{id}/media` setting the values to `values`
    pub(super) fn media_patch(self, values: Vec<String>) -> Value {
        match self {
            ValueKind::Genres => json!({ "metadata": { "genres": values } }),
            ValueKind::Tags => json!({ "tags": values }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitGenresForm {
    #[serde(rename = "type", default)]
    pub kind: ValueKind,
    #[serde(default)]
    pub library_ids: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub delimiter_override: Option<String>,
    #[serde(default)]
    pub skip: Vec<String>,
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl SplitGenresForm {
    fn delimiter(&self) -> &str {
        self.delimiter_override
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.delimiter)
    }
}

/// Trimmed non-empty parts of `value`
fn split_value(value: &str, delimiter: &str) -> Vec<String> {
    value
        .split(delimiter)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Values that contain the delimiter and are not explicitly skipped (case-sensitive)
fn combined_values<'a>(all: &'a [String], delimiter: &str, skip: &[String]) -> Vec<&'a str> {
    all.iter()
        .filter(|value| value.split(delimiter).count() > 1 && !skip.contains(value))
        .map(String::as_str)
        .collect()
}

/// `existing` without `combined`, followed by its parts
fn replace_combined(existing: &[String], combined: &str, parts: &[String]) -> Vec<String> {
    let kept: Vec<String> = existing
        .iter()
        .filter(|value| value.as_str() != combined)
        .cloned()
        .collect();
    merge_unique(&kept, parts.iter().cloned())
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: SplitGenresForm = parse_form(form)?;
    if form.delimiter().is_empty() {
        anyhow::bail!("Delimiter must not be empty");
    }
    let kind = form.kind.as_str();

    let libraries = library_ids(&ctx.client, &form.library_ids).await?;
    ctx.log.info(format!(
        "Processing {} libraries ({})",
        libraries.len(),
        libraries.join(", ")
    ));

    let response: Map<String, Value> = ctx
        .client
        .get_json(&format!("/api/{}", kind))
        .await
        .with_context(|| format!("Failed to fetch {}", kind))?;
    let all: Vec<String> = response
        .get(kind)
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .with_context(|| format!("Unexpected /api/{} response", kind))?
        .unwrap_or_default();

    let combined = combined_values(&all, form.delimiter(), &form.skip);
    ctx.log.info(format!(
        "Found {} combined {} out of {}",
        combined.len(),
        kind,
        all.len()
    ));

    for value in combined {
        ctx.log.info(format!("Processing {} '{}'", kind, value));
        let parts = split_value(value, form.delimiter());
        let mut titles = Vec::new();

        for library_id in &libraries {
            let items = match ctx
                .client
                .filtered_library_items(library_id, &item_filter(kind, value))
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    ctx.log.warn(format!(
                        "Failed to fetch items for '{}' in library {}: {}",
                        value, library_id, e
                    ));
                    continue;
                }
            };

            let client = &ctx.client;
            let patches = items.iter().map(|item| {
                let body = form
                    .kind
                    .media_patch(replace_combined(form.kind.current(item), value, &parts));
                async move {
                    let result = client
                        .patch(&format!("/api/items/{}/media", item.id), &body)
                        .await;
                    (item, result)
                }
            });

            for (item, result) in join_all(patches).await {
                match result {
                    Ok(()) => {
                        ctx.log
                            .info(format!("Split '{}' on '{}' ({})", value, item.display_title(), item.id));
                        titles.push(item.display_title().to_string());
                    }
                    Err(e) => ctx
                        .log
                        .warn(format!("Failed to update item {}: {}", item.id, e)),
                }
            }
        }

        ctx.log.info(format!(
            "Processed {} books for '{}': {}",
            titles.len(),
            value,
            titles.join(", ")
        ));
    }

    Ok(format!("{} split successfully", kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::MockServer;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_split_value_trims_parts() {
        assert_eq!(split_value("Fantasy , Horror,", ","), vec!["Fantasy", "Horror"]);
        assert_eq!(split_value("A | B", "|"), vec!["A", "B"]);
    }

    #[test]
    fn test_combined_values_honour_skip_list() {
        let all = strings(&["Fantasy", "Fantasy, Horror", "Mystery, Thriller & Suspense"]);
        let skip = strings(&["Mystery, Thriller & Suspense"]);
        assert_eq!(combined_values(&all, ",", &skip), vec!["Fantasy, Horror"]);
    }

    #[test]
    fn test_replace_combined_dedups_in_order() {
        let existing = strings(&["Horror", "Fantasy, Horror", "Classics"]);
        let replaced = replace_combined(&existing, "Fantasy, Horror", &strings(&["Fantasy", "Horror"]));
        assert_eq!(replaced, vec!["Horror", "Classics", "Fantasy"]);
    }

    #[test]
    fn test_override_delimiter_wins() {
        let form: SplitGenresForm = serde_json::from_value(json!({
            "type": "tags",
            "delimiter": ",",
            "delimiterOverride": " / "
        }))
        .unwrap();
        assert_eq!(form.kind, ValueKind::Tags);
        assert_eq!(form.delimiter(), " / ");
    }

    #[tokio::test]
    async fn test_patches_every_item_with_split_genres() {
        let server = MockServer::start(&[
            ("GET /api/libraries", json!({ "libraries": [{ "id": "lib_1", "name": "Books" }] })),
            ("GET /api/genres", json!({ "genres": ["Fantasy, Horror", "Drama"] })),
            (
                "GET /api/libraries/lib_1/items",
                json!({ "results": [
                    { "id": "li_1", "media": { "metadata": { "title": "One", "genres": ["Fantasy, Horror"] } } },
                    { "id": "li_2", "media": { "metadata": { "title": "Two", "genres": ["Fantasy, Horror", "Fantasy"] } } }
                ] }),
            ),
        ])
        .await;
        let mut ctx = server.context();

        let message = run(&mut ctx, json!({ "type": "genres", "libraryIds": [], "delimiter": ",", "skip": [] }))
            .await
            .unwrap();
        assert_eq!(message, "genres split successfully");

        let requests = server.requests();
        assert!(requests
            .iter()
            .any(|r| r.path == format!("/api/libraries/lib_1/items?filter={}", item_filter("genres", "Fantasy, Horror"))));

        let mut writes = server.writes();
        writes.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].method, "PATCH");
        assert_eq!(writes[0].path, "/api/items/li_1/media");
        assert_eq!(writes[0].body, json!({ "metadata": { "genres": ["Fantasy", "Horror"] } }));
        assert_eq!(writes[1].body, json!({ "metadata": { "genres": ["Fantasy", "Horror"] } }));
    }
}
