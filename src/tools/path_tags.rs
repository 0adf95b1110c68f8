// Tag items whose path matches a rule ("<regex>:<tag>")

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::split_genres::ValueKind;
use super::{batch_update, merge_unique, parse_form, ToolContext};
use crate::models::LibraryItem;
use crate::services::abs::MediaServer;

pub const ID: &str = "path-tag-updater";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathTagForm {
    pub library_id: String,
    #[serde(default)]
    pub rule_sets: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ValueKind,
}

fn default_kind() -> ValueKind {
    ValueKind::Tags
}

#[derive(Debug)]
struct PathRule {
    raw: String,
    pattern: Regex,
    tag: String,
}

/// The last colon separates the pattern from the tag, so patterns may contain colons.
fn parse_rule(raw: &str) -> Result<PathRule> {
    let (pattern, tag) = raw
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid rule set format: {}", raw))?;
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(anyhow!("Invalid rule set format: {} (empty tag)", raw));
    }
    let pattern = Regex::new(pattern).with_context(|| format!("Invalid pattern in rule {}", raw))?;

    Ok(PathRule {
        raw: raw.to_string(),
        pattern,
        tag: tag.to_string(),
    })
}

fn matching_items<'a>(rule: &PathRule, items: &'a [LibraryItem]) -> Vec<&'a LibraryItem> {
    items
        .iter()
        .filter(|item| item.path.as_deref().is_some_and(|p| rule.pattern.is_match(p)))
        .collect()
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: PathTagForm = parse_form(form)?;
    // Reject the whole run before touching anything if one rule is broken
    let rules = form
        .rule_sets
        .iter()
        .map(|raw| parse_rule(raw))
        .collect::<Result<Vec<_>>>()?;

    let items = ctx
        .client
        .library_items(&form.library_id)
        .await
        .with_context(|| format!("Failed to fetch items of library {}", form.library_id))?;

    for rule in &rules {
        let matched = matching_items(rule, &items);
        if matched.is_empty() {
            ctx.log.info(format!("No books matched for rule \"{}\"", rule.raw));
            continue;
        }

        if form.dry_run {
            for item in &matched {
                ctx.log.info(format!(
                    "Dry run: would update book {} with tag \"{}\" based on path \"{}\"",
                    item.display_title(),
                    rule.tag,
                    item.path.as_deref().unwrap_or_default()
                ));
            }
            continue;
        }

        let payload: Vec<Value> = matched
            .iter()
            .map(|item| {
                let values = merge_unique(form.kind.current(item), [rule.tag.clone()]);
                json!({ "id": item.id, "mediaPayload": form.kind.media_patch(values) })
            })
            .collect();
        batch_update(&ctx.client, &payload)
            .await
            .with_context(|| format!("Failed to update books for rule \"{}\"", rule.raw))?;
        ctx.log
            .info(format!("Updated {} books for rule \"{}\"", payload.len(), rule.raw));
    }

    Ok(if form.dry_run {
        "Dry run completed. No changes applied.".to_string()
    } else {
        format!("{} updated successfully", form.kind.as_str())
    })
}
