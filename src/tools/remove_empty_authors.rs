// Remove authors without books

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use super::{library_ids, parse_form, ToolContext};
use crate::models::Author;

pub const ID: &str = "delete-orphaned-authors";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveEmptyAuthorsForm {
    #[serde(default)]
    pub library_ids: Vec<String>,
    /// Without it the tool only lists what it would delete
    #[serde(default)]
    pub delete_without_confirmation: bool,
}

#[derive(Debug, Deserialize)]
struct AuthorsResponse {
    #[serde(default)]
    authors: Vec<Author>,
}

fn empty_authors(authors: &[Author]) -> Vec<&Author> {
    authors.iter().filter(|a| a.num_books == 0).collect()
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: RemoveEmptyAuthorsForm = parse_form(form)?;
    let libraries = library_ids(&ctx.client, &form.library_ids).await?;
    ctx.log.info(format!("Processing {} libraries", libraries.len()));

    let mut found = 0;
    let mut deleted = 0;
    let mut failed = 0;

    for library_id in &libraries {
        ctx.log.info(format!("Processing library {}", library_id));

        let response: AuthorsResponse = match ctx
            .client
            .get_json(&format!("/api/libraries/{}/authors", library_id))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                ctx.log
                    .warn(format!("Failed to fetch authors of library {}: {}", library_id, e));
                continue;
            }
        };

        let orphans = empty_authors(&response.authors);
        ctx.log
            .info(format!("Found {} authors without books", orphans.len()));
        if orphans.is_empty() {
            continue;
        }
        found += orphans.len();

        for author in &orphans {
            ctx.log.info(format!("- {} (ID: {})", author.name, author.id));
        }

        if !form.delete_without_confirmation {
            continue;
        }

        for author in orphans {
            match ctx
                .client
                .delete(&format!("/api/authors/{}", author.id))
                .await
            {
                Ok(()) => {
                    ctx.log.info(format!("Deleted author: {}", author.name));
                    deleted += 1;
                }
                Err(e) => {
                    ctx.log
                        .warn(format!("Error deleting author {}: {}", author.name, e));
                    failed += 1;
                }
            }
        }
    }

    ctx.log.section("SUMMARY");
    ctx.log.info(format!("Total authors found to delete: {}", found));
    ctx.log.info(format!("Total authors successfully deleted: {}", deleted));
    ctx.log.info(format!("Total authors failed to delete: {}", failed));

    Ok(if form.delete_without_confirmation {
        format!(
            "Processed {} libraries. Deleted {} orphaned authors.",
            libraries.len(),
            deleted
        )
    } else {
        format!(
            "Found {} orphaned authors across {} libraries. Enable 'Delete Without Confirmation' to delete them.",
            found,
            libraries.len()
        )
    })
}
