// Quick match chapters
// Chapters come from the provider (by ASIN, searched when missing) or, as a fallback,
// from the audio tracks. Existing chapters are replaced only when the count is clearly off.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use super::{lenient_number, parse_form, ToolContext};
use crate::models::{AudioFile, LibraryItem};
use crate::services::abs::MediaServer;

pub const ID: &str = "match-audiobook-chapters";

/// Pause between provider lookups unless rate protection is disabled
const RATE_DELAY: Duration = Duration::from_secs(2);

/// Track chapters overlap by this much to absorb rounding in track durations
const TRACK_OVERLAP: f64 = 0.001;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickMatchForm {
    pub library_id: String,
    #[serde(default = "default_threshold", deserialize_with = "lenient_number")]
    pub chapter_threshold: u32,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub disable_rate_protection: bool,
    #[serde(default = "default_true")]
    pub search_for_asin: bool,
    #[serde(default)]
    pub use_tracks_as_chapters: bool,
}

fn default_threshold() -> u32 {
    3
}

fn default_provider() -> String {
    "audible.com".to_string()
}

fn default_region() -> String {
    "US".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chapter {
    pub id: usize,
    pub start: f64,
    pub end: f64,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderChapter {
    start_offset_ms: f64,
    length_ms: f64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChaptersResponse {
    #[serde(default)]
    chapters: Vec<ProviderChapter>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    asin: Option<String>,
}

/// Provider chapters clipped to the book; chapters starting past the end are dropped.
fn chapters_from_provider(chapters: &[ProviderChapter], book_duration: f64) -> Vec<Chapter> {
    chapters
        .iter()
        .enumerate()
        .map(|(id, chapter)| Chapter {
            id,
            start: chapter.start_offset_ms / 1000.0,
            end: ((chapter.start_offset_ms + chapter.length_ms) / 1000.0).min(book_duration),
            title: chapter.title.clone(),
        })
        .take_while(|chapter| chapter.start < book_duration)
        .collect()
}

/// One chapter per audio track, named after the file
fn chapters_from_tracks(tracks: &[AudioFile], book_duration: f64) -> Vec<Chapter> {
    let mut chapters = Vec::new();
    let mut current = 0.0;

    for (id, track) in tracks.iter().enumerate() {
        let title = track
            .metadata
            .as_ref()
            .and_then(|m| m.filename.as_deref())
            .and_then(|name| name.split('.').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Track {}", id + 1));

        chapters.push(Chapter {
            id,
            start: current,
            end: current + track.duration,
            title,
        });

        current += track.duration - TRACK_OVERLAP;
        if book_duration < current {
            break;
        }
    }

    chapters
}

fn needs_update(current: u32, found: usize, threshold: u32) -> bool {
    current == 0 || (i64::from(current) - found as i64).unsigned_abs() > u64::from(threshold)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookStatus {
    Error,
    NoAsin,
    Tracks,
    Finished,
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookStatus::Error => write!(f, "ERROR"),
            BookStatus::NoAsin => write!(f, "NO_ASIN"),
            BookStatus::Tracks => write!(f, "TRACKS"),
            BookStatus::Finished => write!(f, "FINISHED"),
        }
    }
}

#[derive(Debug)]
struct BookReport {
    title: String,
    status: BookStatus,
    comment: &'static str,
}

type Outcome = (BookStatus, &'static str);

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: QuickMatchForm = parse_form(form)?;

    ctx.log
        .info(format!("Fetching library items from library: {}", form.library_id));
    let items = ctx.client.library_items(&form.library_id).await?;
    ctx.log
        .info(format!("Found {} items in the library.", items.len()));

    let mut reports = Vec::with_capacity(items.len());
    for item in &items {
        let title = item.display_title().to_string();
        ctx.log.info(format!("--- Processing Book: {} ---", title));

        let ((status, comment), queried_provider) = match_item(ctx, &form, item).await;
        reports.push(BookReport {
            title,
            status,
            comment,
        });

        if queried_provider && !form.disable_rate_protection {
            tokio::time::sleep(RATE_DELAY).await;
        }
    }

    ctx.log.section("Summary");
    for report in &reports {
        ctx.log
            .info(format!("{} ({}): {}", report.title, report.status, report.comment));
    }

    let failed: Vec<_> = reports
        .iter()
        .filter(|r| r.status != BookStatus::Finished)
        .collect();
    ctx.log.section("Failed Books");
    for report in &failed {
        ctx.log
            .warn(format!("{} ({}): {}", report.title, report.status, report.comment));
    }

    Ok(format!(
        "Audiobook chapters matching completed ({} of {} books finished)",
        reports.len() - failed.len(),
        reports.len()
    ))
}

/// Match one book; the flag tells whether the chapter provider was queried
async fn match_item(
    ctx: &mut ToolContext,
    form: &QuickMatchForm,
    item: &LibraryItem,
) -> (Outcome, bool) {
    let metadata = &item.media.metadata;
    let title = item.display_title();
    let mut asin = metadata.asin.clone().filter(|a| !a.is_empty());
    let mut status = BookStatus::Error;

    if asin.is_none() {
        status = BookStatus::NoAsin;
        if form.search_for_asin {
            ctx.log.info(format!("Searching for ASIN for \"{}\"...", title));
            let author = metadata.author_name.as_deref().unwrap_or("Unknown Author");
            let path = format!(
                "/api/search/books?title={}&author={}&provider={}",
                urlencoding::encode(title),
                urlencoding::encode(author),
                urlencoding::encode(&form.provider)
            );
            let results: Vec<SearchResult> = match ctx.client.get_json(&path).await {
                Ok(results) => results,
                Err(e) => {
                    ctx.log.warn(format!("Search for \"{}\" failed: {}", title, e));
                    Vec::new()
                }
            };

            let Some(best) = results.first() else {
                ctx.log
                    .warn(format!("Error matching book \"{}\" (No results found).", title));
                return ((status, "ASIN retrieval failed"), false);
            };
            match best.asin.clone().filter(|a| !a.is_empty()) {
                Some(found) => {
                    ctx.log.info(format!("ASIN found: {}", found));
                    asin = Some(found);
                }
                None => {
                    ctx.log
                        .warn(format!("Error matching book \"{}\" (No ASIN found).", title));
                    return (
                        (status, "ASIN retrieval failed - No ASIN found"),
                        false,
                    );
                }
            }
        }
    }

    let Some(asin) = asin else {
        if !form.use_tracks_as_chapters {
            ctx.log.info(format!(
                "Skipping book \"{}\" (No ASIN found and Tracks not used as source).",
                title
            ));
            return ((status, "ASIN retrieval failed"), false);
        }
        return (match_tracks(ctx, form, item).await, false);
    };

    ctx.log.info(format!("Fetching chapters for ASIN: {}", asin));
    let path = format!(
        "/api/search/chapters?asin={}&region={}",
        urlencoding::encode(&asin),
        urlencoding::encode(&form.region)
    );
    let chapters = match ctx.client.get_json::<ChaptersResponse>(&path).await {
        Ok(ChaptersResponse { error: Some(error), .. }) => {
            ctx.log
                .warn(format!("Error fetching chapters for ASIN {}: {}", asin, error));
            Vec::new()
        }
        Ok(response) => response.chapters,
        Err(e) => {
            ctx.log
                .warn(format!("Error fetching chapters for ASIN {}: {}", asin, e));
            Vec::new()
        }
    };

    if chapters.is_empty() {
        ctx.log.info(format!("No chapters found for \"{}\".", title));
        return ((status, "No chapters found"), true);
    }
    ctx.log
        .info(format!("Chapters found for \"{}\": {}", title, chapters.len()));

    let current = item.media.num_chapters.unwrap_or(0);
    ctx.log.info(format!("Current chapter count: {}", current));
    if !needs_update(current, chapters.len(), form.chapter_threshold) {
        ctx.log.info(format!("Chapters are fine for \"{}\".", title));
        return ((BookStatus::Finished, "No chapters to update"), true);
    }

    ctx.log.info(format!(
        "Chapters are missing or incorrect for \"{}\". Updating...",
        title
    ));
    let duration = item.media.duration.unwrap_or(f64::MAX);
    let new_chapters = chapters_from_provider(&chapters, duration);
    if update_chapters(ctx, item, &new_chapters).await {
        ctx.log
            .info(format!("Chapters updated successfully for \"{}\".", title));
        ((BookStatus::Finished, "Chapters updated"), true)
    } else {
        ((status, "Chapters update failed"), true)
    }
}

async fn match_tracks(
    ctx: &mut ToolContext,
    form: &QuickMatchForm,
    item: &LibraryItem,
) -> Outcome {
    let title = item.display_title();
    ctx.log.info(format!("Using tracks as chapters for \"{}\".", title));
    let status = BookStatus::Tracks;

    let details: LibraryItem = match ctx
        .client
        .get_json(&format!("/api/items/{}?expanded=1", item.id))
        .await
    {
        Ok(details) => details,
        Err(e) => {
            ctx.log
                .warn(format!("Error fetching book \"{}\": {}", title, e));
            return (status, "Tracks retrieval failed");
        }
    };

    let tracks = details.media.audio_files.unwrap_or_default();
    if tracks.len() <= 1 {
        ctx.log.warn(format!(
            "Error using tracks as chapters for \"{}\" (No or 1 track found).",
            title
        ));
        return (status, "Tracks retrieval failed");
    }

    let current = item.media.num_chapters.unwrap_or(0);
    if !needs_update(current, tracks.len(), form.chapter_threshold) {
        ctx.log.info(format!("Chapters are fine for \"{}\".", title));
        return (BookStatus::Finished, "No chapters to update");
    }

    ctx.log.info(format!(
        "Chapters are missing or incorrect for \"{}\" (Current num: {}, Tracks num: {}). Updating...",
        title,
        current,
        tracks.len()
    ));
    let duration = item.media.duration.or(details.media.duration).unwrap_or(f64::MAX);
    let chapters = chapters_from_tracks(&tracks, duration);
    if update_chapters(ctx, item, &chapters).await {
        ctx.log.info(format!(
            "Chapters updated successfully for \"{}\" (Using tracks!).",
            title
        ));
        (BookStatus::Finished, "Tracks used as chapters")
    } else {
        (status, "Chapters update failed")
    }
}

async fn update_chapters(ctx: &mut ToolContext, item: &LibraryItem, chapters: &[Chapter]) -> bool {
    match ctx
        .client
        .post(
            &format!("/api/items/{}/chapters", item.id),
            &json!({ "chapters": chapters }),
        )
        .await
    {
        Ok(()) => true,
        Err(e) => {
            ctx.log.warn(format!(
                "Error updating chapters for \"{}\": {}",
                item.display_title(),
                e
            ));
            false
        }
    }
}
