// Delete listening sessions longer than a threshold

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{lenient_number, parse_form, ToolContext};
use crate::models::ListeningSession;
use crate::services::abs::MediaServer;

pub const ID: &str = "delete-listening-sessions";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSessionsForm {
    #[serde(default)]
    pub user_ids: Vec<String>,
    /// Hours
    #[serde(deserialize_with = "lenient_number")]
    pub threshold: f64,
    #[serde(deserialize_with = "lenient_number")]
    pub sessions_to_fetch: u64,
}

#[derive(Debug, Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<ListeningSession>,
}

/// Sessions to delete (id, hours), plus total hours deleted and kept
fn over_threshold(sessions: &[ListeningSession], threshold: f64) -> (Vec<(&str, f64)>, f64, f64) {
    let mut selected = Vec::new();
    let mut deleted_hours = 0.0;
    let mut kept_hours = 0.0;

    for session in sessions {
        let Some(seconds) = session.time_listening.filter(|t| *t > 0.0) else {
            continue;
        };
        let hours = seconds / 3600.0;
        if hours > threshold {
            deleted_hours += hours;
            selected.push((session.id.as_str(), hours));
        } else {
            kept_hours += hours;
        }
    }

    (selected, deleted_hours, kept_hours)
}

pub async fn run(ctx: &mut ToolContext, form: Value) -> Result<String> {
    let form: DeleteSessionsForm = parse_form(form)?;

    let users = if form.user_ids.is_empty() {
        ctx.client
            .users()
            .await
            .context("Failed to fetch users")?
            .into_iter()
            .map(|u| u.id)
            .collect()
    } else {
        form.user_ids.clone()
    };
    ctx.log.info(format!("Processing {} users", users.len()));

    let mut total_deleted = 0;
    for user_id in &users {
        let response: SessionsResponse = match ctx
            .client
            .get_json(&format!(
                "/api/users/{}/listening-sessions?itemsPerPage={}",
                user_id, form.sessions_to_fetch
            ))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                ctx.log
                    .warn(format!("Failed to fetch sessions of user {}: {}", user_id, e));
                continue;
            }
        };

        let (selected, deleted_hours, kept_hours) = over_threshold(&response.sessions, form.threshold);
        for (id, hours) in &selected {
            ctx.log
                .info(format!("Session greater than threshold: {} {:.2} hours", id, hours));
        }
        ctx.log.info(format!(
            "User {} has {} sessions to delete with a total duration of {:.2} hours. ({:.2} hours not deleted)",
            user_id,
            selected.len(),
            deleted_hours,
            kept_hours
        ));

        for (id, _) in selected {
            match ctx.client.delete(&format!("/api/sessions/{}", id)).await {
                Ok(()) => {
                    ctx.log.info(format!("Deleted session {}", id));
                    total_deleted += 1;
                }
                Err(e) => ctx.log.warn(format!("Error deleting session {}: {}", id, e)),
            }
        }
    }

    Ok(format!(
        "Deleted {} listening sessions longer than {} hours",
        total_deleted, form.threshold
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::MockServer;
    use serde_json::json;

    fn session(id: &str, seconds: Option<f64>) -> ListeningSession {
        ListeningSession {
            id: id.to_string(),
            user_id: None,
            library_item_id: None,
            time_listening: seconds,
        }
    }

    #[test]
    fn test_threshold_is_exclusive_and_in_hours() {
        let sessions = vec![
            session("short", Some(3600.0)),
            session("exact", Some(2.0 * 3600.0)),
            session("long", Some(30.0 * 3600.0)),
            session("empty", None),
        ];
        let (selected, deleted, kept) = over_threshold(&sessions, 2.0);

        assert_eq!(selected, vec![("long", 30.0)]);
        assert_eq!(deleted, 30.0);
        assert_eq!(kept, 3.0);
    }

    #[test]
    fn test_form_accepts_text_numbers() {
        let form: DeleteSessionsForm = serde_json::from_value(json!({
            "threshold": "24",
            "sessionsToFetch": "2000000"
        }))
        .unwrap();
        assert_eq!(form.threshold, 24.0);
        assert_eq!(form.sessions_to_fetch, 2_000_000);
        assert!(form.user_ids.is_empty());
    }

    #[tokio::test]
    async fn test_deletes_long_sessions_of_every_user() {
        let server = MockServer::start(&[
            ("GET /api/users", json!({ "users": [{ "id": "u1", "username": "alice" }] })),
            (
                "GET /api/users/u1/listening-sessions?itemsPerPage=50",
                json!({ "sessions": [
                    { "id": "s1", "timeListening": 100000 },
                    { "id": "s2", "timeListening": 60 }
                ] }),
            ),
        ])
        .await;
        let mut ctx = server.context();

        run(&mut ctx, json!({ "threshold": "24", "sessionsToFetch": 50 }))
            .await
            .unwrap();

        let writes = server.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].method, "DELETE");
        assert_eq!(writes[0].path, "/api/sessions/s1");
    }
}
