// Identity reconciliation between two independent servers
// Nothing is shared between the servers except human-facing data, so every mapping is
// derived from names, usernames/emails and book identifiers. Every decision is logged.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::rewrite::{expand_mapping, SubstitutionTable};
use crate::models::{Episode, Library, LibraryItem, Metadata, User};
use crate::services::abs::{ApiError, MediaServer};
use crate::services::audit::AuditLog;

/// Item plus optional podcast episode; the unit that progress and sessions point at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaKey {
    pub item_id: String,
    pub episode_id: Option<String>,
}

impl MediaKey {
    pub fn item(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            episode_id: None,
        }
    }

    pub fn episode(item_id: impl Into<String>, episode_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            episode_id: Some(episode_id.into()),
        }
    }

    /// Key referenced by a progress or session record (`libraryItemId` / `episodeId`).
    pub fn from_record(record: &Value) -> Option<Self> {
        let item_id = record.get("libraryItemId")?.as_str()?;
        let episode_id = record
            .get("episodeId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty() && *id != "null");
        Some(Self {
            item_id: item_id.to_string(),
            episode_id: episode_id.map(str::to_string),
        })
    }

    /// Inverse of the `item;episode` string form
    #[cfg(test)]
    pub fn parse(raw: &str) -> Option<Self> {
        let (item_id, episode_id) = raw.split_once(';')?;
        if item_id.is_empty() || item_id == "null" {
            return None;
        }
        Some(match episode_id {
            "" | "null" => Self::item(item_id),
            episode_id => Self::episode(item_id, episode_id),
        })
    }
}

impl fmt::Display for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{}",
            self.item_id,
            self.episode_id.as_deref().unwrap_or("null")
        )
    }
}

/// Old id -> new id tables produced by one reconciliation run
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    pub libraries: BTreeMap<String, String>,
    pub users: BTreeMap<String, String>,
    pub items: BTreeMap<MediaKey, MediaKey>,
    /// `media.id` of matched items (book / podcast entity ids)
    pub media: BTreeMap<String, String>,
    fallback_item: Option<String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_item(&mut self, old: MediaKey, new: MediaKey) {
        if self.fallback_item.is_none() && new.episode_id.is_none() {
            self.fallback_item = Some(new.item_id.clone());
        }
        self.items.insert(old, new);
    }

    pub fn resolve_item(&self, key: &MediaKey) -> Option<&MediaKey> {
        self.items.get(key)
    }

    /// New id of the first matched non-podcast item
    pub fn fallback_item(&self) -> Option<&str> {
        self.fallback_item.as_deref()
    }

    /// All tables flattened to strings, in the order users, libraries, items, media
    pub fn flattened(&self) -> Vec<(String, String)> {
        let mut entries = Vec::with_capacity(
            self.users.len() + self.libraries.len() + self.items.len() + self.media.len(),
        );
        entries.extend(self.users.iter().map(|(k, v)| (k.clone(), v.clone())));
        entries.extend(self.libraries.iter().map(|(k, v)| (k.clone(), v.clone())));
        entries.extend(self.items.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        entries.extend(self.media.iter().map(|(k, v)| (k.clone(), v.clone())));
        entries
    }

    /// Single-id substitution table for record rewriting
    pub fn substitution_table(&self) -> SubstitutionTable {
        expand_mapping(self.flattened().into_iter().map(|(k, v)| (k, Some(v))))
    }
}

/// Which rule produced an item match, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Asin,
    Isbn,
    Title,
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRule::Asin => write!(f, "ASIN"),
            MatchRule::Isbn => write!(f, "ISBN"),
            MatchRule::Title => write!(f, "title"),
        }
    }
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

pub fn match_library<'a>(old: &Library, candidates: &'a [Library]) -> Option<&'a Library> {
    candidates.iter().find(|lib| eq_ignore_case(&lib.name, &old.name))
}

/// Username first; email only when neither username matches and both emails exist.
pub fn match_user<'a>(old: &User, candidates: &'a [User]) -> Option<&'a User> {
    candidates
        .iter()
        .find(|user| eq_ignore_case(&user.username, &old.username))
        .or_else(|| {
            let email = non_empty(old.email.as_deref())?;
            candidates.iter().find(|user| {
                non_empty(user.email.as_deref()).is_some_and(|other| eq_ignore_case(other, email))
            })
        })
}

fn same_identifier(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((non_empty(a), non_empty(b)), (Some(a), Some(b)) if a == b)
}

fn title_key(metadata: &Metadata) -> Option<(String, String)> {
    let title = non_empty(metadata.title.as_deref())?;
    let subtitle = metadata.subtitle.as_deref().unwrap_or("");
    Some((title.to_lowercase(), subtitle.to_lowercase()))
}

/// Find the counterpart of `old` among `candidates`: ASIN, then ISBN, then title + subtitle.
pub fn match_item<'a>(
    old: &LibraryItem,
    candidates: &'a [LibraryItem],
) -> Option<(&'a LibraryItem, MatchRule)> {
    let meta = &old.media.metadata;

    let by_asin = || {
        candidates
            .iter()
            .find(|c| same_identifier(c.media.metadata.asin.as_deref(), meta.asin.as_deref()))
            .map(|c| (c, MatchRule::Asin))
    };
    let by_isbn = || {
        candidates
            .iter()
            .find(|c| same_identifier(c.media.metadata.isbn.as_deref(), meta.isbn.as_deref()))
            .map(|c| (c, MatchRule::Isbn))
    };
    let by_title = || {
        let key = title_key(meta)?;
        candidates
            .iter()
            .find(|c| title_key(&c.media.metadata).as_ref() == Some(&key))
            .map(|c| (c, MatchRule::Title))
    };

    by_asin().or_else(by_isbn).or_else(by_title)
}

/// Pair episodes by position; returns the pairs and the old episodes left without partner.
pub fn pair_episodes<'a>(
    old: &'a [Episode],
    new: &'a [Episode],
) -> (Vec<(&'a Episode, &'a Episode)>, &'a [Episode]) {
    let paired = old.iter().zip(new.iter()).collect::<Vec<_>>();
    let unmatched = &old[paired.len()..];
    (paired, unmatched)
}

pub fn reconcile_libraries(
    old: &[Library],
    new: &[Library],
    log: &mut AuditLog,
) -> BTreeMap<String, String> {
    log.section("Library Mapping");
    let mut mapping = BTreeMap::new();

    for library in old {
        match match_library(library, new) {
            Some(target) => {
                log.info(format!(
                    "Library '{}' ({}) -> '{}' ({})",
                    library.name, library.id, target.name, target.id
                ));
                mapping.insert(library.id.clone(), target.id.clone());
            }
            None => log.warn(format!(
                "No library named '{}' ({}) on the new server; its items, progress and sessions are skipped",
                library.name, library.id
            )),
        }
    }

    mapping
}

pub fn reconcile_users(old: &[User], new: &[User], log: &mut AuditLog) -> BTreeMap<String, String> {
    log.section("User Mapping");
    let mut mapping = BTreeMap::new();

    for user in old {
        match match_user(user, new) {
            Some(target) => {
                log.info(format!(
                    "User '{}' ({}) -> '{}' ({})",
                    user.username, user.id, target.username, target.id
                ));
                mapping.insert(user.id.clone(), target.id.clone());
            }
            None => log.warn(format!(
                "No user matching '{}' ({}) on the new server; their progress and sessions are skipped",
                user.username, user.id
            )),
        }
    }

    mapping
}

/// Match the items of one library pair into `identity`. Podcasts are re-fetched in
/// full from both servers so their episodes can be paired.
pub async fn reconcile_items(
    old_server: &dyn MediaServer,
    new_server: &dyn MediaServer,
    old_items: &[LibraryItem],
    new_items: &[LibraryItem],
    identity: &mut IdentityMap,
    log: &mut AuditLog,
) -> Result<(), ApiError> {
    for old_item in old_items {
        let Some((new_item, rule)) = match_item(old_item, new_items) else {
            log.warn(format!(
                "No match for item '{}' ({}/item/{})",
                old_item.display_title(),
                old_server.base_url(),
                old_item.id
            ));
            continue;
        };

        log.info(format!(
            "'{}' ({}/item/{}) -> '{}' ({}/item/{}) by {}",
            old_item.display_title(),
            old_server.base_url(),
            old_item.id,
            new_item.display_title(),
            new_server.base_url(),
            new_item.id,
            rule
        ));

        if old_item.is_podcast() {
            let old_detail = old_server.item(&old_item.id).await?;
            let new_detail = new_server.item(&new_item.id).await?;
            let old_episodes = old_detail.media.episodes.as_deref().unwrap_or_default();
            let new_episodes = new_detail.media.episodes.as_deref().unwrap_or_default();

            let (pairs, unmatched) = pair_episodes(old_episodes, new_episodes);
            for (old_episode, new_episode) in pairs {
                identity.insert_item(
                    MediaKey::episode(&old_detail.id, &old_episode.id),
                    MediaKey::episode(&new_detail.id, &new_episode.id),
                );
            }
            for episode in unmatched {
                log.warn(format!(
                    "No counterpart for episode '{}' ({}) of podcast '{}' ({}/item/{})",
                    episode.title.as_deref().unwrap_or("untitled"),
                    episode.id,
                    old_detail.display_title(),
                    old_server.base_url(),
                    old_detail.id
                ));
            }
        } else {
            identity.insert_item(MediaKey::item(&old_item.id), MediaKey::item(&new_item.id));
        }

        if let (Some(old_media), Some(new_media)) = (&old_item.media.id, &new_item.media.id) {
            identity.media.insert(old_media.clone(), new_media.clone());
        }
    }

    Ok(())
}

/// Reverse lookup used when labelling replay log lines
pub fn invert(mapping: &BTreeMap<String, String>) -> HashMap<&str, Vec<&str>> {
    let mut inverted: HashMap<&str, Vec<&str>> = HashMap::new();
    for (old, new) in mapping {
        inverted.entry(new.as_str()).or_default().push(old.as_str());
    }
    inverted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::fake::{book, library, podcast, user, FakeServer};
    use serde_json::json;

    #[test]
    fn test_library_match_is_case_insensitive_but_exact() {
        let candidates = vec![library("n1", "Sci Fi"), library("n2", "sci-fi")];

        let found = match_library(&library("o1", "Sci-Fi"), &candidates).unwrap();
        assert_eq!(found.id, "n2");

        assert!(match_library(&library("o2", "SciFi"), &candidates).is_none());
    }

    #[test]
    fn test_unmatched_library_is_logged_and_skipped() {
        let mut log = AuditLog::new();
        let mapping = reconcile_libraries(
            &[library("o1", "Audiobooks"), library("o2", "Podcasts")],
            &[library("n1", "AUDIOBOOKS")],
            &mut log,
        );

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping["o1"], "n1");
        let warning = log.warnings().next().unwrap();
        assert!(warning.message.contains("Podcasts"));
    }

    #[test]
    fn test_user_match_prefers_username_then_email() {
        let candidates = vec![
            user("n1", "someone", Some("alice@example.com")),
            user("n2", "Alice", None),
        ];

        // username wins even though the first candidate shares the email
        let found = match_user(&user("o1", "alice", Some("alice@example.com")), &candidates);
        assert_eq!(found.unwrap().id, "n2");

        let found = match_user(&user("o2", "bob", Some("ALICE@example.com")), &candidates);
        assert_eq!(found.unwrap().id, "n1");
    }

    #[test]
    fn test_missing_emails_never_match() {
        let candidates = vec![user("n1", "carol", None), user("n2", "dave", Some(""))];
        assert!(match_user(&user("o1", "erin", None), &candidates).is_none());
        assert!(match_user(&user("o2", "frank", Some("")), &candidates).is_none());
    }

    #[test]
    fn test_asin_takes_precedence_over_title() {
        let old = book("o1", "The Hobbit", None, Some("B001"), None);
        let candidates = vec![
            book("n1", "The Hobbit", None, Some("B999"), None),
            book("n2", "Hobbit (Unabridged)", None, Some("B001"), None),
        ];

        let (found, rule) = match_item(&old, &candidates).unwrap();
        assert_eq!(found.id, "n2");
        assert_eq!(rule, MatchRule::Asin);
    }

    #[test]
    fn test_isbn_before_title() {
        let old = book("o1", "Dune", None, None, Some("9780441013593"));
        let candidates = vec![
            book("n1", "Dune", None, None, None),
            book("n2", "Dune: Deluxe", None, None, Some("9780441013593")),
        ];

        let (found, rule) = match_item(&old, &candidates).unwrap();
        assert_eq!(found.id, "n2");
        assert_eq!(rule, MatchRule::Isbn);
    }

    #[test]
    fn test_title_and_subtitle_must_both_match() {
        let old = book("o1", "Mistborn", Some("The Final Empire"), None, None);
        let candidates = vec![
            book("n1", "Mistborn", None, None, None),
            book("n2", "MISTBORN", Some("the final empire"), None, None),
        ];
        let (found, rule) = match_item(&old, &candidates).unwrap();
        assert_eq!(found.id, "n2");
        assert_eq!(rule, MatchRule::Title);

        let old = book("o2", "Mistborn", Some("Part 1"), None, None);
        let candidates = vec![book("n1", "Mistborn", None, None, None)];
        assert!(match_item(&old, &candidates).is_none());
    }

    #[test]
    fn test_empty_identifiers_do_not_match() {
        let old = book("o1", "Alpha", None, Some(""), Some(""));
        let candidates = vec![book("n1", "Beta", None, Some(""), Some(""))];
        assert!(match_item(&old, &candidates).is_none());
    }

    #[test]
    fn test_media_key_string_form() {
        let key = MediaKey::item("li_1");
        assert_eq!(key.to_string(), "li_1;null");
        assert_eq!(MediaKey::parse("li_1;null"), Some(key));

        let key = MediaKey::episode("li_2", "ep_9");
        assert_eq!(key.to_string(), "li_2;ep_9");
        assert_eq!(MediaKey::parse("li_2;ep_9"), Some(key));

        assert_eq!(MediaKey::parse("li_3"), None);
        assert!(MediaKey::item("a") < MediaKey::episode("a", "b"));
    }

    #[test]
    fn test_media_key_from_record() {
        let record = json!({ "libraryItemId": "li_1", "episodeId": null });
        assert_eq!(MediaKey::from_record(&record), Some(MediaKey::item("li_1")));

        let record = json!({ "libraryItemId": "li_1", "episodeId": "ep_1" });
        assert_eq!(
            MediaKey::from_record(&record),
            Some(MediaKey::episode("li_1", "ep_1"))
        );

        assert_eq!(MediaKey::from_record(&json!({ "episodeId": "ep_1" })), None);
    }

    #[test]
    fn test_fallback_is_first_non_podcast_item() {
        let mut identity = IdentityMap::new();
        identity.insert_item(MediaKey::episode("p1", "e1"), MediaKey::episode("p2", "e2"));
        assert_eq!(identity.fallback_item(), None);

        identity.insert_item(MediaKey::item("z_old"), MediaKey::item("z_new"));
        identity.insert_item(MediaKey::item("a_old"), MediaKey::item("a_new"));
        assert_eq!(identity.fallback_item(), Some("z_new"));
    }

    #[test]
    fn test_substitution_table_covers_items_and_episodes() {
        let mut identity = IdentityMap::new();
        identity.users.insert("u_old".into(), "u_new".into());
        identity.insert_item(MediaKey::item("b_old"), MediaKey::item("b_new"));
        identity.insert_item(MediaKey::episode("p_old", "e_old"), MediaKey::episode("p_new", "e_new"));

        let table = identity.substitution_table();
        assert_eq!(table["u_old"], "u_new");
        assert_eq!(table["b_old"], "b_new");
        assert_eq!(table["p_old"], "p_new");
        assert_eq!(table["e_old"], "e_new");
        assert!(!table.contains_key("null"));
    }

    #[tokio::test]
    async fn test_podcast_episodes_map_by_position() {
        let old_podcast = podcast("op", "Daily", &["o_e0", "o_e1", "o_e2", "o_e3"]);
        let new_podcast = podcast("np", "Daily", &["n_e0", "n_e1"]);

        let old_server = FakeServer::new("http://old");
        old_server.add_items("lib_o", vec![old_podcast.clone()]);
        let new_server = FakeServer::new("http://new");
        new_server.add_items("lib_n", vec![new_podcast.clone()]);

        let mut identity = IdentityMap::new();
        let mut log = AuditLog::new();
        reconcile_items(
            &old_server,
            &new_server,
            &[old_podcast],
            &[new_podcast],
            &mut identity,
            &mut log,
        )
        .await
        .unwrap();

        assert_eq!(identity.items.len(), 2);
        assert_eq!(
            identity.resolve_item(&MediaKey::episode("op", "o_e1")),
            Some(&MediaKey::episode("np", "n_e1"))
        );
        assert!(identity.resolve_item(&MediaKey::episode("op", "o_e2")).is_none());
        assert!(identity.fallback_item().is_none());

        let warnings: Vec<_> = log.warnings().map(|w| w.message.clone()).collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("o_e2"));
        assert!(warnings[1].contains("o_e3"));
    }

    #[test]
    fn test_invert_groups_old_ids() {
        let mut mapping = BTreeMap::new();
        mapping.insert("a".to_string(), "x".to_string());
        mapping.insert("b".to_string(), "x".to_string());
        let inverted = invert(&mapping);
        assert_eq!(inverted["x"], vec!["a", "b"]);
    }
}
