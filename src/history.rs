//! # Chat History Store
//!
//! Persists the ordered list of chat sessions as one versioned JSON document.
//!
//! ## Document Format:
//! ```json
//! { "schema_version": 1, "sessions": [ { "id": "...", "title": "...", "turns": [] } ] }
//! ```
//! A bare JSON array (the unversioned layout) is read as version 1 and
//! rewritten in the versioned layout on the next save. Documents written by a
//! newer build are refused rather than silently truncated.

use crate::genai::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_TITLE: &str = "New chat";
pub const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug)]
pub enum HistoryError {
    Io(std::io::Error),
    Parse(String),
    UnsupportedVersion(u32),
    NotFound(String),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Io(err) => write!(f, "History I/O error: {}", err),
            HistoryError::Parse(msg) => write!(f, "History document is invalid: {}", msg),
            HistoryError::UnsupportedVersion(v) => write!(
                f,
                "History schema version {} is newer than supported version {}",
                v, CURRENT_SCHEMA_VERSION
            ),
            HistoryError::NotFound(id) => write!(f, "Chat session not found: {}", id),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<std::io::Error> for HistoryError {
    fn from(err: std::io::Error) -> Self {
        HistoryError::Io(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<StoredAttachment>,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>, attachments: Vec<StoredAttachment>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            attachments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: Vec<ChatTurn>,
}

impl ChatSession {
    fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            created_at: now,
            updated_at: now,
            turns: Vec::new(),
        }
    }

    /// Listing entry without the turns.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            turn_count: self.turns.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: usize,
}

#[derive(Deserialize)]
struct HistoryDocument {
    #[serde(default)]
    sessions: Vec<ChatSession>,
}

#[derive(Serialize)]
struct HistoryDocumentRef<'a> {
    schema_version: u32,
    sessions: &'a [ChatSession],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredLayout {
    Versioned { schema_version: u32 },
    Legacy(Vec<serde_json::Value>),
}

/// Parse a stored document, migrating the unversioned layout.
pub fn parse_document(payload: &str) -> Result<Vec<ChatSession>, HistoryError> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }

    let layout: StoredLayout =
        serde_json::from_str(payload).map_err(|e| HistoryError::Parse(e.to_string()))?;

    match layout {
        StoredLayout::Legacy(_) => {
            let sessions: Vec<ChatSession> =
                serde_json::from_str(payload).map_err(|e| HistoryError::Parse(e.to_string()))?;
            info!(sessions = sessions.len(), "Migrating unversioned chat history");
            Ok(sessions)
        }
        StoredLayout::Versioned { schema_version } if schema_version > CURRENT_SCHEMA_VERSION => {
            Err(HistoryError::UnsupportedVersion(schema_version))
        }
        StoredLayout::Versioned { .. } => {
            let document: HistoryDocument =
                serde_json::from_str(payload).map_err(|e| HistoryError::Parse(e.to_string()))?;
            Ok(document.sessions)
        }
    }
}

/// Title for a session whose first user message is `text`.
pub fn title_from_message(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}

/// Markdown transcript of one session.
pub fn export_markdown(session: &ChatSession) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", session.title);
    let _ = writeln!(out);
    let _ = writeln!(out, "_Created {}_", session.created_at.format("%Y-%m-%d %H:%M UTC"));

    for turn in &session.turns {
        let speaker = match turn.role {
            Role::User => "You",
            Role::Model => "Assistant",
        };
        let _ = writeln!(out);
        let _ = writeln!(out, "## {} ({})", speaker, turn.timestamp.format("%H:%M:%S"));
        let _ = writeln!(out);
        for attachment in &turn.attachments {
            let name = attachment.name.as_deref().unwrap_or("attachment");
            let _ = writeln!(out, "_Attachment: {} ({})_", name, attachment.mime_type);
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "{}", turn.text);
    }
    out
}

/// File-backed store. Every operation reads, modifies and rewrites the whole
/// document under one lock.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Summaries, most recently updated first.
    pub fn list(&self) -> Result<Vec<SessionSummary>, HistoryError> {
        let _guard = self.guard();
        Ok(self.load()?.iter().map(ChatSession::summary).collect())
    }

    pub fn get(&self, id: &str) -> Result<ChatSession, HistoryError> {
        let _guard = self.guard();
        self.load()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))
    }

    pub fn create(&self, title: Option<String>) -> Result<ChatSession, HistoryError> {
        let _guard = self.guard();
        let mut sessions = self.load()?;
        let session = ChatSession::new(title);
        sessions.insert(0, session.clone());
        self.save(&mut sessions)?;
        debug!(session_id = %session.id, "Created chat session");
        Ok(session)
    }

    pub fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let _guard = self.guard();
        let mut sessions = self.load()?;
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Err(HistoryError::NotFound(id.to_string()));
        }
        self.save(&mut sessions)?;
        debug!(session_id = %id, "Deleted chat session");
        Ok(())
    }

    /// Append turns to a session, renaming a default-titled session after its
    /// first user message.
    pub fn append_turns(&self, id: &str, turns: Vec<ChatTurn>) -> Result<ChatSession, HistoryError> {
        let _guard = self.guard();
        let mut sessions = self.load()?;
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;

        if session.title == DEFAULT_TITLE {
            let has_user_turn = session.turns.iter().any(|t| t.role == Role::User);
            if let Some(first) = turns.iter().find(|t| t.role == Role::User) {
                if !has_user_turn {
                    session.title = title_from_message(&first.text);
                }
            }
        }

        session.turns.extend(turns);
        session.updated_at = Utc::now();
        let updated = session.clone();

        self.save(&mut sessions)?;
        Ok(updated)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<Vec<ChatSession>, HistoryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(payload) => parse_document(&payload),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, sessions: &mut [ChatSession]) -> Result<(), HistoryError> {
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let document = HistoryDocumentRef {
            schema_version: CURRENT_SCHEMA_VERSION,
            sessions,
        };
        let json = serde_json::to_string_pretty(&document).map_err(|e| HistoryError::Parse(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_append_and_retitle() {
        let (_dir, store) = store();
        let session = store.create(None).unwrap();
        assert_eq!(session.title, DEFAULT_TITLE);

        let long = "Explain how the scheduling cursor keeps audio gapless please";
        let updated = store
            .append_turns(
                &session.id,
                vec![
                    ChatTurn::new(Role::User, long, Vec::new()),
                    ChatTurn::new(Role::Model, "Sure.", Vec::new()),
                ],
            )
            .unwrap();

        assert_eq!(updated.title.chars().count(), TITLE_MAX_CHARS);
        assert!(long.starts_with(&updated.title));
        assert_eq!(updated.turns.len(), 2);

        store
            .append_turns(&session.id, vec![ChatTurn::new(Role::User, "second", Vec::new())])
            .unwrap();
        let reloaded = store.get(&session.id).unwrap();
        assert_eq!(reloaded.title, updated.title);
        assert_eq!(reloaded.turns.len(), 3);
    }

    #[test]
    fn test_explicit_title_is_kept() {
        let (_dir, store) = store();
        let session = store.create(Some("Trip plans".to_string())).unwrap();
        let updated = store
            .append_turns(&session.id, vec![ChatTurn::new(Role::User, "hello", Vec::new())])
            .unwrap();
        assert_eq!(updated.title, "Trip plans");
    }

    #[test]
    fn test_most_recent_first_and_delete() {
        let (_dir, store) = store();
        let first = store.create(Some("first".to_string())).unwrap();
        let second = store.create(Some("second".to_string())).unwrap();
        store
            .append_turns(&first.id, vec![ChatTurn::new(Role::User, "bump", Vec::new())])
            .unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);

        store.delete(&first.id).unwrap();
        assert!(matches!(store.get(&first.id), Err(HistoryError::NotFound(_))));
        assert!(matches!(store.delete(&first.id), Err(HistoryError::NotFound(_))));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_written_document_is_versioned() {
        let (_dir, store) = store();
        store.create(None).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schema_version"], CURRENT_SCHEMA_VERSION);
        assert_eq!(value["sessions"].as_array().unwrap().len(), 1);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_legacy_array_is_migrated() {
        let (_dir, store) = store();
        let legacy = r#"[
            {"id": "a1", "title": "Old chat", "turns": [
                {"role": "user", "text": "hi", "timestamp": "2024-05-01T10:00:00Z"}
            ]}
        ]"#;
        std::fs::write(store.path(), legacy).unwrap();

        let session = store.get("a1").unwrap();
        assert_eq!(session.title, "Old chat");
        assert_eq!(session.turns[0].text, "hi");

        store.create(None).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"schema_version\": 1"));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let err = parse_document(r#"{"schema_version": 7, "sessions": []}"#).unwrap_err();
        assert!(matches!(err, HistoryError::UnsupportedVersion(7)));
        assert!(matches!(parse_document("{oops"), Err(HistoryError::Parse(_))));
    }

    #[test]
    fn test_markdown_export() {
        let mut session = ChatSession::new(Some("Demo".to_string()));
        session.turns.push(ChatTurn::new(
            Role::User,
            "Look at this",
            vec![StoredAttachment {
                mime_type: "image/png".to_string(),
                name: Some("cat.png".to_string()),
                data: "AAAA".to_string(),
            }],
        ));
        session.turns.push(ChatTurn::new(Role::Model, "A cat.", Vec::new()));

        let md = export_markdown(&session);
        assert!(md.starts_with("# Demo\n"));
        assert!(md.contains("## You"));
        assert!(md.contains("_Attachment: cat.png (image/png)_"));
        assert!(md.contains("## Assistant"));
        assert!(md.contains("A cat."));
        assert!(!md.contains("AAAA"));
    }

    #[test]
    fn test_title_from_message() {
        assert_eq!(title_from_message("   "), DEFAULT_TITLE);
        assert_eq!(title_from_message(" short "), "short");
        let unicode: String = "é".repeat(50);
        assert_eq!(title_from_message(&unicode).chars().count(), TITLE_MAX_CHARS);
    }
}
