//! Session persistence as one JSON file per session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use turnstile_core::{ConversationTurn, Error, SessionStore};

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    session_id: String,
    updated_at: chrono::DateTime<chrono::Utc>,
    turns: Vec<ConversationTurn>,
}

pub struct JsonFileSessionStore {
    dir: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, Error> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !session_id.starts_with('.');
        if !valid {
            return Err(Error::store(format!("Invalid session id: {session_id:?}")));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn update_session_messages(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<(), Error> {
        let path = self.session_path(session_id)?;
        let file = SessionFile {
            session_id: session_id.to_string(),
            updated_at: chrono::Utc::now(),
            turns: turns.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| Error::store(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::store(format!("Failed to create {}: {e}", self.dir.display())))?;

        // Write-then-rename so a crash never leaves a truncated session.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::store(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::store(format!("Failed to replace {}: {e}", path.display())))?;

        tracing::debug!(session = session_id, turns = turns.len(), path = %path.display(), "Session saved");
        Ok(())
    }

    async fn load_session_messages(&self, session_id: &str) -> Result<Vec<ConversationTurn>, Error> {
        let path = self.session_path(session_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store(format!("Failed to read {}: {e}", path.display()))),
        };
        let file: SessionFile = serde_json::from_slice(&bytes)
            .map_err(|e| Error::store(format!("Corrupt session file {}: {e}", path.display())))?;
        Ok(file.turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::ToolCall;

    #[tokio::test]
    async fn test_round_trip_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path().join("sessions"));

        let first = vec![ConversationTurn::user("hi")];
        store.update_session_messages("s1", &first).await.unwrap();

        let second = vec![
            ConversationTurn::user("hi"),
            ConversationTurn::assistant("**m**\n\nhello")
                .with_model("m")
                .with_tool_calls(vec![
                    ToolCall::new("c1", "current_time", serde_json::json!({})).with_result("noon"),
                ]),
        ];
        store.update_session_messages("s1", &second).await.unwrap();

        let loaded = store.load_session_messages("s1").await.unwrap();
        assert_eq!(loaded, second);
        assert!(!dir.path().join("sessions").join("s1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_unknown_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        assert!(store.load_session_messages("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        for id in ["../escape", "a/b", "", ".hidden"] {
            let err = store.update_session_messages(id, &[]).await.unwrap_err();
            assert!(matches!(err, Error::Store(_)), "{id}");
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        let err = store.load_session_messages("bad").await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }
}
