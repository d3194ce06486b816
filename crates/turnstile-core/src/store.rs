use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::turn::ConversationTurn;

/// Durable storage for a session's turns.
///
/// Each call replaces the session's stored messages with `turns`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn update_session_messages(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<(), Error>;

    /// Load a session's stored turns; empty when the session is unknown.
    async fn load_session_messages(&self, session_id: &str) -> Result<Vec<ConversationTurn>, Error>;
}

/// Process-local store, useful for hosts without persistence.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn update_session_messages(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<(), Error> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), turns.to_vec());
        Ok(())
    }

    async fn load_session_messages(&self, session_id: &str) -> Result<Vec<ConversationTurn>, Error> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }
}
