use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use skiff_types::{ChatMessage, Session};

/// In-memory session map. Nothing is persisted; sessions live for the
/// process lifetime until an explicit cleanup call reaps them.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_or_create(&self, id: &str, directory: &str) -> Session {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, directory))
            .clone()
    }

    pub async fn update_messages(&self, id: &str, messages: Vec<ChatMessage>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.messages = messages;
            session.touch();
        }
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut sessions = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
        sessions
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Removes sessions idle for longer than `max_age_ms`; returns how
    /// many were reaped.
    pub async fn cleanup(&self, max_age_ms: u64) -> usize {
        let cutoff = Utc::now() - Duration::milliseconds(max_age_ms as i64);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.time.updated >= cutoff);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_id() {
        let store = SessionStore::new();
        let first = store.get_or_create("s1", "/ws").await;
        let second = store.get_or_create("s1", "/elsewhere").await;
        assert_eq!(first.id, second.id);
        assert_eq!(second.directory, "/ws");
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn update_messages_touches_session() {
        let store = SessionStore::new();
        let created = store.get_or_create("s1", "/ws").await;
        store
            .update_messages("s1", vec![ChatMessage::user("hello")])
            .await;
        let updated = store.get("s1").await.expect("session");
        assert_eq!(updated.messages.len(), 1);
        assert!(updated.time.updated >= created.time.updated);
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_activity() {
        let store = SessionStore::new();
        store.get_or_create("older", "/ws").await;
        store.get_or_create("newer", "/ws").await;
        store
            .update_messages("older", vec![ChatMessage::user("ping")])
            .await;

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "older");
    }

    #[tokio::test]
    async fn cleanup_reaps_only_stale_sessions() {
        let store = SessionStore::new();
        store.get_or_create("fresh", "/ws").await;
        store.get_or_create("stale", "/ws").await;
        {
            let mut sessions = store.sessions.write().await;
            sessions.get_mut("stale").expect("stale").time.updated =
                Utc::now() - Duration::hours(2);
        }

        let reaped = store.cleanup(60 * 60 * 1000).await;
        assert_eq!(reaped, 1);
        assert!(store.get("fresh").await.is_some());
        assert!(store.get("stale").await.is_none());
    }
}
