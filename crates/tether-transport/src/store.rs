//! Keyed collections of sessions. The store exclusively owns its sessions;
//! everything else holds `Arc` handles it re-fetches by id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::session::Session;

/// Pluggable session persistence. The default is in-memory; transport
/// sessions need not survive a process restart.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Option<Arc<Session>>;

    async fn put(&self, session: Arc<Session>);

    async fn remove(&self, id: &str) -> Option<Arc<Session>>;

    /// Session ids currently stored. Iteration happens by id so callers never
    /// hold long references across the store lock.
    async fn ids(&self) -> Vec<String>;

    async fn len(&self) -> usize;
}

/// In-memory store backed by a read-write locked map.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn put(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
