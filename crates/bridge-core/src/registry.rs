use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::BridgeSession;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<BridgeSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<BridgeSession>) {
        self.sessions.write().await.insert(session.session_id.clone(), session);
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<BridgeSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<BridgeSession>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn list(&self) -> Vec<Arc<BridgeSession>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
