use std::collections::{HashMap, HashSet};

use crate::ws::connctx::ConnId;

/// Connections watching a session's presence without joining it.
#[derive(Debug, Default)]
pub struct ObserverSet {
    sessions: HashMap<String, HashSet<ConnId>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, session_id: &str, conn_id: ConnId) -> bool {
        self.sessions.entry(session_id.to_string()).or_default().insert(conn_id)
    }

    pub fn unwatch(&mut self, session_id: &str, conn_id: ConnId) -> bool {
        let Some(watchers) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let removed = watchers.remove(&conn_id);
        if watchers.is_empty() {
            self.sessions.remove(session_id);
        }
        removed
    }

    /// Remove the connection from every session it watches
    pub fn unwatch_all(&mut self, conn_id: ConnId) -> Vec<String> {
        let mut left = Vec::new();
        self.sessions.retain(|session_id, watchers| {
            if watchers.remove(&conn_id) {
                left.push(session_id.clone());
            }
            !watchers.is_empty()
        });
        left
    }

    pub fn observers(&self, session_id: &str) -> Vec<ConnId> {
        self.sessions
            .get(session_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn total(&self) -> usize {
        self.sessions.values().map(|w| w.len()).sum()
    }
}
