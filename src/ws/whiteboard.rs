use serde_json::Value;
use std::collections::HashMap;

/// Last full canvas snapshot per session, used to hydrate late joiners.
/// Draw deltas are never stored.
#[derive(Debug, Default)]
pub struct WhiteboardChannel {
    snapshots: HashMap<String, Value>,
}

impl WhiteboardChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_state(&mut self, session_id: &str, snapshot: Value) {
        self.snapshots.insert(session_id.to_string(), snapshot);
    }

    pub fn snapshot(&self, session_id: &str) -> Option<&Value> {
        self.snapshots.get(session_id)
    }

    /// Forget the cached canvas. Returns whether one existed.
    pub fn clear(&mut self, session_id: &str) -> bool {
        self.snapshots.remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
