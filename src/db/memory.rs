use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::db::store::{SessionStore, StoreError, StoreFuture};
use crate::models::{SessionPatch, SessionRecord, UsageMetric};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    metrics: HashMap<(String, UsageMetric), i64>,
    writes: Vec<(String, SessionPatch)>,
}

/// In-process store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following write fail, to exercise persistence failures
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a stored session document
    pub fn insert(&self, record: SessionRecord) {
        self.state().sessions.insert(record.id.clone(), record);
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.state().sessions.get(session_id).cloned()
    }

    /// Every accepted `update_session` call, in arrival order
    pub fn writes(&self) -> Vec<(String, SessionPatch)> {
        self.state().writes.clone()
    }

    pub fn code_writes(&self, session_id: &str) -> usize {
        self.state()
            .writes
            .iter()
            .filter(|(id, patch)| id == session_id && patch.code.is_some())
            .count()
    }

    pub fn metric(&self, user_id: &str, metric: UsageMetric) -> i64 {
        self.state()
            .metrics
            .get(&(user_id.to_string(), metric))
            .copied()
            .unwrap_or(0)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn get_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move { Ok(self.session(session_id)) })
    }

    fn update_session<'a>(&'a self, session_id: &'a str, patch: SessionPatch) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            let mut state = self.state();
            state
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionRecord::new(session_id))
                .apply(&patch);
            state.writes.push((session_id.to_string(), patch));
            Ok(())
        })
    }

    fn increment_user_metric<'a>(
        &'a self,
        user_id: &'a str,
        metric: UsageMetric,
        amount: i64,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            *self
                .state()
                .metrics
                .entry((user_id.to_string(), metric))
                .or_insert(0) += amount;
            Ok(())
        })
    }
}
