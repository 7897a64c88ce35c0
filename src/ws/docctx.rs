use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::SessionCodeMessage;
use crate::ws::connctx::ConnId;
use crate::ws::timers::TimerHandle;

pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Shared editable code of one active session
#[derive(Clone, Debug, PartialEq)]
pub struct SharedDocumentState {
    pub content: String,
    pub language: String,
    pub last_edit_by: Option<String>,
    pub last_edit_at: Option<DateTime<Utc>>,
}

impl Default for SharedDocumentState {
    fn default() -> Self {
        Self {
            content: String::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            last_edit_by: None,
            last_edit_at: None,
        }
    }
}

impl SharedDocumentState {
    pub fn code_message(&self) -> SessionCodeMessage {
        SessionCodeMessage {
            content: self.content.clone(),
            language: self.language.clone(),
        }
    }
}

/// Last-write-wins document state per session, plus the debounced
/// write-through and store hydration bookkeeping.
#[derive(Debug, Default)]
pub struct DocumentSync {
    docs: HashMap<String, SharedDocumentState>,
    pending_flush: HashMap<String, TimerHandle>,
    hydrating: HashMap<String, Vec<ConnId>>,
}

impl DocumentSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store new content. Returns false when it equals what is stored, in
    /// which case nothing should be broadcast, persisted or metered.
    pub fn apply_edit(&mut self, session_id: &str, content: &str, editor: &str) -> bool {
        let doc = self.docs.entry(session_id.to_string()).or_default();
        if doc.content == content {
            return false;
        }
        doc.content = content.to_string();
        doc.last_edit_by = Some(editor.to_string());
        doc.last_edit_at = Some(Utc::now());
        true
    }

    pub fn change_language(&mut self, session_id: &str, language: &str, editor: &str) -> bool {
        let doc = self.docs.entry(session_id.to_string()).or_default();
        if doc.language == language {
            return false;
        }
        doc.language = language.to_string();
        doc.last_edit_by = Some(editor.to_string());
        doc.last_edit_at = Some(Utc::now());
        true
    }

    pub fn snapshot(&self, session_id: &str) -> Option<&SharedDocumentState> {
        self.docs.get(session_id)
    }

    /// Arm the write-through timer, replacing (and so cancelling) any earlier one
    pub fn schedule_flush(&mut self, session_id: &str, handle: TimerHandle) {
        self.pending_flush.insert(session_id.to_string(), handle);
    }

    /// Consume a fired flush timer. Returns the state to persist, or `None`
    /// when `timer_id` is not the armed handle.
    pub fn accept_flush(&mut self, session_id: &str, timer_id: u64) -> Option<SharedDocumentState> {
        if self.pending_flush.get(session_id).map(TimerHandle::id) != Some(timer_id) {
            return None;
        }
        self.pending_flush.remove(session_id);
        self.docs.get(session_id).cloned()
    }

    /// Cancel an armed flush and return the state it would have written
    pub fn take_pending_flush(&mut self, session_id: &str) -> Option<SharedDocumentState> {
        self.pending_flush.remove(session_id)?;
        self.docs.get(session_id).cloned()
    }

    pub fn discard(&mut self, session_id: &str) -> Option<SharedDocumentState> {
        self.pending_flush.remove(session_id);
        self.docs.remove(session_id)
    }

    /// Register interest in the stored document. Returns true when a store
    /// load should be started (none is in flight yet).
    pub fn begin_hydration(&mut self, session_id: &str, waiter: Option<ConnId>) -> bool {
        let started = !self.hydrating.contains_key(session_id);
        let waiters = self.hydrating.entry(session_id.to_string()).or_default();
        if let Some(conn_id) = waiter {
            if !waiters.contains(&conn_id) {
                waiters.push(conn_id);
            }
        }
        started
    }

    /// Complete a store load. The loaded document is only installed when
    /// `install` holds and no edit created state in the meantime.
    /// Returns the connections waiting for `session-code`.
    pub fn finish_hydration(
        &mut self,
        session_id: &str,
        loaded: Option<(String, String)>,
        install: bool,
    ) -> Vec<ConnId> {
        let waiters = self.hydrating.remove(session_id).unwrap_or_default();
        if install && !self.docs.contains_key(session_id) {
            if let Some((content, language)) = loaded {
                self.docs.insert(
                    session_id.to_string(),
                    SharedDocumentState {
                        content,
                        language,
                        ..SharedDocumentState::default()
                    },
                );
            }
        }
        waiters
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}
