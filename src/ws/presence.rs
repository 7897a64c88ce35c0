use chrono::Utc;
use std::collections::HashMap;

use crate::models::{ParticipantInfo, SessionParticipant};

/// Per-session participant records, keyed by client identity.
#[derive(Debug, Default)]
pub struct PresenceStore {
    sessions: HashMap<String, HashMap<String, SessionParticipant>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the participant and return the full list.
    ///
    /// Rejoining with the same client id keeps the original `joined_at`.
    pub fn join(&mut self, session_id: &str, client_id: &str, info: ParticipantInfo) -> Vec<SessionParticipant> {
        let participants = self.sessions.entry(session_id.to_string()).or_default();
        participants
            .entry(client_id.to_string())
            .and_modify(|p| {
                p.user_id = info.user_id.clone();
                p.username = info.username.clone();
                p.photo_url = info.photo_url.clone();
            })
            .or_insert_with(|| SessionParticipant {
                client_id: client_id.to_string(),
                user_id: info.user_id.clone(),
                username: info.username.clone(),
                photo_url: info.photo_url.clone(),
                joined_at: Utc::now(),
            });
        self.list(session_id)
    }

    /// Remove the participant. `None` means it was not present and nothing
    /// should be broadcast.
    pub fn leave(&mut self, session_id: &str, client_id: &str) -> Option<Vec<SessionParticipant>> {
        let participants = self.sessions.get_mut(session_id)?;
        participants.remove(client_id)?;
        if participants.is_empty() {
            self.sessions.remove(session_id);
        }
        Some(self.list(session_id))
    }

    /// Participants ordered by join time
    pub fn list(&self, session_id: &str) -> Vec<SessionParticipant> {
        let mut list: Vec<SessionParticipant> = self
            .sessions
            .get(session_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.client_id.cmp(&b.client_id)));
        list
    }

    pub fn count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, |p| p.len())
    }

    pub fn contains(&self, session_id: &str, client_id: &str) -> bool {
        self.sessions.get(session_id).is_some_and(|p| p.contains_key(client_id))
    }

    /// Drop every participant of the session, returning their client ids
    pub fn clear(&mut self, session_id: &str) -> Vec<String> {
        self.sessions
            .remove(session_id)
            .map(|p| p.into_keys().collect())
            .unwrap_or_default()
    }

    /// Sessions the client is currently counted in
    pub fn sessions_for(&self, client_id: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, participants)| participants.contains_key(client_id))
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    pub fn participant_total(&self) -> usize {
        self.sessions.values().map(|p| p.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(user_id: &str, photo: Option<&str>) -> ParticipantInfo {
        ParticipantInfo {
            user_id: user_id.to_string(),
            username: user_id.to_uppercase(),
            photo_url: photo.map(str::to_string),
        }
    }

    #[test]
    fn repeated_join_is_idempotent_and_refreshes_fields() {
        let mut store = PresenceStore::new();
        store.join("s1", "tab-a", info("a", None));
        let list = store.join("s1", "tab-a", info("a", Some("new.png")));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].photo_url.as_deref(), Some("new.png"));
    }

    #[test]
    fn leave_of_absent_client_returns_none() {
        let mut store = PresenceStore::new();
        assert!(store.leave("s1", "tab-a").is_none());
        store.join("s1", "tab-a", info("a", None));
        assert_eq!(store.leave("s1", "tab-a"), Some(vec![]));
        assert!(store.leave("s1", "tab-a").is_none());
        assert_eq!(store.count("s1"), 0);
    }

    #[test]
    fn count_tracks_distinct_clients_across_interleavings() {
        let mut store = PresenceStore::new();
        let ops: &[(&str, bool)] = &[
            ("a", true), ("b", true), ("a", true), ("a", false), ("a", false),
            ("c", true), ("b", false), ("b", false), ("a", true), ("c", true),
        ];
        let mut joined = std::collections::HashSet::new();
        for (client, join) in ops {
            if *join {
                let list = store.join("s1", client, info(client, None));
                joined.insert(*client);
                assert_eq!(list.len(), joined.len());
            } else {
                let expected_some = joined.remove(client);
                let result = store.leave("s1", client);
                assert_eq!(result.is_some(), expected_some);
                if let Some(list) = result {
                    assert_eq!(list.len(), joined.len());
                }
            }
            assert_eq!(store.count("s1"), joined.len());
        }
    }

    #[test]
    fn sessions_for_and_clear() {
        let mut store = PresenceStore::new();
        store.join("s1", "tab-a", info("a", None));
        store.join("s2", "tab-a", info("a", None));
        store.join("s2", "tab-b", info("b", None));

        let mut sessions = store.sessions_for("tab-a");
        sessions.sort();
        assert_eq!(sessions, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(store.participant_total(), 3);

        let mut cleared = store.clear("s2");
        cleared.sort();
        assert_eq!(cleared, vec!["tab-a".to_string(), "tab-b".to_string()]);
        assert!(store.list("s2").is_empty());
    }
}
