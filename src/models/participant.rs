use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A client that has explicitly joined a session.
///
/// Keyed by `client_id` within a session, so one browser tab is counted once
/// no matter how many times it rejoins.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionParticipant {
    pub client_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Caller supplied fields of a participant record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub username: String,
    pub photo_url: Option<String>,
}

/// Presence snapshot pushed to participants and observers
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsUpdate {
    pub session_id: String,
    pub participants: Vec<SessionParticipant>,
    pub count: usize,
}

impl ParticipantsUpdate {
    pub fn new(session_id: &str, participants: Vec<SessionParticipant>) -> Self {
        Self {
            session_id: session_id.to_string(),
            count: participants.len(),
            participants,
        }
    }
}
