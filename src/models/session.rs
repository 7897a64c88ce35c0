use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable status of a session document
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

/// Session document as kept by the durable store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub status: Option<SessionStatus>,
    pub scheduled_end_time: Option<DateTime<Utc>>,
    pub extension_count: i32,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<String>,
    pub end_reason: Option<String>,
    pub code: Option<String>,
    pub language: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// Apply the fields set in `patch`, leaving the others untouched.
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
        if let Some(end) = patch.scheduled_end_time {
            self.scheduled_end_time = Some(end);
        }
        if let Some(count) = patch.extension_count {
            self.extension_count = count;
        }
        if let Some(at) = patch.ended_at {
            self.ended_at = Some(at);
        }
        if let Some(by) = &patch.ended_by {
            self.ended_by = Some(by.clone());
        }
        if let Some(reason) = &patch.end_reason {
            self.end_reason = Some(reason.clone());
        }
        if let Some(code) = &patch.code {
            self.code = Some(code.clone());
        }
        if let Some(language) = &patch.language {
            self.language = Some(language.clone());
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Partial update of a session document. `None` fields are left as stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub scheduled_end_time: Option<DateTime<Utc>>,
    pub extension_count: Option<i32>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<String>,
    pub end_reason: Option<String>,
    pub code: Option<String>,
    pub language: Option<String>,
}

impl SessionPatch {
    pub fn started(scheduled_end_time: DateTime<Utc>) -> Self {
        Self {
            status: Some(SessionStatus::Active),
            scheduled_end_time: Some(scheduled_end_time),
            extension_count: Some(0),
            ..Self::default()
        }
    }

    pub fn extended(scheduled_end_time: DateTime<Utc>, extension_count: u32) -> Self {
        Self {
            scheduled_end_time: Some(scheduled_end_time),
            extension_count: Some(extension_count as i32),
            ..Self::default()
        }
    }

    pub fn ended(ended_at: DateTime<Utc>, ended_by: Option<String>, reason: &str) -> Self {
        Self {
            status: Some(SessionStatus::Ended),
            ended_at: Some(ended_at),
            ended_by,
            end_reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn code(content: &str, language: &str) -> Self {
        Self {
            code: Some(content.to_string()),
            language: Some(language.to_string()),
            ..Self::default()
        }
    }

    pub fn language(language: &str) -> Self {
        Self {
            language: Some(language.to_string()),
            ..Self::default()
        }
    }
}

/// Per-user counters kept alongside sessions
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum UsageMetric {
    CodeEdits,
    MessagesSent,
    SessionsJoined,
}

impl UsageMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::CodeEdits => "codeEdits",
            UsageMetric::MessagesSent => "messagesSent",
            UsageMetric::SessionsJoined => "sessionsJoined",
        }
    }
}
