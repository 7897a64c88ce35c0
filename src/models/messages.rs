use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ParticipantsUpdate, SessionTimingInfo};

// Every frame is `{"event": "<name>", "data": {...}}`. Inbound payload fields
// default to empty so a missing id becomes a validation error instead of a
// parse failure.

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionUserRef {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinSessionMessage {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeChangeMessage {
    pub session_id: String,
    pub content: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LanguageChangeMessage {
    pub session_id: String,
    pub new_language: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CursorMoveMessage {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub position: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingMessage {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub is_typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatMessageIn {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinVideoMessage {
    pub session_id: String,
    pub user_id: String,
    pub peer_id: String,
    pub user_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaveVideoMessage {
    pub session_id: String,
    pub user_id: String,
    pub peer_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerUnavailableMessage {
    pub session_id: String,
    pub peer_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WhiteboardDrawMessage {
    pub session_id: String,
    pub user_id: String,
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WhiteboardUpdateMessage {
    pub session_id: String,
    pub canvas_data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WhiteboardClearMessage {
    pub session_id: String,
    pub user_id: String,
}

/// Events a connected client may send
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinSession(JoinSessionMessage),
    LeaveSession(SessionUserRef),
    ObserveSession(SessionRef),
    LeaveObserver(SessionRef),
    RequestCode(SessionRef),
    CodeChange(CodeChangeMessage),
    LanguageChange(LanguageChangeMessage),
    CursorMove(CursorMoveMessage),
    Typing(TypingMessage),
    ChatMessage(ChatMessageIn),
    GetSessionTime(SessionRef),
    ExtendSession(SessionUserRef),
    EndSession(SessionUserRef),
    JoinVideo(JoinVideoMessage),
    LeaveVideo(LeaveVideoMessage),
    GetVideoParticipants(SessionRef),
    PeerUnavailable(PeerUnavailableMessage),
    WhiteboardJoin(SessionUserRef),
    WhiteboardDraw(WhiteboardDrawMessage),
    WhiteboardUpdate(WhiteboardUpdateMessage),
    WhiteboardClear(WhiteboardClearMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedMessage {
    pub client_id: String,
    pub connection_id: u64,
    pub user_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForceDisconnectMessage {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCodeMessage {
    pub content: String,
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdateMessage {
    pub content: String,
    pub sender_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageChangedMessage {
    pub new_language: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdateMessage {
    pub user_id: String,
    pub username: String,
    pub position: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTypingMessage {
    pub user_id: String,
    pub username: String,
    pub is_typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageOut {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionExtendedMessage {
    #[serde(flatten)]
    pub timing: SessionTimingInfo,
    pub extended_by: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionFailedMessage {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndingSoonMessage {
    pub session_id: String,
    pub time_left: i64,
    pub can_extend: bool,
    pub extensions_remaining: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedMessage {
    pub session_id: String,
    pub ended_by: Option<String>,
    pub ended_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoParticipant {
    pub user_id: String,
    pub peer_id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExistingVideoParticipants {
    pub participants: Vec<VideoParticipant>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoUserLeft {
    pub user_id: String,
    pub peer_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardStateMessage {
    pub canvas_data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardDrawBroadcast {
    pub user_id: String,
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardClearBroadcast {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionErrorMessage {
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
}

/// Events the server pushes to connected clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected(ConnectedMessage),
    ForceDisconnect(ForceDisconnectMessage),
    ParticipantsUpdate(ParticipantsUpdate),
    SessionCode(SessionCodeMessage),
    CodeUpdate(CodeUpdateMessage),
    LanguageChange(LanguageChangedMessage),
    CursorUpdate(CursorUpdateMessage),
    UserTyping(UserTypingMessage),
    ChatMessage(ChatMessageOut),
    SessionTimeInfo(SessionTimingInfo),
    SessionExtended(SessionExtendedMessage),
    SessionExtensionFailed(ExtensionFailedMessage),
    SessionEndingSoon(SessionEndingSoonMessage),
    SessionEnded(SessionEndedMessage),
    ExistingVideoParticipants(ExistingVideoParticipants),
    UserJoined(VideoParticipant),
    UserLeft(VideoUserLeft),
    WhiteboardState(WhiteboardStateMessage),
    WhiteboardDraw(WhiteboardDrawBroadcast),
    WhiteboardClear(WhiteboardClearBroadcast),
    SessionError(SessionErrorMessage),
    Error(ErrorMessage),
}

impl ServerEvent {
    pub fn session_error(session_id: Option<&str>, message: impl Into<String>) -> Self {
        ServerEvent::SessionError(SessionErrorMessage {
            session_id: session_id.map(str::to_string),
            message: message.into(),
        })
    }

    /// Wire name of the event, as used in the `event` field
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::ForceDisconnect(_) => "force-disconnect",
            ServerEvent::ParticipantsUpdate(_) => "participants-update",
            ServerEvent::SessionCode(_) => "session-code",
            ServerEvent::CodeUpdate(_) => "code-update",
            ServerEvent::LanguageChange(_) => "language-change",
            ServerEvent::CursorUpdate(_) => "cursor-update",
            ServerEvent::UserTyping(_) => "user-typing",
            ServerEvent::ChatMessage(_) => "chat-message",
            ServerEvent::SessionTimeInfo(_) => "session-time-info",
            ServerEvent::SessionExtended(_) => "session-extended",
            ServerEvent::SessionExtensionFailed(_) => "session-extension-failed",
            ServerEvent::SessionEndingSoon(_) => "session-ending-soon",
            ServerEvent::SessionEnded(_) => "session-ended",
            ServerEvent::ExistingVideoParticipants(_) => "existing-video-participants",
            ServerEvent::UserJoined(_) => "user-joined",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::WhiteboardState(_) => "whiteboard-state",
            ServerEvent::WhiteboardDraw(_) => "whiteboard-draw",
            ServerEvent::WhiteboardClear(_) => "whiteboard-clear",
            ServerEvent::SessionError(_) => "session-error",
            ServerEvent::Error(_) => "error",
        }
    }
}
