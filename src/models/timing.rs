use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Timing block answered to `get-session-time` and carried by `session-extended`.
///
/// `time_left` is in milliseconds and `server_time` is epoch milliseconds, so a
/// client can correct for its own clock drift against `scheduled_end_time`.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimingInfo {
    pub session_id: String,
    pub time_left: i64,
    pub extensions_used: u32,
    pub extensions_remaining: u32,
    pub can_extend: bool,
    pub server_time: i64,
    pub scheduled_end_time: DateTime<Utc>,
}
