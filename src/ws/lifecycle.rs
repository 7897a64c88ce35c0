use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::models::SessionTimingInfo;
use crate::ws::timers::{TimerHandle, TimerKind, TimerScheduler};

/// Lifetime rules applied to every session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub duration: Duration,
    pub extension: Duration,
    pub max_extensions: u32,
    pub warning_lead: Duration,
    pub idle_timeout: Duration,
    pub save_debounce: Duration,
    pub stale_peer_ttl: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30 * 60),
            extension: Duration::from_secs(15 * 60),
            max_extensions: 2,
            warning_lead: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            save_debounce: Duration::from_secs(2),
            stale_peer_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Inactive,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtendError {
    #[error("Session is not active")]
    NotActive,
    #[error("Maximum extensions ({max}) already used")]
    LimitReached { max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    TimeLimit,
    Inactivity,
    Manual,
}

impl EndReason {
    pub fn describe(&self, ended_by: Option<&str>) -> String {
        match (self, ended_by) {
            (EndReason::TimeLimit, _) => "Session time limit reached".to_string(),
            (EndReason::Inactivity, _) => "Session ended due to inactivity".to_string(),
            (EndReason::Manual, Some(user)) => format!("Session ended manually by {}", user),
            (EndReason::Manual, None) => "Session ended manually".to_string(),
        }
    }
}

/// Timing record of an ACTIVE session.
///
/// The end is kept as an absolute instant, never as a remaining counter.
#[derive(Debug)]
pub struct SessionTiming {
    pub scheduled_end_time: DateTime<Utc>,
    pub extensions_used: u32,
    ends_at: Instant,
    duration_timer: Option<TimerHandle>,
    warning_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
}

impl SessionTiming {
    fn slot(&mut self, kind: TimerKind) -> Option<&mut Option<TimerHandle>> {
        match kind {
            TimerKind::Duration => Some(&mut self.duration_timer),
            TimerKind::Warning => Some(&mut self.warning_timer),
            TimerKind::Idle => Some(&mut self.idle_timer),
            TimerKind::DocumentFlush => None,
        }
    }

    pub fn time_left(&self) -> Duration {
        self.ends_at.saturating_duration_since(Instant::now())
    }

    pub fn has_timer(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Duration => self.duration_timer.is_some(),
            TimerKind::Warning => self.warning_timer.is_some(),
            TimerKind::Idle => self.idle_timer.is_some(),
            TimerKind::DocumentFlush => false,
        }
    }

    pub fn timer_id(&self, kind: TimerKind) -> Option<u64> {
        match kind {
            TimerKind::Duration => self.duration_timer.as_ref().map(TimerHandle::id),
            TimerKind::Warning => self.warning_timer.as_ref().map(TimerHandle::id),
            TimerKind::Idle => self.idle_timer.as_ref().map(TimerHandle::id),
            TimerKind::DocumentFlush => None,
        }
    }
}

/// Drives INACTIVE -> ACTIVE -> ENDED for every session
#[derive(Debug)]
pub struct LifecycleController {
    policy: SessionPolicy,
    timings: HashMap<String, SessionTiming>,
    ended: HashSet<String>,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl LifecycleController {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            timings: HashMap::new(),
            ended: HashSet::new(),
        }
    }

    pub fn state(&self, session_id: &str) -> LifecycleState {
        if self.timings.contains_key(session_id) {
            LifecycleState::Active
        } else if self.ended.contains(session_id) {
            LifecycleState::Ended
        } else {
            LifecycleState::Inactive
        }
    }

    pub fn timing(&self, session_id: &str) -> Option<&SessionTiming> {
        self.timings.get(session_id)
    }

    /// Start the duration, warning and idle timers of an INACTIVE session.
    /// Returns the scheduled end, or `None` if the session was not INACTIVE.
    pub fn start(&mut self, session_id: &str, timers: &mut TimerScheduler) -> Option<DateTime<Utc>> {
        if self.state(session_id) != LifecycleState::Inactive {
            return None;
        }
        let now = Instant::now();
        let ends_at = now + self.policy.duration;
        let scheduled_end_time = Utc::now() + to_chrono(self.policy.duration);

        let timing = SessionTiming {
            scheduled_end_time,
            extensions_used: 0,
            ends_at,
            duration_timer: Some(timers.schedule(session_id, TimerKind::Duration, ends_at)),
            warning_timer: Some(self.schedule_warning(session_id, ends_at, timers)),
            idle_timer: Some(timers.schedule(session_id, TimerKind::Idle, now + self.policy.idle_timeout)),
        };
        self.timings.insert(session_id.to_string(), timing);
        info!("Session {} started, scheduled to end at {}", session_id, scheduled_end_time);
        Some(scheduled_end_time)
    }

    /// Restart the idle timer of an ACTIVE session. Other timers are untouched.
    pub fn record_activity(&mut self, session_id: &str, timers: &mut TimerScheduler) -> bool {
        let idle_timeout = self.policy.idle_timeout;
        let Some(timing) = self.timings.get_mut(session_id) else {
            return false;
        };
        // Replacing the handle drops, and so aborts, the previous idle timer
        timing.idle_timer = Some(timers.schedule(session_id, TimerKind::Idle, Instant::now() + idle_timeout));
        true
    }

    pub fn extend(&mut self, session_id: &str, timers: &mut TimerScheduler) -> Result<SessionTimingInfo, ExtendError> {
        let max = self.policy.max_extensions;
        let extension = self.policy.extension;
        if !self.timings.contains_key(session_id) {
            return Err(ExtendError::NotActive);
        }
        if self.timings.get(session_id).is_some_and(|t| t.extensions_used >= max) {
            return Err(ExtendError::LimitReached { max });
        }

        let ends_at = Instant::now() + extension;
        let warning = self.schedule_warning(session_id, ends_at, timers);
        let timing = self.timings.get_mut(session_id).ok_or(ExtendError::NotActive)?;
        timing.duration_timer = Some(timers.schedule(session_id, TimerKind::Duration, ends_at));
        timing.warning_timer = Some(warning);
        timing.ends_at = ends_at;
        timing.scheduled_end_time = Utc::now() + to_chrono(extension);
        timing.extensions_used += 1;
        info!(
            "Session {} extended ({}/{}), now ends at {}",
            session_id, timing.extensions_used, max, timing.scheduled_end_time
        );
        Ok(self.timing_info(session_id))
    }

    /// Claim a fired lifecycle timer. False for stale firings, whose handle
    /// was already replaced or cancelled.
    pub fn accept_timer(&mut self, session_id: &str, kind: TimerKind, timer_id: u64) -> bool {
        let Some(timing) = self.timings.get_mut(session_id) else {
            debug!("Ignoring {:?} timer for inactive session {}", kind, session_id);
            return false;
        };
        let Some(slot) = timing.slot(kind) else {
            return false;
        };
        if (*slot).as_ref().map(TimerHandle::id) != Some(timer_id) {
            debug!("Ignoring stale {:?} timer {} for session {}", kind, timer_id, session_id);
            return false;
        }
        slot.take();
        true
    }

    /// ACTIVE -> ENDED. Cancels every timer of the session.
    /// Returns the final timing, or `None` when the session was not ACTIVE.
    pub fn finish(&mut self, session_id: &str) -> Option<SessionTiming> {
        let mut timing = self.timings.remove(session_id)?;
        timing.duration_timer.take();
        timing.warning_timer.take();
        timing.idle_timer.take();
        self.ended.insert(session_id.to_string());
        Some(timing)
    }

    /// Timing block for clients. A session without a record gets a fresh
    /// default window instead of an error.
    pub fn timing_info(&self, session_id: &str) -> SessionTimingInfo {
        let max = self.policy.max_extensions;
        let now = Utc::now();
        match self.timings.get(session_id) {
            Some(timing) => SessionTimingInfo {
                session_id: session_id.to_string(),
                time_left: millis(timing.time_left()),
                extensions_used: timing.extensions_used,
                extensions_remaining: max.saturating_sub(timing.extensions_used),
                can_extend: timing.extensions_used < max,
                server_time: now.timestamp_millis(),
                scheduled_end_time: timing.scheduled_end_time,
            },
            None => SessionTimingInfo {
                session_id: session_id.to_string(),
                time_left: millis(self.policy.duration),
                extensions_used: 0,
                extensions_remaining: max,
                can_extend: max > 0,
                server_time: now.timestamp_millis(),
                scheduled_end_time: now + to_chrono(self.policy.duration),
            },
        }
    }

    pub fn active_count(&self) -> usize {
        self.timings.len()
    }

    pub fn ended_count(&self) -> usize {
        self.ended.len()
    }

    fn schedule_warning(&self, session_id: &str, ends_at: Instant, timers: &mut TimerScheduler) -> TimerHandle {
        let now = Instant::now();
        let at = ends_at
            .checked_sub(self.policy.warning_lead)
            .filter(|at| *at > now)
            .unwrap_or(now);
        timers.schedule(session_id, TimerKind::Warning, at)
    }
}
