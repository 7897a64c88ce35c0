use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::info;

use crate::db::SessionStore;
use crate::models::{ClientEvent, ParticipantsUpdate, SessionTimingInfo};
use crate::ws::connctx::ConnId;
use crate::ws::lifecycle::SessionPolicy;
use crate::ws::registry::SessionRegistry;
use crate::ws::rooms::Outbox;
use crate::ws::timers::{TimerKind, TimerScheduler};

/// Everything that can change session state arrives as one of these
#[derive(Debug)]
pub enum EngineCommand {
    Connect {
        conn_id: ConnId,
        client_id: String,
        user_id: Option<String>,
        outbox: Outbox,
    },
    Disconnect {
        conn_id: ConnId,
    },
    Client {
        conn_id: ConnId,
        event: ClientEvent,
    },
    TimerFired {
        session_id: String,
        kind: TimerKind,
        timer_id: u64,
    },
    /// Result of a store load started by document hydration
    DocumentLoaded {
        session_id: String,
        document: Option<(String, String)>,
    },
    Timing {
        session_id: String,
        reply: oneshot::Sender<SessionTimingInfo>,
    },
    Participants {
        session_id: String,
        reply: oneshot::Sender<ParticipantsUpdate>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub connections: usize,
    pub active_sessions: usize,
    pub ended_sessions: usize,
    pub participants: usize,
    pub observers: usize,
    pub video_peers: usize,
    pub documents: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session engine is not running")]
    Stopped,
}

/// Owns the [`SessionRegistry`] and applies commands one at a time.
pub struct SessionEngine {
    registry: SessionRegistry,
    commands: UnboundedReceiver<EngineCommand>,
}

impl SessionEngine {
    pub fn new(policy: SessionPolicy, store: Arc<dyn SessionStore>) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(policy, store, TimerScheduler::new(tx.clone()));
        let handle = EngineHandle {
            commands: tx,
            next_conn_id: Arc::new(AtomicU64::new(0)),
        };
        (Self { registry, commands: rx }, handle)
    }

    pub async fn run(mut self) {
        info!("Session engine started");
        while let Some(command) = self.commands.recv().await {
            self.registry.handle(command);
        }
        info!("Session engine stopped");
    }
}

/// Cloneable entry point into the engine for sockets and HTTP handlers
#[derive(Clone)]
pub struct EngineHandle {
    commands: UnboundedSender<EngineCommand>,
    next_conn_id: Arc<AtomicU64>,
}

impl EngineHandle {
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    pub async fn timing(&self, session_id: &str) -> Result<SessionTimingInfo, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Timing {
            session_id: session_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn participants(&self, session_id: &str) -> Result<ParticipantsUpdate, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Participants {
            session_id: session_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Stats { reply })?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemorySessionStore;

    #[tokio::test]
    async fn handle_queries_running_engine() {
        let (engine, handle) = SessionEngine::new(SessionPolicy::default(), Arc::new(MemorySessionStore::new()));
        tokio::spawn(engine.run());

        let timing = handle.timing("s1").await.unwrap();
        assert_eq!(timing.session_id, "s1");
        assert_eq!(timing.extensions_used, 0);

        let participants = handle.participants("s1").await.unwrap();
        assert_eq!(participants.count, 0);
        assert_eq!(handle.stats().await.unwrap(), EngineStats::default());
    }

    #[test]
    fn connection_ids_are_unique() {
        let (_engine, handle) = SessionEngine::new(SessionPolicy::default(), Arc::new(MemorySessionStore::new()));
        let other = handle.clone();
        let first = handle.next_conn_id();
        assert_ne!(first, other.next_conn_id());
        assert!(first > 0);
    }
}
