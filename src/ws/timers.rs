use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::ws::engine::EngineCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Duration,
    Warning,
    Idle,
    DocumentFlush,
}

/// A scheduled engine callback. Dropping the handle cancels it.
///
/// The firing carries the handle id back to the engine, which ignores it
/// unless the same id is still stored for that session and kind.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        // Aborting a finished task is a no-op
        self.task.abort();
    }
}

/// Spawns timer tasks that post `TimerFired` back into the engine queue.
pub struct TimerScheduler {
    next_id: u64,
    commands: UnboundedSender<EngineCommand>,
}

impl TimerScheduler {
    pub fn new(commands: UnboundedSender<EngineCommand>) -> Self {
        Self { next_id: 0, commands }
    }

    pub fn commands(&self) -> UnboundedSender<EngineCommand> {
        self.commands.clone()
    }

    pub fn schedule(&mut self, session_id: &str, kind: TimerKind, deadline: Instant) -> TimerHandle {
        self.next_id += 1;
        let timer_id = self.next_id;
        let commands = self.commands.clone();
        let session_id = session_id.to_string();
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = commands.send(EngineCommand::TimerFired { session_id, kind, timer_id });
        });
        TimerHandle { id: timer_id, task }
    }
}
