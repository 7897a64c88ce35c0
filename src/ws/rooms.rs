use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::models::ServerEvent;
use crate::ws::connctx::ConnId;

/// Instruction for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close(String),
}

pub type Outbox = UnboundedSender<Outbound>;

pub fn session_room(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn video_room(session_id: &str) -> String {
    format!("video:{}", session_id)
}

pub fn whiteboard_room(session_id: &str) -> String {
    format!("whiteboard:{}", session_id)
}

/// In-process room/broadcast primitive.
///
/// Each connection owns an unbounded outbox drained by its socket writer, so
/// emitting never blocks the engine.
#[derive(Debug, Default)]
pub struct RoomHub {
    outboxes: HashMap<ConnId, Outbox>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, conn_id: ConnId, outbox: Outbox) {
        self.outboxes.insert(conn_id, outbox);
    }

    /// Drop the connection's outbox and every room membership.
    /// Returns the rooms it was in.
    pub fn detach(&mut self, conn_id: ConnId) -> Vec<String> {
        self.outboxes.remove(&conn_id);
        let mut left = Vec::new();
        self.rooms.retain(|room, members| {
            if members.remove(&conn_id) {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    pub fn join(&mut self, room: &str, conn_id: ConnId) {
        self.rooms.entry(room.to_string()).or_default().insert(conn_id);
    }

    pub fn leave(&mut self, room: &str, conn_id: ConnId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    pub fn close_room(&mut self, room: &str) -> Vec<ConnId> {
        self.rooms.remove(room).map(|m| m.into_iter().collect()).unwrap_or_default()
    }

    pub fn is_member(&self, room: &str, conn_id: ConnId) -> bool {
        self.rooms.get(room).is_some_and(|m| m.contains(&conn_id))
    }

    pub fn members(&self, room: &str) -> BTreeSet<ConnId> {
        self.rooms.get(room).map(|m| m.iter().copied().collect()).unwrap_or_default()
    }

    pub fn emit(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        self.send(conn_id, Outbound::Event(event))
    }

    /// Send to every member of `room` except `except`. Returns the number reached.
    pub fn broadcast(&self, room: &str, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter(|conn_id| Some(**conn_id) != except)
            .filter(|conn_id| self.emit(**conn_id, event.clone()))
            .count()
    }

    pub fn emit_all<I>(&self, conns: I, event: &ServerEvent) -> usize
    where
        I: IntoIterator<Item = ConnId>,
    {
        conns.into_iter().filter(|conn_id| self.emit(*conn_id, event.clone())).count()
    }

    /// Ask the connection's writer to close the socket
    pub fn close(&self, conn_id: ConnId, reason: &str) -> bool {
        self.send(conn_id, Outbound::Close(reason.to_string()))
    }

    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    fn send(&self, conn_id: ConnId, outbound: Outbound) -> bool {
        match self.outboxes.get(&conn_id) {
            Some(outbox) => {
                if outbox.send(outbound).is_err() {
                    debug!("Outbox for connection {} is closed", conn_id);
                    return false;
                }
                true
            }
            None => false,
        }
    }
}
