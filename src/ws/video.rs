use moka::sync::Cache;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::models::VideoParticipant;
use crate::ws::connctx::ConnId;

/// A peer announced into a session's video mesh.
/// `peer_id` is opaque and issued by the client's media layer.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPeer {
    pub peer_id: String,
    pub user_id: String,
    pub display_name: String,
    pub conn_id: ConnId,
}

impl VideoPeer {
    pub fn participant(&self) -> VideoParticipant {
        VideoParticipant {
            user_id: self.user_id.clone(),
            peer_id: self.peer_id.clone(),
            name: self.display_name.clone(),
        }
    }
}

/// Result of announcing a peer
#[derive(Debug, Default)]
pub struct Announcement {
    /// Reachable peers the announcer should call
    pub existing: Vec<VideoParticipant>,
    /// Earlier peers of the same user, now withdrawn
    pub replaced: Vec<VideoPeer>,
}

/// Peer discovery for the mesh video channel.
///
/// Peers reported unreachable go into a stale set that expires on its own,
/// so a user who comes back under a new peer id is picked up again.
pub struct VideoSignaling {
    sessions: HashMap<String, Vec<VideoPeer>>,
    stale: Cache<(String, String), Instant>,
}

impl VideoSignaling {
    pub fn new(stale_ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            stale: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(stale_ttl)
                .build(),
        }
    }

    pub fn announce(&mut self, session_id: &str, peer: VideoPeer) -> Announcement {
        // An announcement proves the peer id is reachable again
        self.stale.invalidate(&(session_id.to_string(), peer.peer_id.clone()));

        let peers = self.sessions.entry(session_id.to_string()).or_default();
        let mut replaced = Vec::new();
        peers.retain(|p| {
            let same_user = !peer.user_id.is_empty() && p.user_id == peer.user_id;
            if p.peer_id == peer.peer_id || same_user {
                replaced.push(p.clone());
                false
            } else {
                true
            }
        });
        replaced.retain(|p| p.peer_id != peer.peer_id);

        let candidates: Vec<VideoPeer> = peers.clone();
        peers.push(peer);

        let existing = candidates
            .iter()
            .filter(|p| !self.is_stale(session_id, &p.peer_id))
            .map(VideoPeer::participant)
            .collect();

        Announcement { existing, replaced }
    }

    pub fn withdraw(&mut self, session_id: &str, peer_id: &str) -> Option<VideoPeer> {
        let peers = self.sessions.get_mut(session_id)?;
        let index = peers.iter().position(|p| p.peer_id == peer_id)?;
        let peer = peers.remove(index);
        if peers.is_empty() {
            self.sessions.remove(session_id);
        }
        Some(peer)
    }

    /// Withdraw every peer announced over `conn_id`
    pub fn withdraw_conn(&mut self, conn_id: ConnId) -> Vec<(String, VideoPeer)> {
        let mut withdrawn = Vec::new();
        self.sessions.retain(|session_id, peers| {
            peers.retain(|p| {
                if p.conn_id == conn_id {
                    withdrawn.push((session_id.clone(), p.clone()));
                    false
                } else {
                    true
                }
            });
            !peers.is_empty()
        });
        withdrawn
    }

    /// Record that a media connection to `peer_id` failed as unavailable
    pub fn mark_stale(&self, session_id: &str, peer_id: &str) {
        info!("Marking video peer {} in session {} as stale", peer_id, session_id);
        self.stale.insert((session_id.to_string(), peer_id.to_string()), Instant::now());
    }

    pub fn is_stale(&self, session_id: &str, peer_id: &str) -> bool {
        self.stale.get(&(session_id.to_string(), peer_id.to_string())).is_some()
    }

    /// Reachable peers of the session, leaving out those owned by `excluding`
    pub fn peers(&self, session_id: &str, excluding: Option<ConnId>) -> Vec<VideoParticipant> {
        self.sessions
            .get(session_id)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| Some(p.conn_id) != excluding)
                    .filter(|p| !self.is_stale(session_id, &p.peer_id))
                    .map(VideoPeer::participant)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear_session(&mut self, session_id: &str) -> Vec<VideoPeer> {
        let peers = self.sessions.remove(session_id).unwrap_or_default();
        if !peers.is_empty() {
            debug!("Dropped {} video peers of session {}", peers.len(), session_id);
        }
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.values().map(|p| p.len()).sum()
    }
}
