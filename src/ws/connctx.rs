use std::collections::HashMap;
use tracing::debug;

pub type ConnId = u64;

/// What the engine knows about one live transport connection
#[derive(Clone, Debug, PartialEq)]
pub struct ConnCtx {
    pub conn_id: ConnId,
    pub client_id: String,
    pub user_id: Option<String>,
}

/// Maps a stable client identity to its one authoritative connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_client: HashMap<String, ConnId>,
    conns: HashMap<ConnId, ConnCtx>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ctx` the authoritative connection for its client id.
    ///
    /// Returns the connection it replaced, which the caller must close.
    pub fn register(&mut self, ctx: ConnCtx) -> Option<ConnId> {
        let prior = self.by_client.insert(ctx.client_id.clone(), ctx.conn_id);
        self.conns.insert(ctx.conn_id, ctx);
        prior
    }

    /// Forget `conn_id`. The client mapping is only removed while `conn_id`
    /// is still the registered connection, so a late disconnect from a
    /// superseded socket cannot evict its replacement.
    ///
    /// Returns true when the connection was authoritative.
    pub fn unregister(&mut self, client_id: &str, conn_id: ConnId) -> bool {
        self.conns.remove(&conn_id);
        if self.by_client.get(client_id) == Some(&conn_id) {
            self.by_client.remove(client_id);
            true
        } else {
            debug!("Connection {} for client {} was already superseded", conn_id, client_id);
            false
        }
    }

    pub fn get(&self, conn_id: ConnId) -> Option<&ConnCtx> {
        self.conns.get(&conn_id)
    }

    pub fn current(&self, client_id: &str) -> Option<ConnId> {
        self.by_client.get(client_id).copied()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
