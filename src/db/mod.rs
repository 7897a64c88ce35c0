pub mod dbsession;
pub mod memory;
pub mod store;

use std::sync::Arc;
use tracing::{error, info, warn};

pub use dbsession::PgSessionStore;
pub use memory::MemorySessionStore;
pub use store::{SessionStore, StoreError, StoreFuture, WriteThrough};

/// Open the durable store named by the configuration.
///
/// Falls back to the in-memory store when no URL is configured or the
/// database cannot be reached, so live collaboration keeps working.
pub async fn open_store(db_url: Option<&str>) -> Arc<dyn SessionStore> {
    let Some(db_url) = db_url else {
        warn!("No database URL configured - session state will not survive a restart");
        return Arc::new(MemorySessionStore::new());
    };

    match PgSessionStore::connect(db_url).await {
        Ok(store) => {
            if let Err(e) = store.ensure_schema().await {
                error!("Failed to prepare session schema: {}", e);
            }
            info!("Database initialized successfully");
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            warn!("Falling back to in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    }
}
