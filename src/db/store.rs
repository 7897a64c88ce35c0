use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

use crate::models::{SessionPatch, SessionRecord, UsageMetric};

/// Errors raised by a durable store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable document store for session metadata and per-user usage metrics.
///
/// Only get/update-by-id semantics are needed. Nothing on the live path waits
/// for these calls; see [`WriteThrough`].
pub trait SessionStore: Send + Sync {
    /// Short backend name, reported by the readiness probe
    fn kind(&self) -> &'static str;

    fn get_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<SessionRecord>>;

    /// Upsert the fields set in `patch`
    fn update_session<'a>(&'a self, session_id: &'a str, patch: SessionPatch) -> StoreFuture<'a, ()>;

    fn increment_user_metric<'a>(
        &'a self,
        user_id: &'a str,
        metric: UsageMetric,
        amount: i64,
    ) -> StoreFuture<'a, ()>;
}

type LoadCallback = Box<dyn FnOnce(Result<Option<SessionRecord>, StoreError>) + Send>;

/// One queued store operation
enum StoreJob {
    Update { session_id: String, patch: SessionPatch },
    Metric { user_id: String, metric: UsageMetric },
    Load { session_id: String, done: LoadCallback },
}

/// Fire-and-forget persistence in front of a [`SessionStore`].
///
/// Jobs go to a single writer task and are applied in the order they were
/// queued, so later patches of a session always land after earlier ones.
/// Loads share the queue and observe every write queued before them.
/// Failures are only logged. In-memory state stays authoritative and there
/// is no retry.
pub struct WriteThrough {
    store: Arc<dyn SessionStore>,
    queue: OnceLock<UnboundedSender<StoreJob>>,
}

impl WriteThrough {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            queue: OnceLock::new(),
        }
    }

    pub fn update_session(&self, session_id: &str, patch: SessionPatch) {
        self.enqueue(StoreJob::Update {
            session_id: session_id.to_string(),
            patch,
        });
    }

    pub fn increment_metric(&self, user_id: &str, metric: UsageMetric) {
        if user_id.is_empty() {
            return;
        }
        self.enqueue(StoreJob::Metric {
            user_id: user_id.to_string(),
            metric,
        });
    }

    /// Read the stored session once every earlier write has been applied
    pub fn load_session<F>(&self, session_id: &str, done: F)
    where
        F: FnOnce(Result<Option<SessionRecord>, StoreError>) + Send + 'static,
    {
        self.enqueue(StoreJob::Load {
            session_id: session_id.to_string(),
            done: Box::new(done),
        });
    }

    fn enqueue(&self, job: StoreJob) {
        // The writer starts with the first job, inside the runtime
        let queue = self.queue.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(self.store.clone(), rx));
            tx
        });
        if queue.send(job).is_err() {
            error!("Store writer has stopped, dropping job");
        }
    }
}

async fn run_writer(store: Arc<dyn SessionStore>, mut jobs: UnboundedReceiver<StoreJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            StoreJob::Update { session_id, patch } => match store.update_session(&session_id, patch).await {
                Ok(()) => debug!("Persisted session {}", session_id),
                Err(e) => error!("Failed to persist session {}: {}", session_id, e),
            },
            StoreJob::Metric { user_id, metric } => {
                if let Err(e) = store.increment_user_metric(&user_id, metric, 1).await {
                    error!("Failed to record {} for user {}: {}", metric.as_str(), user_id, e);
                }
            }
            StoreJob::Load { session_id, done } => done(store.get_session(&session_id).await),
        }
    }
    debug!("Store writer finished");
}
