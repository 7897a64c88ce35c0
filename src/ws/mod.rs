pub mod connctx;
pub mod docctx;
pub mod engine;
pub mod lifecycle;
pub mod observers;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod timers;
pub mod video;
pub mod whiteboard;

pub use engine::{EngineCommand, EngineError, EngineHandle, EngineStats, SessionEngine};
pub use lifecycle::SessionPolicy;
pub use rooms::{Outbound, Outbox};
