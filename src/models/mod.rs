pub mod diagnostics;
pub mod error;
pub mod health;
pub mod messages;
pub mod participant;
pub mod ready;
pub mod session;
pub mod timing;

pub use diagnostics::*;
pub use error::*;
pub use health::*;
pub use messages::*;
pub use participant::*;
pub use ready::*;
pub use session::*;
pub use timing::*;
