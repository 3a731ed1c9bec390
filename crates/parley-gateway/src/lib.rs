pub mod connection;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod presence;
pub mod registry;
pub mod sweeper;

pub use error::{GatewayError, Result};
pub use handler::{Gateway, SessionHandler, SessionState};
pub use registry::{GroupName, SessionId};
