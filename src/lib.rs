pub mod api;
pub mod bridge;
pub mod config;
pub(crate) mod error;
pub mod mcp;

pub use bridge::{BridgeStatus, ProcessState, ProcessSupervisor};
pub use error::{BridgeError, Result};
