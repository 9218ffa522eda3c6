mod io;
pub(crate) mod state;
pub mod supervisor;

pub use state::ProcessState;
pub use supervisor::{BridgeStatus, CapabilityCounts, ProcessSupervisor};
