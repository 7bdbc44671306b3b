//! Shared infrastructure: CLI arguments, error taxonomy, shutdown wiring,
//! and the central system state machine.

pub mod cli;
pub mod error;
pub mod shutdown;
pub mod state;

pub use cli::HubArgs;
pub use error::{HubError, HubResult};
pub use shutdown::{setup_shutdown, ShutdownReceiver, ShutdownSender};
pub use state::{StateMachine, StatePayload, SystemState, Transition};
