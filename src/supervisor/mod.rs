//! Subprocess-backed JSON-RPC service supervisor
//!
//! - **Config**: builder and validation for one supervised tool
//! - **Service**: `ProcessSupervisor`, owning the child and its pending requests
//! - **Restart**: exponential backoff policy with a bounded budget
//! - **Stderr**: output classification and ready detection
//! - **Events** / **Status**: observability surfaces for the daemon

pub mod config;
pub mod error;
pub mod events;
pub mod restart;
pub mod service;
pub mod status;
pub mod stderr;

pub use config::SupervisorConfig;
pub use error::{SupervisorConfigError, SupervisorError};
pub use events::SupervisorEvent;
pub use service::ProcessSupervisor;
pub use status::StatusSnapshot;
