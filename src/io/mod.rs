//! I/O layer - Generic abstractions for process management and transport
//!
//! This module provides fundamental I/O abstractions that are not specific to any protocol:
//!
//! - **Transport**: Pure I/O layer moving raw text over the child's stdio
//! - **Process**: External process lifecycle management with stdio integration
//!
//! The RPC layer (`crate::rpc`) and the supervisor build on top of these.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    StderrMonitor, StopMode,
};
pub use transport::{StdinWriter, StdoutReader, WriteOutcome};
