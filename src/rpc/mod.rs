//! Line-delimited JSON-RPC plumbing
//!
//! - **Framing**: reassembles newline-terminated messages from arbitrary chunks
//! - **Protocol**: message types, id generation, inbound dispatch
//! - **Registry**: pending-request bookkeeping with per-request timeouts
//! - **Error**: per-request failure taxonomy

pub mod error;
pub mod framing;
pub mod protocol;
pub mod registry;

pub use error::RpcError;
pub use framing::LineFramer;
pub use protocol::{DispatchOutcome, JsonRpcRequest, dispatch_line, generate_request_id};
pub use registry::RequestRegistry;
