//! Network helpers
//!
//! - **Negotiator**: binds a listening port, walking alternates on conflict

pub mod negotiator;

pub use negotiator::{NegotiationError, PortNegotiator, PortResolution, default_alternates};
