//! Mail tool integration
//!
//! - **Client**: `MailToolClient` facade and `MailToolConfig`
//! - **Message**: decoding of tool text content into `MailMessage`

pub mod client;
pub mod message;

pub use client::{MailClientError, MailToolClient, MailToolConfig, SearchParams};
pub use message::MailMessage;
