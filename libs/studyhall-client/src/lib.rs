//! Client connection manager for the studyhall realtime gateway.
//!
//! Owns exactly one live gateway connection per authenticated session,
//! mirrors the server's online-user broadcasts into a local watch channel,
//! and scopes feature-level listeners (open-conversation message delivery)
//! to guards that deregister on drop.

pub mod backoff;
pub mod config;
pub mod error;
pub mod manager;

pub use backoff::ReconnectPolicy;
pub use config::ClientConfig;
pub use error::ClientError;
pub use manager::{ConnectionState, GatewayClient, Subscription};
pub use studyhall_common::protocol::{DirectMessage, ServerEvent};
