//! Backhaul bridge server
//!
//! Accepts exactly one persistent agent connection on a private TCP port
//! and forwards every inbound HTTP(S) request to that agent over the
//! framed tunnel protocol, one exchange at a time.

pub mod agent;
pub mod bridge;
pub mod connection;
pub mod http;
pub mod server;
pub mod tls;

pub use bridge::{Bridge, BridgeError};
pub use connection::{ActiveTunnel, TunnelConnection};
pub use server::{BridgeServer, ServerConfig, ServerError, TlsConfig};
