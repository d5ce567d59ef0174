//! Tunnel Wire Protocol Definitions
//!
//! This crate defines the framed packet layer spoken between the bridge
//! server and the remote agent, the handshake verification value, and the
//! binary layout of tunneled HTTP requests and responses.

pub mod handshake;
pub mod packet;
pub mod payload;

pub use handshake::{verify_digest, VERIFY_DIGEST_LEN};
pub use packet::{read_packet, write_packet, Command, Packet, PacketError};
pub use payload::{PayloadError, TunneledRequest, TunneledResponse};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Version byte prefixed to every encoded HTTP payload
pub const WIRE_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
