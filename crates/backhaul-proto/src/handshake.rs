//! Handshake verification value
//!
//! The first packet on a new tunnel connection must be `Verify` carrying
//! the SHA-256 digest of the shared secret. Both sides derive the digest
//! from the secret configured out-of-band, so the secret itself never
//! crosses the wire.

use sha2::{Digest, Sha256};

/// Length of the verification digest carried in a `Verify` packet
pub const VERIFY_DIGEST_LEN: usize = 32;

/// Derive the fixed-length verification value from the shared secret
pub fn verify_digest(secret: &str) -> [u8; VERIFY_DIGEST_LEN] {
    Sha256::digest(secret.as_bytes()).into()
}
