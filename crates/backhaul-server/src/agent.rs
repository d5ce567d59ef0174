//! Agent connection lifecycle
//!
//! One lifecycle task runs per accepted tunnel stream: verification
//! handshake, single-active-agent replacement, then the liveness probe
//! that clears the shared reference when the stream dies.

use crate::connection::{ActiveTunnel, TunnelConnection};
use backhaul_proto::{read_packet, write_packet, Command, Packet, VERIFY_DIGEST_LEN};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The first packet must arrive within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake failures; all of them are connection-fatal
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no verify packet within the handshake window")]
    Timeout,

    #[error("first command was {0:?}, expected Verify")]
    WrongCommand(Command),

    #[error("verification digest mismatch")]
    DigestMismatch,

    #[error("packet error: {0}")]
    Packet(#[from] backhaul_proto::PacketError),
}

/// Run the lifecycle for one accepted tunnel stream
///
/// On handshake success the connection replaces any previously active one
/// and this task stays alive as its liveness watch until the stream
/// becomes unusable.
pub async fn handle_agent(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    active: ActiveTunnel,
    verify_digest: Arc<[u8; VERIFY_DIGEST_LEN]>,
    keepalive_interval: Duration,
) {
    if let Err(e) = handshake(&mut stream, &verify_digest).await {
        warn!("rejecting agent connection from {}: {}", peer_addr, e);
        // Best effort; the peer may already be gone
        let _ = write_packet(&mut stream, &Packet::verify_failed()).await;
        return;
    }

    // Last writer wins: the previous agent is closed and dereferenced
    // before the new connection becomes active.
    if let Some(previous) = active.take().await {
        warn!(
            "agent already connected, disconnecting previous one from {}",
            previous.peer_addr()
        );
        previous.close().await;
    }

    if let Err(e) = write_packet(&mut stream, &Packet::verify_ok()).await {
        warn!("failed to confirm handshake with {}: {}", peer_addr, e);
        return;
    }

    info!("agent connected from {}", peer_addr);
    let conn = Arc::new(TunnelConnection::new(stream, peer_addr));
    active.set(conn.clone()).await;

    liveness_watch(&conn, keepalive_interval).await;

    if active.clear_if(&conn).await {
        info!("agent connection from {} lost", peer_addr);
    }
    conn.close().await;
}

async fn handshake(
    stream: &mut TcpStream,
    verify_digest: &[u8; VERIFY_DIGEST_LEN],
) -> Result<(), HandshakeError> {
    let packet = match timeout(HANDSHAKE_TIMEOUT, read_packet(stream)).await {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout),
    };

    if packet.command != Command::Verify {
        return Err(HandshakeError::WrongCommand(packet.command));
    }
    if packet.payload.as_ref() != verify_digest {
        return Err(HandshakeError::DigestMismatch);
    }
    Ok(())
}

/// Probe the connection until it becomes unusable
///
/// The probe writes a `Ping` frame on each tick, sharing the frame-level
/// write mutex with the bridge. It never touches the read half, so it
/// cannot consume a response belonging to an in-flight exchange.
async fn liveness_watch(conn: &Arc<TunnelConnection>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = conn.write_packet(&Packet::ping()).await {
            debug!(
                "liveness probe to {} failed: {}",
                conn.peer_addr(),
                e
            );
            break;
        }
    }
}
