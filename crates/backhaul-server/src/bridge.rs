//! Request/response bridge
//!
//! Serializes every inbound HTTP request onto the tunnel stream. One
//! global lock turns the duplex byte stream into a strict half-duplex
//! request/response protocol: the write and the following read form one
//! atomic turn, so no sequence numbers are needed and exchanges can never
//! interleave on the wire.

use crate::connection::ActiveTunnel;
use backhaul_proto::{Command, Packet, PacketError, PayloadError, TunneledRequest, TunneledResponse};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Bridge failures; all of them are request-fatal only
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("agent not connected")]
    AgentNotConnected,

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("agent reported error: {0}")]
    Agent(String),
}

/// The per-request critical section shared by all HTTP handling
pub struct Bridge {
    active: ActiveTunnel,
    exchange_lock: Mutex<()>,
}

impl Bridge {
    pub fn new(active: ActiveTunnel) -> Self {
        Self {
            active,
            exchange_lock: Mutex::new(()),
        }
    }

    /// Run one complete exchange against the active agent
    ///
    /// Fails immediately when no agent is connected; there is no queueing.
    /// A failure here never tears down the tunnel connection itself, that
    /// is the lifecycle's liveness watch's job.
    pub async fn exchange(
        &self,
        request: &TunneledRequest,
    ) -> Result<TunneledResponse, BridgeError> {
        let _turn = self.exchange_lock.lock().await;

        let conn = self
            .active
            .get()
            .await
            .ok_or(BridgeError::AgentNotConnected)?;

        let payload = request.encode()?;
        conn.write_packet(&Packet::request(payload)).await?;

        loop {
            let packet = conn.read_packet().await?;
            match packet.command {
                Command::Response => {
                    return Ok(TunneledResponse::decode(&packet.payload)?);
                }
                Command::Error => {
                    let message = String::from_utf8_lossy(&packet.payload).into_owned();
                    return Err(BridgeError::Agent(message));
                }
                other => {
                    debug!("ignoring {:?} packet during exchange", other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_without_agent_fails_immediately() {
        let bridge = Bridge::new(ActiveTunnel::new());
        let request = TunneledRequest {
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };

        let err = bridge.exchange(&request).await.unwrap_err();
        assert!(matches!(err, BridgeError::AgentNotConnected));
    }
}
