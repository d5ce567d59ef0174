//! Framed packet layer for the tunnel stream

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Packet command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Handshake: agent presents the verification digest
    Verify = 1,
    /// Handshake accepted, connection is now the active tunnel
    VerifyOk = 2,
    /// Handshake rejected, stream will be closed
    VerifyFailed = 3,
    /// A tunneled HTTP request, server to agent
    Request = 4,
    /// A tunneled HTTP response, agent to server
    Response = 5,
    /// Exchange failed on the agent side; payload is a UTF-8 message
    Error = 6,
    /// Liveness probe, carries no payload
    Ping = 7,
}

impl TryFrom<u16> for Command {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, PacketError> {
        match value {
            1 => Ok(Command::Verify),
            2 => Ok(Command::VerifyOk),
            3 => Ok(Command::VerifyFailed),
            4 => Ok(Command::Request),
            5 => Ok(Command::Response),
            6 => Ok(Command::Error),
            7 => Ok(Command::Ping),
            _ => Err(PacketError::InvalidCommand(value)),
        }
    }
}

/// Packet layer errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("invalid command code: {0}")]
    InvalidCommand(u16),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One framed unit on the tunnel stream
///
/// Wire layout: `command: u16 BE | length: u32 BE | payload bytes`.
/// A read either yields a complete packet or fails; there is no
/// partial-packet state observable to callers.
#[derive(Debug, Clone)]
pub struct Packet {
    pub command: Command,
    pub payload: Bytes,
}

impl Packet {
    /// Frame header size: command (2) + length (4) = 6 bytes
    pub const HEADER_SIZE: usize = 6;

    pub fn new(command: Command, payload: Bytes) -> Self {
        Self { command, payload }
    }

    pub fn verify(digest: impl Into<Bytes>) -> Self {
        Self::new(Command::Verify, digest.into())
    }

    pub fn verify_ok() -> Self {
        Self::new(Command::VerifyOk, Bytes::new())
    }

    pub fn verify_failed() -> Self {
        Self::new(Command::VerifyFailed, Bytes::new())
    }

    pub fn request(payload: impl Into<Bytes>) -> Self {
        Self::new(Command::Request, payload.into())
    }

    pub fn response(payload: impl Into<Bytes>) -> Self {
        Self::new(Command::Response, payload.into())
    }

    pub fn error(message: &str) -> Self {
        Self::new(Command::Error, Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping, Bytes::new())
    }

    /// Encode the packet into one contiguous frame
    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(PacketError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u16(self.command as u16);
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }
}

/// Read exactly one framed packet from the stream
///
/// Blocks until a complete frame is available. A malformed frame (unknown
/// command, oversized length) or a stream ending mid-frame is a hard error.
pub async fn read_packet<S>(stream: &mut S) -> Result<Packet, PacketError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; Packet::HEADER_SIZE];
    stream.read_exact(&mut header).await?;

    let command = u16::from_be_bytes([header[0], header[1]]);
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);

    if length > crate::MAX_FRAME_SIZE {
        return Err(PacketError::FrameTooLarge(length as usize));
    }
    let command = Command::try_from(command)?;

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;

    Ok(Packet::new(command, Bytes::from(payload)))
}

/// Write one framed packet to the stream
///
/// The frame is encoded into a single buffer and written with one
/// `write_all`, so a successful return means the whole frame went out.
/// Concurrent writers must serialize externally; this layer does not.
pub async fn write_packet<S>(stream: &mut S, packet: &Packet) -> Result<(), PacketError>
where
    S: AsyncWrite + Unpin,
{
    let frame = packet.encode()?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packet_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let packet = Packet::request(Bytes::from("hello world"));
        write_packet(&mut client, &packet).await.unwrap();

        let decoded = read_packet(&mut server).await.unwrap();
        assert_eq!(decoded.command, Command::Request);
        assert_eq!(decoded.payload, Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_empty_payload_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_packet(&mut client, &Packet::ping()).await.unwrap();

        let decoded = read_packet(&mut server).await.unwrap();
        assert_eq!(decoded.command, Command::Ping);
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_is_hard_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Command 99 does not exist
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0, 99, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, PacketError::InvalidCommand(99)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut header = vec![0u8, 1];
        header.extend_from_slice(&(crate::MAX_FRAME_SIZE + 1).to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, PacketError::FrameTooLarge(_)));
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let payload = Bytes::from(vec![0u8; crate::MAX_FRAME_SIZE as usize + 1]);
        let err = Packet::new(Command::Response, payload).encode().unwrap_err();
        assert!(matches!(err, PacketError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_read_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Header promises 10 payload bytes but only 3 arrive before EOF
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0, 5, 0, 0, 0, 10, 1, 2, 3])
            .await
            .unwrap();
        drop(client);

        let err = read_packet(&mut server).await.unwrap_err();
        assert!(matches!(err, PacketError::IoError(_)));
    }

    #[test]
    fn test_command_round_trip() {
        for command in [
            Command::Verify,
            Command::VerifyOk,
            Command::VerifyFailed,
            Command::Request,
            Command::Response,
            Command::Error,
            Command::Ping,
        ] {
            assert_eq!(Command::try_from(command as u16).unwrap(), command);
        }
    }
}
