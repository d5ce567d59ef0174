//! Tunnel connection state

use backhaul_proto::{read_packet, write_packet, Packet, PacketError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};

/// The single logical channel to the remote agent
///
/// The read half is consumed only by the bridge's response reads; the
/// write half is shared between bridge request writes and the liveness
/// probe, serialized by its mutex so frames never interleave.
pub struct TunnelConnection {
    peer_addr: SocketAddr,
    created_at: Instant,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl TunnelConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer_addr,
            created_at: Instant::now(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Write one whole frame to the agent
    pub async fn write_packet(&self, packet: &Packet) -> Result<(), PacketError> {
        let mut writer = self.writer.lock().await;
        write_packet(&mut *writer, packet).await
    }

    /// Read the next frame from the agent
    pub async fn read_packet(&self) -> Result<Packet, PacketError> {
        let mut reader = self.reader.lock().await;
        read_packet(&mut *reader).await
    }

    /// Close the connection; safe to call more than once
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Lock-guarded reference to the single active tunnel connection
///
/// Every mutator (verify success, replacement, liveness failure, server
/// shutdown) goes through these accessors; at most one connection is
/// active at any time.
#[derive(Clone, Default)]
pub struct ActiveTunnel {
    inner: Arc<RwLock<Option<Arc<TunnelConnection>>>>,
}

impl ActiveTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current active connection, if any
    pub async fn get(&self) -> Option<Arc<TunnelConnection>> {
        self.inner.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Install a new active connection
    pub async fn set(&self, conn: Arc<TunnelConnection>) {
        *self.inner.write().await = Some(conn);
    }

    /// Remove and return the active connection
    pub async fn take(&self) -> Option<Arc<TunnelConnection>> {
        self.inner.write().await.take()
    }

    /// Clear the reference only if it still points at `conn`
    ///
    /// A liveness task for a replaced connection must not drop the
    /// connection that superseded it.
    pub async fn clear_if(&self, conn: &Arc<TunnelConnection>) -> bool {
        let mut guard = self.inner.write().await;
        match guard.as_ref() {
            Some(current) if Arc::ptr_eq(current, conn) => {
                *guard = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Arc<TunnelConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer_addr) = listener.accept().await.unwrap();
        (Arc::new(TunnelConnection::new(server, peer_addr)), client)
    }

    #[tokio::test]
    async fn test_active_tunnel_starts_empty() {
        let active = ActiveTunnel::new();
        assert!(active.get().await.is_none());
        assert!(!active.is_connected().await);
    }

    #[tokio::test]
    async fn test_set_take() {
        let active = ActiveTunnel::new();
        let (conn, _client) = connected_pair().await;

        active.set(conn.clone()).await;
        assert!(active.is_connected().await);

        let taken = active.take().await.unwrap();
        assert!(Arc::ptr_eq(&taken, &conn));
        assert!(!active.is_connected().await);
    }

    #[tokio::test]
    async fn test_clear_if_ignores_stale_connection() {
        let active = ActiveTunnel::new();
        let (old, _c1) = connected_pair().await;
        let (new, _c2) = connected_pair().await;

        active.set(old.clone()).await;
        active.set(new.clone()).await;

        // The stale handle must not clear the newer connection
        assert!(!active.clear_if(&old).await);
        assert!(active.is_connected().await);

        assert!(active.clear_if(&new).await);
        assert!(!active.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _client) = connected_pair().await;
        conn.close().await;
        conn.close().await;
    }
}
