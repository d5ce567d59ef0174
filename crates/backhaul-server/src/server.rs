//! Dual listener coordinator
//!
//! Owns the private agent TCP listener and the public HTTP(S) listener,
//! starts both, and performs ordered, idempotent shutdown of both plus
//! the active tunnel connection.

use crate::agent;
use crate::bridge::Bridge;
use crate::connection::ActiveTunnel;
use crate::http;
use crate::tls;
use backhaul_proto::{verify_digest, VERIFY_DIGEST_LEN};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Bound on the graceful HTTP drain during shutdown
pub const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default liveness probe interval for the active tunnel connection
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("server is already started")]
    AlreadyStarted,

    #[error("agent listener was never created")]
    NotStarted,
}

/// TLS configuration for the public listener
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    /// Optional CA pool for client certificates; presenting one stays
    /// optional even when the pool is configured
    pub client_ca_path: Option<String>,
}

/// Bridge server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Private TCP address the agent connects to
    pub agent_addr: SocketAddr,
    /// Public HTTP(S) address
    pub http_addr: SocketAddr,
    /// Shared secret the agent must prove knowledge of
    pub secret: String,
    pub tls: Option<TlsConfig>,
    pub keepalive_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_addr: "0.0.0.0:8024".parse().unwrap(),
            http_addr: "0.0.0.0:8080".parse().unwrap(),
            secret: String::new(),
            tls: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

struct Handles {
    agent_addr: SocketAddr,
    http_addr: SocketAddr,
    accept_token: CancellationToken,
    drain_token: CancellationToken,
    force_token: CancellationToken,
    agent_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
    connections: TaskTracker,
}

enum State {
    Idle,
    Running(Box<Handles>),
    Stopped,
}

/// The tunnel bridge server
pub struct BridgeServer {
    config: ServerConfig,
    active: ActiveTunnel,
    bridge: Arc<Bridge>,
    state: Mutex<State>,
}

impl BridgeServer {
    pub fn new(config: ServerConfig) -> Self {
        let active = ActiveTunnel::new();
        let bridge = Arc::new(Bridge::new(active.clone()));
        Self {
            config,
            active,
            bridge,
            state: Mutex::new(State::Idle),
        }
    }

    /// Bind both listeners and spawn the accept loops
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Idle) {
            return Err(ServerError::AlreadyStarted);
        }

        let agent_listener = bind(self.config.agent_addr).await?;
        let agent_addr = agent_listener.local_addr()?;

        let http_listener = bind(self.config.http_addr).await?;
        let http_addr = http_listener.local_addr()?;

        let acceptor = match &self.config.tls {
            Some(tls_config) => {
                // Initialize the Rustls crypto provider (required before building TLS config)
                let _ = rustls::crypto::ring::default_provider().install_default();
                Some(tls::build_acceptor(tls_config)?)
            }
            None => None,
        };

        info!("agent listener on {}", agent_addr);
        if acceptor.is_some() {
            info!("HTTPS listener on {}", http_addr);
        } else {
            info!("HTTP listener on {}", http_addr);
        }

        let accept_token = CancellationToken::new();
        let drain_token = CancellationToken::new();
        let force_token = CancellationToken::new();
        let connections = TaskTracker::new();

        let digest = Arc::new(verify_digest(&self.config.secret));
        let agent_task = tokio::spawn(run_agent_loop(
            agent_listener,
            self.active.clone(),
            digest,
            self.config.keepalive_interval,
            accept_token.clone(),
        ));

        let http_task = tokio::spawn(run_http_loop(
            http_listener,
            acceptor,
            self.bridge.clone(),
            connections.clone(),
            drain_token.clone(),
            force_token.clone(),
        ));

        *state = State::Running(Box::new(Handles {
            agent_addr,
            http_addr,
            accept_token,
            drain_token,
            force_token,
            agent_task,
            http_task,
            connections,
        }));
        Ok(())
    }

    /// Ordered, idempotent shutdown
    ///
    /// Stops accepting new work, closes the active tunnel connection,
    /// drains the HTTP server within [`HTTP_DRAIN_TIMEOUT`] then forces
    /// it closed, and finally closes the agent listener. Calling it again
    /// after a successful shutdown is a no-op; calling it before
    /// `start()` reports a configuration error.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        let handles = match std::mem::replace(&mut *state, State::Stopped) {
            State::Idle => {
                *state = State::Idle;
                return Err(ServerError::NotStarted);
            }
            State::Stopped => return Ok(()),
            State::Running(handles) => handles,
        };

        info!("shutting down bridge server");

        if let Some(conn) = self.active.take().await {
            info!("closing active agent connection from {}", conn.peer_addr());
            conn.close().await;
        }

        handles.drain_token.cancel();
        if let Err(e) = handles.http_task.await {
            warn!("HTTP accept loop ended abnormally: {}", e);
        }
        if timeout(HTTP_DRAIN_TIMEOUT, handles.connections.wait())
            .await
            .is_err()
        {
            warn!("HTTP drain timed out, forcing connections closed");
            handles.force_token.cancel();
            if timeout(Duration::from_secs(1), handles.connections.wait())
                .await
                .is_err()
            {
                warn!("some HTTP connections did not close cleanly");
            }
        }

        handles.accept_token.cancel();
        if let Err(e) = handles.agent_task.await {
            warn!("agent accept loop ended abnormally: {}", e);
        }

        info!("bridge server stopped");
        Ok(())
    }

    /// Bound agent listener address, once started
    pub async fn agent_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Running(handles) => Some(handles.agent_addr),
            _ => None,
        }
    }

    /// Bound HTTP listener address, once started
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Running(handles) => Some(handles.http_addr),
            _ => None,
        }
    }

    /// Whether an agent currently holds the active tunnel connection
    pub async fn agent_connected(&self) -> bool {
        self.active.is_connected().await
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| {
        let port = addr.port();
        let address = addr.ip().to_string();
        let reason = e.to_string();
        ServerError::BindError {
            address,
            port,
            reason,
        }
    })
}

async fn run_agent_loop(
    listener: TcpListener,
    active: ActiveTunnel,
    digest: Arc<[u8; VERIFY_DIGEST_LEN]>,
    keepalive_interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("accepted tunnel connection from {}", peer_addr);
                    tokio::spawn(agent::handle_agent(
                        stream,
                        peer_addr,
                        active.clone(),
                        digest.clone(),
                        keepalive_interval,
                    ));
                }
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                }
            },
        }
    }
    info!("agent listener stopped");
}

async fn run_http_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    bridge: Arc<Bridge>,
    connections: TaskTracker,
    drain: CancellationToken,
    force: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = drain.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                        continue;
                    }
                };
                debug!("accepted HTTP connection from {}", peer_addr);

                let bridge = bridge.clone();
                let acceptor = acceptor.clone();
                let drain = drain.clone();
                let force = force.clone();
                connections.spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                serve_connection(TokioIo::new(tls_stream), bridge, drain, force)
                                    .await;
                            }
                            Err(e) => {
                                warn!("TLS handshake failed from {}: {}", peer_addr, e);
                            }
                        },
                        None => {
                            serve_connection(TokioIo::new(stream), bridge, drain, force).await;
                        }
                    }
                });
            }
        }
    }
    connections.close();
    info!("HTTP listener stopped");
}

async fn serve_connection<I>(
    io: I,
    bridge: Arc<Bridge>,
    drain: CancellationToken,
    force: CancellationToken,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| http::proxy(req, bridge.clone()));
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => Some(res),
        _ = drain.cancelled() => None,
    };

    let result = match result {
        Some(res) => res,
        None => {
            // In-flight requests get the drain window before the plug is
            // pulled for good
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                res = conn.as_mut() => res,
                _ = force.cancelled() => return,
            }
        }
    };

    if let Err(e) = result {
        debug!("HTTP connection error: {}", e);
    }
}
