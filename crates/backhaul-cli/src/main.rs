//! Backhaul bridge server CLI
//!
//! Exposes a public HTTP(S) endpoint whose traffic is served by a single
//! remote agent connected over the private tunnel port.

use backhaul_server::{BridgeServer, ServerConfig, TlsConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "backhaul",
    about = "Reverse-tunnel bridge server",
    version,
    long_about = "Accepts one persistent agent connection on the tunnel port and\n\
                  forwards every inbound HTTP(S) request to it, so a service\n\
                  behind NAT can serve public traffic without an inbound port.\n\n\
                  Examples:\n  \
                  # Plain HTTP bridge\n  \
                  backhaul --tunnel-addr 0.0.0.0:8024 --http-addr 0.0.0.0:8080 --secret swordfish\n\n  \
                  # HTTPS with an optional client CA pool\n  \
                  backhaul \\\n    \
                  --tunnel-addr 0.0.0.0:8024 \\\n    \
                  --http-addr 0.0.0.0:443 \\\n    \
                  --tls-cert server.crt --tls-key server.key \\\n    \
                  --client-ca clients.pem \\\n    \
                  --secret swordfish"
)]
struct Cli {
    /// Private address the agent connects to
    #[arg(
        short = 't',
        long,
        default_value = "0.0.0.0:8024",
        env = "BACKHAUL_TUNNEL_ADDR"
    )]
    tunnel_addr: SocketAddr,

    /// Public HTTP(S) address
    #[arg(
        short = 'l',
        long,
        default_value = "0.0.0.0:8080",
        env = "BACKHAUL_HTTP_ADDR"
    )]
    http_addr: SocketAddr,

    /// Shared secret the agent must present during the handshake
    #[arg(long, env = "BACKHAUL_SECRET")]
    secret: String,

    /// TLS certificate path; enables HTTPS when set together with --tls-key
    #[arg(long, env = "BACKHAUL_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<String>,

    /// TLS key path
    #[arg(long, env = "BACKHAUL_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<String>,

    /// Optional CA pool for client certificates (not required of clients)
    #[arg(long, env = "BACKHAUL_CLIENT_CA", requires = "tls_cert")]
    client_ca: Option<String>,

    /// Liveness probe interval for the agent connection, in seconds
    #[arg(long, default_value_t = 5)]
    keepalive_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "backhaul_server=debug,backhaul_cli=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "backhaul_server=info,backhaul_cli=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting Backhaul bridge server");
    tracing::info!("Tunnel: {}", cli.tunnel_addr);
    tracing::info!("HTTP: {}", cli.http_addr);

    let tls = match (cli.tls_cert, cli.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            tracing::info!("✅ TLS enabled");
            if cli.client_ca.is_some() {
                tracing::info!("Client CA pool configured (client certs optional)");
            }
            Some(TlsConfig {
                cert_path,
                key_path,
                client_ca_path: cli.client_ca,
            })
        }
        _ => {
            tracing::warn!("⚠️  TLS disabled - serving plain HTTP");
            None
        }
    };

    let config = ServerConfig {
        agent_addr: cli.tunnel_addr,
        http_addr: cli.http_addr,
        secret: cli.secret,
        tls,
        keepalive_interval: Duration::from_secs(cli.keepalive_secs),
    };

    let server = BridgeServer::new(config);
    server.start().await?;

    // Wait for shutdown signal (SIGINT from Ctrl+C or SIGTERM from pkill/systemd)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("📢 Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("📢 Received SIGINT (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    server.shutdown().await?;
    tracing::info!("✅ Bridge server stopped");

    Ok(())
}
