//! TLS setup for the public HTTPS listener

use crate::server::{ServerError, TlsConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Build the acceptor from the configured certificate, key, and optional
/// client-CA pool
///
/// A configured client-CA pool makes client certificates possible but not
/// required; requests without one are still accepted.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    info!("Loading TLS certificate from: {}", tls.cert_path);
    let certs = load_certs(Path::new(&tls.cert_path))?;

    info!("Loading TLS private key from: {}", tls.key_path);
    let key = load_private_key(Path::new(&tls.key_path))?;

    let builder = match &tls.client_ca_path {
        Some(ca_path) => {
            info!("Loading client CA pool from: {}", ca_path);
            let mut roots = RootCertStore::empty();
            for cert in load_certs(Path::new(ca_path))? {
                roots
                    .add(cert)
                    .map_err(|e| ServerError::Tls(format!("Invalid client CA cert: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| ServerError::Tls(format!("Invalid client verifier: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load TLS certificates from PEM files
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("Failed to parse certs: {}", e)))
}

/// Load private key from PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| ServerError::Tls("No private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file_is_tls_error() {
        let tls = TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
            client_ca_path: None,
        };

        let err = match build_acceptor(&tls) {
            Ok(_) => panic!("expected build_acceptor to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, ServerError::Tls(_)));
    }
}
