//! Secure channel upgrade
//!
//! Wraps an authenticated TCP stream in a server-side TLS session. The
//! certificate chain and key come from PEM files; a single combined
//! `server.pem` works for both.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Errors while building the TLS acceptor
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read certificates from {path}: {message}")]
    Certificate { path: PathBuf, message: String },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("failed to read private key from {path}: {message}")]
    PrivateKey { path: PathBuf, message: String },
    #[error("invalid TLS configuration")]
    Config(#[from] rustls::Error),
}

/// Build a TLS acceptor from PEM files
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certificates(cert_file)?;
    let key = load_private_key(key_file)?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Perform the server-side handshake on an authenticated stream
pub async fn upgrade(acceptor: &TlsAcceptor, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
    acceptor.accept(stream).await
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TlsError::Certificate {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsError::PrivateKey {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
