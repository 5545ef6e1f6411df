use std::io;

use thiserror::Error;

use crate::protocol::ReceiveError;
use crate::sandbox::SandboxError;

/// Anything that ends a session early
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to exchange challenge")]
    Auth(#[source] io::Error),
    #[error("TLS handshake failed")]
    Upgrade(#[source] io::Error),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("stream bridge failed")]
    Bridge(#[source] io::Error),
    #[error("failed to report result")]
    Report(#[source] io::Error),
}
