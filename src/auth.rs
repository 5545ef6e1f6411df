//! Challenge-response authentication
//!
//! Runs over the raw TCP stream before the TLS upgrade:
//!
//! ```text
//! Server                                   Client
//!   |  -- nonce (32 random bytes) ------->   |
//!   |  <-- SHA-256(nonce || passphrase) --   |
//! ```
//!
//! Any answer other than the exact expected digest is a rejection. A short
//! answer, end-of-stream, or silence past the timeout are rejections too, not
//! errors.

use std::fmt;
use std::io;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of both the nonce and the expected response
pub const CHALLENGE_LEN: usize = 32;

/// Single-use random challenge
pub type Nonce = [u8; CHALLENGE_LEN];

/// Why a client failed the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Full-length response with the wrong digest
    Mismatch,
    /// Stream ended before a full response arrived
    ShortResponse,
    /// No response within the timeout
    Timeout,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Mismatch => "response mismatch",
            RejectReason::ShortResponse => "short response",
            RejectReason::Timeout => "response timeout",
        };
        write!(f, "{}", s)
    }
}

/// Result of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// Draw a fresh nonce from the OS random source
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// `SHA-256(nonce || passphrase)`
pub fn expected_response(nonce: &Nonce, passphrase: &[u8]) -> [u8; CHALLENGE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(passphrase);
    hasher.finalize().into()
}

/// Constant-time check of a client response; wrong lengths never match
pub fn verify_response(nonce: &Nonce, passphrase: &[u8], response: &[u8]) -> bool {
    let expected = expected_response(nonce, passphrase);
    response.len() == CHALLENGE_LEN && bool::from(expected.as_slice().ct_eq(response))
}

/// Run the server side of the handshake on a raw stream
pub async fn challenge<S>(
    stream: &mut S,
    passphrase: &[u8],
    response_timeout: Duration,
) -> io::Result<AuthOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = generate_nonce();
    stream.write_all(&nonce).await?;
    stream.flush().await?;

    let mut response = [0u8; CHALLENGE_LEN];
    match tokio::time::timeout(response_timeout, stream.read_exact(&mut response)).await {
        Err(_) => return Ok(AuthOutcome::Rejected(RejectReason::Timeout)),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(AuthOutcome::Rejected(RejectReason::ShortResponse));
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(_)) => {}
    }

    if verify_response(&nonce, passphrase, &response) {
        Ok(AuthOutcome::Accepted)
    } else {
        Ok(AuthOutcome::Rejected(RejectReason::Mismatch))
    }
}
