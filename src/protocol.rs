//! Line-oriented parts of the wire protocol
//!
//! - program upload: newline-terminated lines ending with [`CODE_TERMINATOR`]
//! - result: a single [`StatusLine`] after the program exits

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::sandbox::ExecutionStatus;

/// Line that ends the program upload
pub const CODE_TERMINATOR: &[u8] = b"END CODE\n";

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("failed to read program text")]
    Io(#[from] io::Error),
    #[error("program text exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("program text is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Read the program text from the channel.
///
/// Stops at the terminator line (excluded) or at end-of-stream, whichever
/// comes first. Bytes after the terminator stay buffered in `reader`.
pub async fn read_code<R>(reader: &mut R, max_bytes: usize) -> Result<String, ReceiveError>
where
    R: AsyncBufRead + Unpin,
{
    let mut code = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        // one byte of slack so an oversized line is detected, not truncated
        let budget = (max_bytes - code.len() + CODE_TERMINATOR.len() + 1) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 || line == CODE_TERMINATOR {
            break;
        }
        if code.len() + line.len() > max_bytes {
            return Err(ReceiveError::TooLarge { limit: max_bytes });
        }
        code.extend_from_slice(&line);
    }

    Ok(String::from_utf8(code)?)
}

/// Final line written to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLine {
    /// Program exited with status zero
    Ok,
    /// Program ran past its CPU budget
    ResourceLimitExceeded,
    /// Program failed with the given raw status
    Failed(i32),
    /// The server could not run the program
    Exception,
}

impl StatusLine {
    /// Wire form including the trailing newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLine::Ok => write!(f, "OK"),
            StatusLine::ResourceLimitExceeded => write!(f, "ERROR resource_limit_exceeded"),
            StatusLine::Failed(status) => write!(f, "ERROR {}", status),
            StatusLine::Exception => write!(f, "ERROR exception"),
        }
    }
}

impl From<ExecutionStatus> for StatusLine {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => StatusLine::Ok,
            ExecutionStatus::ResourceLimitExceeded => StatusLine::ResourceLimitExceeded,
            ExecutionStatus::Failed(raw) => StatusLine::Failed(raw),
        }
    }
}
