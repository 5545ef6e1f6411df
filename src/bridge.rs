//! Stream bridge between a client connection and a sandboxed child
//!
//! ```text
//!   client read half ──inbound──▶ child stdin
//!   client write half ◀─outbound── child stdout
//!         ▲
//!         └── status line (reporter, same lock)
//! ```
//!
//! Each direction runs in its own task. Reads return as soon as any bytes are
//! available and every chunk is flushed, so interactive programs see their
//! input and the client sees output without waiting for a full buffer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, Instrument, Span};

/// Client write half, shared by the outbound pump and the status reporter
pub type SharedWriter<W> = Arc<Mutex<W>>;

pub struct Bridge {
    inbound: JoinHandle<()>,
    outbound: Option<JoinHandle<()>>,
    faults: mpsc::Receiver<io::Error>,
}

impl Bridge {
    /// Start both pumps. Must be called from within a tokio runtime.
    pub fn start<R, W, I, O>(
        client_reader: R,
        client_writer: SharedWriter<W>,
        child_stdin: I,
        child_stdout: O,
        chunk_size: usize,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        I: AsyncWrite + Unpin + Send + 'static,
        O: AsyncRead + Unpin + Send + 'static,
    {
        // each pump reports at most one fault
        let (fault_tx, faults) = mpsc::channel(2);

        let tx = fault_tx.clone();
        let inbound = tokio::spawn(
            async move {
                match pump_inbound(client_reader, child_stdin, chunk_size).await {
                    Ok(bytes) => debug!("Client input finished after {} bytes", bytes),
                    Err(e) => {
                        let _ = tx.send(e).await;
                    }
                }
            }
            .instrument(Span::current()),
        );

        let tx = fault_tx;
        let outbound = tokio::spawn(
            async move {
                match pump_outbound(child_stdout, client_writer, chunk_size).await {
                    Ok(bytes) => debug!("Child output finished after {} bytes", bytes),
                    Err(e) => {
                        let _ = tx.send(e).await;
                    }
                }
            }
            .instrument(Span::current()),
        );

        Self {
            inbound,
            outbound: Some(outbound),
            faults,
        }
    }

    /// Resolves with the first I/O failure of either pump.
    ///
    /// Never resolves if both pumps finish cleanly. Cancel safe.
    pub async fn fault(&mut self) -> io::Error {
        match self.faults.recv().await {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Give the child's remaining output up to `grace` to reach the client,
    /// then stop the outbound pump. Returns any fault raised meanwhile.
    pub async fn drain(&mut self, grace: Duration) -> io::Result<()> {
        if let Some(mut outbound) = self.outbound.take() {
            if tokio::time::timeout(grace, &mut outbound).await.is_err() {
                debug!("Child output still open after {:?}, dropping it", grace);
                outbound.abort();
            }
        }

        match self.faults.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.inbound.abort();
        if let Some(outbound) = &self.outbound {
            outbound.abort();
        }
    }
}

/// Client to child stdin. Closes stdin on client EOF.
async fn pump_inbound<R, I>(mut reader: R, mut stdin: I, chunk_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    I: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            // peer closed the TCP connection without a TLS close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }

        let written = async {
            stdin.write_all(&buf[..n]).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => total += n as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Child closed its stdin");
                return Ok(total);
            }
            Err(e) => return Err(e),
        }
    }

    match stdin.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
        _ => Ok(total),
    }
}

/// Child stdout to client, one locked write + flush per chunk
async fn pump_outbound<O, W>(
    mut stdout: O,
    writer: SharedWriter<W>,
    chunk_size: usize,
) -> io::Result<u64>
where
    O: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }

        let mut writer = writer.lock().await;
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};
    use tokio::time::timeout;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut client, server) = duplex(64);
        let (server_r, server_w) = split(server);
        let (mut child, child_ends) = duplex(64);
        let (child_out, child_in) = split(child_ends);

        let mut bridge = Bridge::start(server_r, Arc::new(Mutex::new(server_w)), child_in, child_out, 4);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        child.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // larger than one chunk
        child.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(child);
        bridge.drain(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_eof_closes_child_stdin() {
        let (mut client, server) = duplex(64);
        let (server_r, server_w) = split(server);
        let (mut child, child_ends) = duplex(64);
        let (child_out, child_in) = split(child_ends);

        let _bridge = Bridge::start(server_r, Arc::new(Mutex::new(server_w)), child_in, child_out, 16);

        client.write_all(b"last").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        child.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last");
    }

    #[tokio::test]
    async fn test_output_written_before_status() {
        let client_reader = Builder::new().build();
        let stdin = Builder::new().build();
        let stdout = Builder::new().read(b"partial ").read(b"output").build();
        let writer = Arc::new(Mutex::new(Vec::new()));

        let mut bridge = Bridge::start(client_reader, writer.clone(), stdin, stdout, 32);
        bridge.drain(Duration::from_secs(1)).await.unwrap();

        let mut out = writer.lock().await;
        out.extend_from_slice(b"OK\n");
        assert_eq!(out.as_slice(), b"partial outputOK\n");
    }

    #[tokio::test]
    async fn test_client_write_error_is_a_fault() {
        let (_client, server) = duplex(64);
        let (server_r, _server_w) = split(server);
        let (_child_in_peer, child_in) = duplex(64);
        let stdout = Builder::new().read(b"output").build();
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let mut bridge = Bridge::start(server_r, Arc::new(Mutex::new(writer)), child_in, stdout, 32);

        let fault = timeout(Duration::from_secs(1), bridge.fault()).await.unwrap();
        assert_eq!(fault.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_broken_child_stdin_is_not_a_fault() {
        let client_reader = Builder::new().read(b"ignored input").build();
        let stdin = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();
        let stdout = Builder::new().build();
        let writer = Arc::new(Mutex::new(Vec::new()));

        let mut bridge = Bridge::start(client_reader, writer, stdin, stdout, 32);

        // both pumps end cleanly, so no fault ever arrives
        assert!(timeout(Duration::from_millis(200), bridge.fault()).await.is_err());
        bridge.drain(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_open_output() {
        let client_reader = Builder::new().build();
        let stdin = Builder::new().build();
        // never closed, like a background process still holding stdout
        let (_holder, stdout) = duplex(64);
        let writer = Arc::new(Mutex::new(Vec::new()));

        let mut bridge = Bridge::start(client_reader, writer, stdin, stdout, 32);

        let started = std::time::Instant::now();
        bridge.drain(Duration::from_millis(50)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
