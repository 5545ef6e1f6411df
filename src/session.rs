//! One client connection, start to finish
//!
//! 1. challenge-response over plain TCP
//! 2. TLS upgrade
//! 3. program upload until `END CODE`
//! 4. sandboxed run with stdio bridged to the client
//! 5. one status line, then close
//!
//! A failed challenge is not an error: the connection is held for the
//! configured delay and then dropped without a reply.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{split, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info};

use crate::auth::{self, AuthOutcome};
use crate::bridge::{Bridge, SharedWriter};
use crate::error::SessionError;
use crate::protocol::{self, StatusLine};
use crate::sandbox::{CpuLimit, ExecutionStatus, LaunchSpec, SandboxError, SandboxedProcess};
use crate::server::ServerContext;
use crate::tls;

type ChannelReader = BufReader<ReadHalf<TlsStream<TcpStream>>>;
type ChannelWriter = SharedWriter<WriteHalf<TlsStream<TcpStream>>>;

pub struct Session {
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
}

impl Session {
    pub fn new(peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self { peer, ctx }
    }

    /// Run to completion; errors are logged here and never escape
    pub async fn run(self, stream: TcpStream) {
        let peer = self.peer;
        match self.handle(stream).await {
            Ok(()) => debug!("Session with {} closed", peer),
            Err(e) => error!("Session with {} failed: {:#}", peer, anyhow::Error::from(e)),
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<(), SessionError> {
        let config = &self.ctx.config;

        let outcome = auth::challenge(&mut stream, &config.passphrase, config.auth_timeout)
            .await
            .map_err(SessionError::Auth)?;
        match outcome {
            AuthOutcome::Accepted => info!("Challenge OK!"),
            AuthOutcome::Rejected(reason) => {
                info!(
                    "Challenge failed ({}); closing in {:?}",
                    reason, config.auth_failure_delay
                );
                tokio::time::sleep(config.auth_failure_delay).await;
                return Ok(());
            }
        }

        let channel = tls::upgrade(&self.ctx.acceptor, stream)
            .await
            .map_err(SessionError::Upgrade)?;
        let (read_half, write_half) = split(channel);
        let reader = BufReader::new(read_half);
        let writer: ChannelWriter = Arc::new(Mutex::new(write_half));

        match self.execute(reader, Arc::clone(&writer)).await {
            Ok(status) => report(&writer, status.into())
                .await
                .map_err(SessionError::Report),
            Err(e) => {
                if let Err(report_err) = report(&writer, StatusLine::Exception).await {
                    debug!("Could not report exception to client: {}", report_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        mut reader: ChannelReader,
        writer: ChannelWriter,
    ) -> Result<ExecutionStatus, SessionError> {
        let config = &self.ctx.config;

        let code = protocol::read_code(&mut reader, config.max_code_bytes).await?;
        debug!("Received {} bytes of program text", code.len());

        let spec = LaunchSpec {
            interpreter: &config.interpreter,
            policy: &self.ctx.policy,
            cpu_limit: CpuLimit::from_secs(config.cpu_limit_secs),
        };
        info!("Start executing received code in sandbox");
        let (mut process, source) = SandboxedProcess::launch(&spec, code)?;
        let (stdin, stdout) = process.take_stdio().ok_or(SandboxError::StdioTaken)?;
        debug!("Bridging stdio of pid {:?}", process.id());

        let mut bridge = Bridge::start(reader, writer, stdin, stdout, config.bridge_chunk_size);

        // The program text goes in while output already flows out: an
        // interpreter may run its source before it has read all of it.
        // Dropping `process` on an error path kills the child.
        let feed = source.send();
        tokio::pin!(feed);
        let mut fed = false;
        let status = loop {
            tokio::select! {
                result = &mut feed, if !fed => {
                    fed = true;
                    result?;
                }
                status = process.wait() => break status?,
                fault = bridge.fault() => return Err(SessionError::Bridge(fault)),
            }
        };

        bridge
            .drain(config.drain_grace)
            .await
            .map_err(SessionError::Bridge)?;
        Ok(status)
    }
}

/// Write the final line and close the channel
async fn report<W>(writer: &SharedWriter<W>, line: StatusLine) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!("Reporting result: {}", line);
    let mut writer = writer.lock().await;
    writer.write_all(line.to_line().as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await
}
