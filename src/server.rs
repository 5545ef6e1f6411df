//! TCP listener and per-connection dispatch

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::sandbox::IsolationPolicy;
use crate::session::Session;

/// Pause after a failed accept, e.g. when out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a session needs, shared read-only across sessions
pub struct ServerContext {
    pub config: ServerConfig,
    pub acceptor: TlsAcceptor,
    pub policy: IsolationPolicy,
    pub connections: ConnectionCounter,
}

/// Number of live sessions
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection until the returned guard drops
    pub fn track(&self) -> ConnectionGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(Arc::clone(&self.0))
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accept connections forever, one task per session
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}. Retrying...", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let guard = ctx.connections.track();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(
            async move {
                let _guard = guard;
                info!(
                    "New connection; currently have {} connections",
                    ctx.connections.current()
                );
                Session::new(peer, ctx).run(stream).await;
            }
            .instrument(info_span!("session", peer = %peer)),
        );
    }
}
