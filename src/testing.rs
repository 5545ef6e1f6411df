//! Test helpers: throwaway certificates, an in-process server and a client
//! that speaks the full protocol.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::auth;
use crate::config::ServerConfig;
use crate::protocol::CODE_TERMINATOR;
use crate::sandbox::IsolationPolicy;
use crate::server::{self, ConnectionCounter, ServerContext};
use crate::tls;

pub const PASSPHRASE: &[u8] = b"foobar";

/// Write a self-signed `localhost` certificate and its key as PEM files
pub fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, certified.cert.pem()).unwrap();
    fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

/// Server on an ephemeral loopback port running `/bin/sh` without a launcher
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
    connector: TlsConnector,
    task: JoinHandle<()>,
    _dir: TempDir,
}

pub async fn start_server<F>(configure: F) -> TestServer
where
    F: FnOnce(&mut ServerConfig),
{
    let dir = tempfile::tempdir().unwrap();
    let (cert_file, key_file) = write_self_signed(dir.path());

    let mut config = ServerConfig::from_lookup(|key| match key {
        "SANDBOXD_PASSPHRASE" => Some(String::from_utf8_lossy(PASSPHRASE).into_owned()),
        "SANDBOXD_PORT" => Some("0".to_string()),
        "SANDBOXD_INTERPRETER" => Some("/bin/sh".to_string()),
        _ => None,
    })
    .unwrap();
    config.cert_file = cert_file.clone();
    config.key_file = key_file;
    config.auth_timeout = Duration::from_secs(5);
    config.auth_failure_delay = Duration::from_millis(100);
    configure(&mut config);

    let acceptor = tls::load_acceptor(&config.cert_file, &config.key_file).unwrap();
    let listener = TcpListener::bind((config.host, config.port)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ctx = Arc::new(ServerContext {
        config,
        acceptor,
        policy: IsolationPolicy::unconfined(),
        connections: ConnectionCounter::new(),
    });
    let task = tokio::spawn(server::serve(listener, Arc::clone(&ctx)));

    TestServer {
        addr,
        ctx,
        connector: trusting_connector(&cert_file),
        task,
        _dir: dir,
    }
}

fn trusting_connector(cert_file: &Path) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from_pem_file(cert_file).unwrap())
        .unwrap();

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

impl TestServer {
    /// Pass the challenge and upgrade to TLS
    pub async fn connect(&self) -> TlsStream<TcpStream> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();

        let mut nonce = [0u8; auth::CHALLENGE_LEN];
        stream.read_exact(&mut nonce).await.unwrap();
        stream
            .write_all(&auth::expected_response(&nonce, PASSPHRASE))
            .await
            .unwrap();

        let name = ServerName::try_from("localhost").unwrap();
        self.connector.connect(name, stream).await.unwrap()
    }

    /// Upload `code`, send `input`, close our side and collect everything the
    /// server sends back (program output plus status line)
    pub async fn run_program(&self, code: &str, input: &[u8]) -> Vec<u8> {
        let mut channel = self.connect().await;

        let mut request = code.as_bytes().to_vec();
        request.extend_from_slice(CODE_TERMINATOR);
        request.extend_from_slice(input);
        channel.write_all(&request).await.unwrap();
        channel.shutdown().await.unwrap();

        let mut output = Vec::new();
        channel.read_to_end(&mut output).await.unwrap();
        output
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
