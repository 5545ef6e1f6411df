//! Server configuration
//!
//! Loaded once at startup from environment variables (optionally seeded from a
//! `.env` file by `dotenvy`). Every setting has a default except the passphrase.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for the daemon
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (loopback by default)
    pub host: IpAddr,
    /// TCP port to listen on
    pub port: u16,
    /// Pre-shared passphrase for the challenge-response handshake
    pub passphrase: Vec<u8>,
    /// Target soft limit for open file descriptors
    pub max_open_files: u64,
    /// PEM file with the server certificate chain
    pub cert_file: PathBuf,
    /// PEM file with the private key (often the same file as the certificate)
    pub key_file: PathBuf,
    /// TOML file describing the isolation policy
    pub policy_file: PathBuf,
    /// Interpreter command; the source path is appended as the last argument
    pub interpreter: Vec<String>,
    /// CPU-time budget in seconds (0 disables the limit)
    pub cpu_limit_secs: u64,
    /// How long to wait for the challenge response
    pub auth_timeout: Duration,
    /// Stall before closing a connection that failed the challenge
    pub auth_failure_delay: Duration,
    /// Upper bound on the received program text
    pub max_code_bytes: usize,
    /// Chunk size used by the stream bridge
    pub bridge_chunk_size: usize,
    /// How long to wait for buffered output after the child exits
    pub drain_grace: Duration,
}

impl ServerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let passphrase = lookup("SANDBOXD_PASSPHRASE")
            .filter(|p| !p.is_empty())
            .context("SANDBOXD_PASSPHRASE must be set")?;

        let cert_file: PathBuf = lookup("SANDBOXD_CERT_FILE")
            .unwrap_or_else(|| "./server.pem".into())
            .into();
        let key_file = lookup("SANDBOXD_KEY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| cert_file.clone());

        let interpreter = into_command(
            &lookup("SANDBOXD_INTERPRETER").unwrap_or_else(|| "python3 -u".into()),
        );
        if interpreter.is_empty() {
            anyhow::bail!("SANDBOXD_INTERPRETER must name a program");
        }

        let bridge_chunk_size = parse_or(&lookup, "SANDBOXD_BRIDGE_CHUNK_SIZE", 1024usize)?;
        if bridge_chunk_size == 0 {
            anyhow::bail!("SANDBOXD_BRIDGE_CHUNK_SIZE must be at least 1");
        }

        Ok(Self {
            host: parse_or(&lookup, "SANDBOXD_HOST", IpAddr::from([127, 0, 0, 1]))?,
            port: parse_or(&lookup, "SANDBOXD_PORT", 9000)?,
            passphrase: passphrase.into_bytes(),
            max_open_files: parse_or(&lookup, "SANDBOXD_MAX_OPEN_FILES", 4096)?,
            cert_file,
            key_file,
            policy_file: lookup("SANDBOXD_POLICY_FILE")
                .unwrap_or_else(|| "./files/policy.toml".into())
                .into(),
            interpreter,
            cpu_limit_secs: parse_or(&lookup, "SANDBOXD_CPU_LIMIT_SECS", 2)?,
            auth_timeout: Duration::from_secs(parse_or(&lookup, "SANDBOXD_AUTH_TIMEOUT_SECS", 30)?),
            auth_failure_delay: Duration::from_secs(parse_or(
                &lookup,
                "SANDBOXD_AUTH_FAILURE_DELAY_SECS",
                2000,
            )?),
            max_code_bytes: parse_or(&lookup, "SANDBOXD_MAX_CODE_BYTES", 1024 * 1024)?,
            bridge_chunk_size,
            drain_grace: Duration::from_millis(parse_or(&lookup, "SANDBOXD_DRAIN_GRACE_MS", 500)?),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
