//! Sandboxed child process
//!
//! The child gets three pipes:
//! - stdin and stdout, handed back to the caller for bridging
//! - a source pipe whose read end stays open across `exec`; the interpreter is
//!   pointed at it as `/dev/fd/<n>`, so program text never goes through argv
//!
//! Every descriptor the server opens here is close-on-exec. Only the source
//! read end is made inheritable, and only inside the forked child.
//!
//! The program text is not written by [`SandboxedProcess::launch`]. It comes
//! back as a [`SourceFeed`] that must run alongside the stdio bridge: an
//! interpreter that executes its source while reading it can fill its stdout
//! pipe before it has read everything.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

use super::limits::{children_cpu_time, CpuLimit};
use super::outcome::{classify, ExecutionStatus};
use super::policy::{IsolationPolicy, Launcher};

/// PATH given to every sandboxed child; the rest of its environment is cleared
const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create source pipe")]
    Pipe(#[source] nix::Error),
    #[error("failed to listen for SIGCHLD")]
    ChildSignal(#[source] io::Error),
    #[error("empty sandbox command")]
    EmptyCommand,
    #[error("child stdio already taken")]
    StdioTaken,
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send program text to the child")]
    Source(#[source] io::Error),
    #[error("failed to wait for the child")]
    Wait(#[source] io::Error),
}

/// What to launch and under which restrictions
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    /// Interpreter command; the source path is appended
    pub interpreter: &'a [String],
    pub policy: &'a IsolationPolicy,
    pub cpu_limit: Option<CpuLimit>,
}

/// A running sandboxed program.
///
/// Dropping it kills the child if it is still running; tokio reaps it.
#[derive(Debug)]
pub struct SandboxedProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    cpu_limit: Option<CpuLimit>,
    launcher: Launcher,
    sigchld: Signal,
    outcome: Option<ExecutionStatus>,
}

/// Program text still to be written into the child's source pipe
#[derive(Debug)]
pub struct SourceFeed {
    write_end: OwnedFd,
    code: String,
}

impl SandboxedProcess {
    /// Spawn the interpreter under the policy's launcher.
    ///
    /// Must be called from within a tokio runtime. The returned feed carries
    /// `code` to the child and should be driven concurrently with the stdio.
    pub fn launch(spec: &LaunchSpec<'_>, code: String) -> Result<(Self, SourceFeed), SandboxError> {
        // registered before the spawn so an early exit is never missed
        let sigchld = signal(SignalKind::child()).map_err(SandboxError::ChildSignal)?;

        let (source_read, source_write) = cloexec_pipe().map_err(SandboxError::Pipe)?;
        let source_fd = source_read.as_raw_fd();

        let mut command_line = spec.interpreter.to_vec();
        command_line.push(format!("/dev/fd/{}", source_fd));
        let params = spec.policy.collect_env();
        let argv = spec.policy.wrap(&command_line, &params);

        let cpu_limit = spec.cpu_limit;
        let mut child = spawn(&argv, &params, source_fd, cpu_limit)?;

        // The parent's read end must be gone before writing: a child that dies
        // early has to surface as EPIPE, not as a write that never completes.
        drop(source_read);

        let process = Self {
            pid: child.id(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            cpu_limit,
            launcher: spec.policy.launcher.clone(),
            sigchld,
            outcome: None,
        };
        info!(
            "Started sandboxed process pid={:?} launcher={} cpu_limit={:?}",
            process.pid,
            process.launcher.name(),
            process.cpu_limit.map(|l| l.secs())
        );

        let feed = SourceFeed {
            write_end: source_write,
            code,
        };
        Ok((process, feed))
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// The child's stdin writer and stdout reader; `None` once taken
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => None,
        }
    }

    /// Reap the child and classify how it ended. Cancel safe.
    pub async fn wait(&mut self) -> Result<ExecutionStatus, SandboxError> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }

        let (status, cpu_used) = loop {
            if let Some(reaped) = self.try_reap()? {
                break reaped;
            }
            if self.sigchld.recv().await.is_none() {
                let status = self.child.wait().await.map_err(SandboxError::Wait)?;
                break (status, None);
            }
        };

        let cpu_exhausted = match (self.cpu_limit, cpu_used) {
            (Some(limit), Some(used)) => limit.exhausted_by(used),
            _ => false,
        };
        let outcome = classify(status, &self.launcher, cpu_exhausted);
        info!(
            "Sandboxed process pid={:?} exited: {} cpu={:?} -> {:?}",
            self.pid, status, cpu_used, outcome
        );
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Non-blocking reap, measuring the CPU time the child accumulated.
    ///
    /// The measurement is the growth of `RUSAGE_CHILDREN` across this one
    /// `waitpid`. It is exact as long as nothing else reaps children on
    /// another thread at the same moment, which holds on the single-threaded
    /// runtime the server runs on.
    fn try_reap(&mut self) -> Result<Option<(ExitStatus, Option<Duration>)>, SandboxError> {
        let before = children_cpu_time();
        let Some(status) = self.child.try_wait().map_err(SandboxError::Wait)? else {
            return Ok(None);
        };

        let cpu_used = match (before, children_cpu_time()) {
            (Ok(before), Ok(after)) => Some(after.saturating_sub(before)),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to read child CPU usage: {}", e);
                None
            }
        };
        Ok(Some((status, cpu_used)))
    }
}

impl SourceFeed {
    /// Write the program text and close the pipe so the child sees EOF.
    ///
    /// A child that exits or closes its source early is not an error here;
    /// its exit status tells the story.
    pub async fn send(self) -> Result<(), SandboxError> {
        match write_source(self.write_end, &self.code).await {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Child closed its source after less than {} bytes", self.code.len());
                Ok(())
            }
            other => other.map_err(SandboxError::Source),
        }
    }
}

fn spawn(
    argv: &[String],
    params: &[(String, String)],
    source_fd: RawFd,
    cpu_limit: Option<CpuLimit>,
) -> Result<Child, SandboxError> {
    let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .env("PATH", CHILD_PATH)
        .envs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // SAFETY: the hook only calls fcntl(2) and setrlimit(2), both
    // async-signal-safe, and touches no memory shared with the parent.
    unsafe {
        cmd.pre_exec(move || {
            fcntl(source_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
            if let Some(limit) = cpu_limit {
                limit.apply()?;
            }
            Ok(())
        });
    }

    debug!("Spawning sandbox: {:?}", argv);
    cmd.spawn().map_err(|source| SandboxError::Spawn {
        program: program.clone(),
        source,
    })
}

async fn write_source(write_end: OwnedFd, code: &str) -> io::Result<()> {
    let mut sender = pipe::Sender::from_owned_fd(write_end)?;
    sender.write_all(code.as_bytes()).await?;
    sender.flush().await
}

#[cfg(target_os = "linux")]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(not(target_os = "linux"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}
