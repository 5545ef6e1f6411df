//! Resource limits
//!
//! The CPU budget is applied to the child between `fork` and `exec`, so it is
//! in force before the launcher or interpreter runs a single instruction of
//! client code. The open-file limit is raised once for the server itself.

use std::time::Duration;

use nix::sys::resource::{getrlimit, getrusage, setrlimit, Resource, UsageWho};
use nix::sys::time::TimeVal;
use tracing::info;

/// CPU-time budget for a sandboxed child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLimit {
    secs: u64,
}

impl CpuLimit {
    /// `None` when the budget is zero (no limit)
    pub fn from_secs(secs: u64) -> Option<Self> {
        (secs > 0).then_some(Self { secs })
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    /// Soft limit: the kernel sends SIGXCPU when it is crossed
    pub fn soft(&self) -> u64 {
        self.secs
    }

    /// Hard limit one second past the soft limit, so the child sees SIGXCPU
    /// rather than an immediate SIGKILL
    pub fn hard(&self) -> u64 {
        self.secs.saturating_add(1)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    /// Whether `used` CPU time reached the soft limit. A child killed by
    /// SIGKILL after this point hit the hard limit.
    pub fn exhausted_by(&self, used: Duration) -> bool {
        used >= self.budget()
    }

    /// Apply to the calling process. Async-signal-safe; used from `pre_exec`.
    pub fn apply(&self) -> nix::Result<()> {
        setrlimit(Resource::RLIMIT_CPU, self.soft(), self.hard())
    }
}

/// Raise the soft open-file limit towards `target`, clamped to the hard limit.
///
/// Returns the soft limit in effect afterwards.
pub fn raise_open_file_limit(target: u64) -> nix::Result<u64> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let wanted = target.min(hard);
    if wanted <= soft {
        info!("Open file/socket limit already {} (target {})", soft, target);
        return Ok(soft);
    }

    info!("Increasing open file/socket limit from {} to {}", soft, wanted);
    setrlimit(Resource::RLIMIT_NOFILE, wanted, hard)?;
    Ok(wanted)
}

/// User plus system CPU time of every child reaped so far
pub fn children_cpu_time() -> nix::Result<Duration> {
    let usage = getrusage(UsageWho::RUSAGE_CHILDREN)?;
    Ok(to_duration(usage.user_time()) + to_duration(usage.system_time()))
}

fn to_duration(tv: TimeVal) -> Duration {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec()).unwrap_or(0);
    Duration::new(secs, micros.saturating_mul(1000))
}
