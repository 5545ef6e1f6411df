//! Child termination classification

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

use super::policy::Launcher;

/// How a sandboxed program finished (raw, no protocol formatting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exited with status zero
    Success,
    /// Killed for exceeding the CPU budget
    ResourceLimitExceeded,
    /// Anything else: the exit code, or the negated signal number
    Failed(i32),
}

/// Map an exit status to an [`ExecutionStatus`].
///
/// SIGXCPU always means the CPU budget ran out. SIGKILL means the same only
/// when `cpu_exhausted` says the child had used its budget: a program that
/// ignores SIGXCPU runs on until the hard limit, where the kernel kills it.
///
/// Launchers that run the program in a forked child relay a fatal signal as
/// exit code `128 + signo`; that encoding is honoured for CPU-limit kills.
pub fn classify(status: ExitStatus, launcher: &Launcher, cpu_exhausted: bool) -> ExecutionStatus {
    if let Some(signal) = status.signal() {
        return if is_cpu_kill(signal, cpu_exhausted) {
            ExecutionStatus::ResourceLimitExceeded
        } else {
            ExecutionStatus::Failed(-signal)
        };
    }

    match status.code() {
        Some(0) => ExecutionStatus::Success,
        Some(code)
            if launcher.relays_signals_as_exit_codes() && is_cpu_kill(code - 128, cpu_exhausted) =>
        {
            ExecutionStatus::ResourceLimitExceeded
        }
        Some(code) => ExecutionStatus::Failed(code),
        None => ExecutionStatus::Failed(status.into_raw()),
    }
}

fn is_cpu_kill(signal: i32, cpu_exhausted: bool) -> bool {
    signal == Signal::SIGXCPU as i32 || (cpu_exhausted && signal == Signal::SIGKILL as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(signal: Signal) -> ExitStatus {
        ExitStatus::from_raw(signal as i32)
    }

    fn bubblewrap() -> Launcher {
        Launcher::Bubblewrap {
            program: PathBuf::from("bwrap"),
            read_only: vec![],
            tmpfs: vec![],
            network: false,
        }
    }

    #[test]
    fn test_success() {
        assert_eq!(classify(exited(0), &Launcher::Unconfined, false), ExecutionStatus::Success);
    }

    #[test]
    fn test_cpu_signal_is_resource_limit() {
        assert_eq!(
            classify(signaled(Signal::SIGXCPU), &Launcher::Unconfined, false),
            ExecutionStatus::ResourceLimitExceeded
        );
    }

    #[test]
    fn test_other_signal_is_negated() {
        assert_eq!(
            classify(signaled(Signal::SIGSEGV), &Launcher::Unconfined, false),
            ExecutionStatus::Failed(-(Signal::SIGSEGV as i32))
        );
        assert_eq!(
            classify(signaled(Signal::SIGKILL), &Launcher::Unconfined, false),
            ExecutionStatus::Failed(-9)
        );
    }

    #[test]
    fn test_nonzero_exit() {
        assert_eq!(classify(exited(1), &Launcher::Unconfined, false), ExecutionStatus::Failed(1));
    }

    #[test]
    fn test_relayed_cpu_signal() {
        let relayed = exited(128 + Signal::SIGXCPU as i32);

        assert_eq!(
            classify(relayed, &bubblewrap(), false),
            ExecutionStatus::ResourceLimitExceeded
        );
        // a directly executed program may legitimately exit with that code
        assert_eq!(
            classify(relayed, &Launcher::Unconfined, false),
            ExecutionStatus::Failed(128 + Signal::SIGXCPU as i32)
        );
    }

    #[test]
    fn test_sigkill_after_budget_is_resource_limit() {
        assert_eq!(
            classify(signaled(Signal::SIGKILL), &Launcher::Unconfined, true),
            ExecutionStatus::ResourceLimitExceeded
        );
        // other signals keep their meaning even once the budget is spent
        assert_eq!(
            classify(signaled(Signal::SIGTERM), &Launcher::Unconfined, true),
            ExecutionStatus::Failed(-15)
        );
    }

    #[test]
    fn test_relayed_sigkill_after_budget() {
        let relayed = exited(128 + Signal::SIGKILL as i32);

        assert_eq!(
            classify(relayed, &bubblewrap(), true),
            ExecutionStatus::ResourceLimitExceeded
        );
        assert_eq!(classify(relayed, &bubblewrap(), false), ExecutionStatus::Failed(137));
        assert_eq!(
            classify(relayed, &Launcher::Unconfined, true),
            ExecutionStatus::Failed(137)
        );
    }

    #[test]
    fn test_exit_code_unaffected_by_budget() {
        assert_eq!(classify(exited(0), &bubblewrap(), true), ExecutionStatus::Success);
        assert_eq!(classify(exited(3), &bubblewrap(), true), ExecutionStatus::Failed(3));
    }
}
