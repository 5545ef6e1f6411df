//! Isolation policy
//!
//! The policy file is TOML and picks one launcher that wraps the interpreter:
//!
//! ```toml
//! launcher = "bubblewrap"
//! read_only = ["/usr", "/lib", "/lib64", "/bin"]
//! tmpfs = ["/tmp"]
//! network = false
//! pass_env = ["VIRTUAL_ENV"]
//! ```
//!
//! `sandbox-exec` takes `profile_file` and/or `profile_name` instead of the
//! mount lists. `none` runs the interpreter directly.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_BWRAP: &str = "bwrap";
const DEFAULT_SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid policy")]
    Parse(#[from] toml::de::Error),
    #[error("sandbox-exec policy needs profile_file or profile_name")]
    MissingProfile,
    #[error("invalid environment variable name in pass_env: {0:?}")]
    InvalidEnvName(String),
}

/// Raw TOML form of a policy
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    launcher: LauncherKind,
    program: Option<PathBuf>,
    #[serde(default)]
    read_only: Vec<PathBuf>,
    #[serde(default)]
    tmpfs: Vec<PathBuf>,
    #[serde(default)]
    network: bool,
    profile_file: Option<PathBuf>,
    profile_name: Option<String>,
    #[serde(default)]
    pass_env: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum LauncherKind {
    Bubblewrap,
    SandboxExec,
    None,
}

/// OS facility used to confine the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Linux namespaces via bubblewrap
    Bubblewrap {
        program: PathBuf,
        read_only: Vec<PathBuf>,
        tmpfs: Vec<PathBuf>,
        network: bool,
    },
    /// macOS Seatbelt profiles via sandbox-exec
    SandboxExec {
        program: PathBuf,
        profile_file: Option<PathBuf>,
        profile_name: Option<String>,
    },
    /// No confinement (development and tests)
    Unconfined,
}

impl Launcher {
    /// bubblewrap forks the program and reports a fatal signal as `128 + signo`
    pub fn relays_signals_as_exit_codes(&self) -> bool {
        matches!(self, Launcher::Bubblewrap { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Launcher::Bubblewrap { .. } => "bubblewrap",
            Launcher::SandboxExec { .. } => "sandbox-exec",
            Launcher::Unconfined => "none",
        }
    }
}

/// Loaded isolation policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPolicy {
    pub launcher: Launcher,
    /// Environment variables forwarded from the server to the child
    pub pass_env: Vec<String>,
}

impl IsolationPolicy {
    /// Policy that runs programs without any launcher
    #[cfg(test)]
    pub fn unconfined() -> Self {
        Self {
            launcher: Launcher::Unconfined,
            pass_env: Vec::new(),
        }
    }

    /// Load a policy file; relative profile paths resolve against its directory
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml(&content, base_dir)
    }

    pub fn from_toml(content: &str, base_dir: &Path) -> Result<Self, PolicyError> {
        let raw: RawPolicy = toml::from_str(content)?;

        for name in &raw.pass_env {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(PolicyError::InvalidEnvName(name.clone()));
            }
        }

        let launcher = match raw.launcher {
            LauncherKind::Bubblewrap => Launcher::Bubblewrap {
                program: raw.program.unwrap_or_else(|| DEFAULT_BWRAP.into()),
                read_only: raw.read_only,
                tmpfs: raw.tmpfs,
                network: raw.network,
            },
            LauncherKind::SandboxExec => {
                if raw.profile_file.is_none() && raw.profile_name.is_none() {
                    return Err(PolicyError::MissingProfile);
                }
                Launcher::SandboxExec {
                    program: raw.program.unwrap_or_else(|| DEFAULT_SANDBOX_EXEC.into()),
                    profile_file: raw.profile_file.map(|p| base_dir.join(p)),
                    profile_name: raw.profile_name,
                }
            }
            LauncherKind::None => Launcher::Unconfined,
        };

        Ok(Self {
            launcher,
            pass_env: raw.pass_env,
        })
    }

    /// Values of the pass-through variables present in the server environment
    pub fn collect_env(&self) -> Vec<(String, String)> {
        self.pass_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }

    /// Full command line: launcher (if any) followed by `command`.
    ///
    /// `params` are the pass-through variables; sandbox-exec also receives them
    /// as profile parameters so the profile can refer to them.
    pub fn wrap(&self, command: &[String], params: &[(String, String)]) -> Vec<String> {
        let mut argv = Vec::new();

        match &self.launcher {
            Launcher::Bubblewrap {
                program,
                read_only,
                tmpfs,
                network,
            } => {
                argv.push(program.to_string_lossy().into_owned());
                argv.extend(
                    ["--unshare-all", "--die-with-parent", "--new-session"].map(String::from),
                );
                if *network {
                    argv.push("--share-net".to_string());
                }
                for path in read_only {
                    let path = path.to_string_lossy().into_owned();
                    argv.extend(["--ro-bind-try".to_string(), path.clone(), path]);
                }
                argv.extend(["--proc", "/proc", "--dev", "/dev"].map(String::from));
                for path in tmpfs {
                    argv.extend(["--tmpfs".to_string(), path.to_string_lossy().into_owned()]);
                }
                argv.push("--".to_string());
            }
            Launcher::SandboxExec {
                program,
                profile_file,
                profile_name,
            } => {
                argv.push(program.to_string_lossy().into_owned());
                for (key, value) in params {
                    argv.push("-D".to_string());
                    argv.push(format!("{}={}", key, value));
                }
                if let Some(file) = profile_file {
                    argv.extend(["-f".to_string(), file.to_string_lossy().into_owned()]);
                }
                if let Some(name) = profile_name {
                    argv.extend(["-n".to_string(), name.clone()]);
                }
            }
            Launcher::Unconfined => {}
        }

        argv.extend(command.iter().cloned());
        argv
    }
}
