//! Sandbox module - isolated execution of client programs
//!
//! This module handles:
//! - Loading the isolation policy and building the launcher command
//! - CPU-time and descriptor limits
//! - Spawning the child with its stdio and source pipes wired up
//! - Classifying how the child terminated
//!
//! The sandbox module does NOT:
//! - Talk to the network or know about the wire protocol
//! - Copy bytes between the child and the client (see `bridge`)

pub mod limits;
pub mod outcome;
pub mod policy;
pub mod process;

pub use limits::{raise_open_file_limit, CpuLimit};
pub use outcome::ExecutionStatus;
pub use policy::IsolationPolicy;
pub use process::{LaunchSpec, SandboxError, SandboxedProcess};
