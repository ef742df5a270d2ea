//! Common infrastructure for the OVN EVPN agent.
//!
//! This crate provides shared functionality for the agent daemon:
//!
//! - [`shell`]: Safe shell command execution with proper quoting
//! - [`runner`]: The [`CommandRunner`] capability trait the managers use
//! - [`config`]: Typed configuration with documented defaults
//! - [`error`]: Error taxonomy for agent operations
//! - [`latch`]: Readiness latch for the late-bound OVN handle
//!
//! # Architecture
//!
//! The agent follows this pattern:
//!
//! 1. Subscribe to OVN Southbound tables for port-binding changes
//! 2. Translate tenant-network events into kernel, OVS and FRR mutations
//! 3. Periodically resync the whole data plane against the database
//!
//! All mutations are issued as shell commands through a [`CommandRunner`]
//! so tests can capture and script them.

pub mod config;
pub mod error;
pub mod latch;
pub mod runner;
pub mod shell;

// Re-export commonly used items at crate root
pub use config::{AgentConfig, ExposingMethod};
pub use error::{AgentError, AgentResult};
pub use latch::Latch;
pub use runner::{CommandRunner, EnsureOutcome, ShellRunner};
pub use shell::ExecResult;
