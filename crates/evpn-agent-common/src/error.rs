//! Error types for the EVPN agent.
//!
//! This module defines the error taxonomy used throughout the agent crates.
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Configuration validation error. Fatal at startup.
    #[error("Invalid configuration for {option}: {message}")]
    ConfigInvalid {
        /// The option that failed validation.
        option: String,
        /// Error message.
        message: String,
    },

    /// OVN port lookup exhausted its retries.
    #[error("Port '{port}' not found in OVN")]
    PortNotFound {
        /// Description of the port that could not be resolved.
        port: String,
    },

    /// Bridge VLAN allocation pool is exhausted.
    #[error("No free bridge VLAN available in the configured range")]
    VlanIdExhausted,

    /// A step of the network infrastructure build failed.
    /// The partially created resources have been rolled back.
    #[error("Failed to build infrastructure for network {network}: {message}")]
    ResourceBuildFailed {
        /// The network datapath UUID.
        network: String,
        /// Error message.
        message: String,
    },

    /// FRR configuration could not be applied.
    /// The next FRR resync retries the VRF configuration.
    #[error("FRR reconfiguration failed: {message}")]
    Frr {
        /// Error message.
        message: String,
    },

    /// OVN Southbound query failed.
    #[error("OVN query failed: {operation}: {message}")]
    OvnQuery {
        /// The operation that failed (e.g. "list_port_bindings").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Creates a configuration error.
    pub fn config_invalid(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            option: option.into(),
            message: message.into(),
        }
    }

    /// Creates a port-not-found error.
    pub fn port_not_found(port: impl Into<String>) -> Self {
        Self::PortNotFound { port: port.into() }
    }

    /// Creates a resource build error.
    pub fn resource_build_failed(
        network: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ResourceBuildFailed {
            network: network.into(),
            message: message.into(),
        }
    }

    /// Creates an FRR error.
    pub fn frr(message: impl Into<String>) -> Self {
        Self::Frr {
            message: message.into(),
        }
    }

    /// Creates an OVN query error.
    pub fn ovn_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OvnQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::PortNotFound { .. }
                | AgentError::OvnQuery { .. }
                | AgentError::ShellCommandFailed { .. }
                | AgentError::Frr { .. }
        )
    }
}
