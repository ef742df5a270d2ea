//! Command runner capability interface.
//!
//! The managers never shell out directly; they go through a
//! [`CommandRunner`] so that tests can substitute a recording mock.
//! The trait also provides explicit create-or-ignore and delete-or-ignore
//! primitives so that "File exists" / "Cannot find device" kernel answers
//! are modelled as outcomes instead of errors.

use async_trait::async_trait;

use crate::error::{AgentError, AgentResult};
use crate::shell::{self, ExecResult};

/// Outcome of an idempotent create operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The resource was created by this call.
    Created,
    /// The resource already existed; the kernel reported "File exists".
    AlreadyExisted,
}

/// stderr fragments the kernel emits when a resource already exists.
const ALREADY_EXISTS_MARKERS: &[&str] = &["File exists", "already exists"];

/// stderr fragments the kernel emits when a resource is already gone.
const ALREADY_GONE_MARKERS: &[&str] = &["Cannot find device", "No such", "does not exist"];

fn matches_any(stderr: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| stderr.contains(m))
}

/// Executes shell commands on behalf of the agent components.
///
/// The production implementation is [`ShellRunner`]; tests use the
/// recording mock from the `evpn-agent-test` crate.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command and returns its raw result.
    ///
    /// A non-zero exit code is reported in the result, not as an error.
    async fn run(&self, cmd: &str) -> AgentResult<ExecResult>;

    /// Runs a command and returns its stdout, failing on non-zero exit.
    async fn run_ok(&self, cmd: &str) -> AgentResult<String> {
        let result = self.run(cmd).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(AgentError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }

    /// Runs a create command, treating "already exists" as success.
    async fn run_ensure(&self, cmd: &str) -> AgentResult<EnsureOutcome> {
        let result = self.run(cmd).await?;
        if result.success() {
            return Ok(EnsureOutcome::Created);
        }
        if matches_any(&result.stderr, ALREADY_EXISTS_MARKERS) {
            tracing::debug!(command = %cmd, "Resource already exists");
            return Ok(EnsureOutcome::AlreadyExisted);
        }
        Err(AgentError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }

    /// Runs a delete command, treating "already gone" as success.
    ///
    /// Returns `Ok(true)` if the command removed something, `Ok(false)`
    /// if the target was already absent.
    async fn run_delete(&self, cmd: &str) -> AgentResult<bool> {
        let result = self.run(cmd).await?;
        if result.success() {
            return Ok(true);
        }
        if matches_any(&result.stderr, ALREADY_GONE_MARKERS) {
            tracing::debug!(command = %cmd, "Resource already absent");
            return Ok(false);
        }
        Err(AgentError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Production runner delegating to [`shell::exec`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> AgentResult<ExecResult> {
        shell::exec(cmd).await
    }
}
