//! Recording command runner.

use std::sync::Mutex;

use async_trait::async_trait;

use evpn_agent_common::{AgentResult, CommandRunner, ExecResult};

/// Captures every command the agent issues and serves scripted results.
///
/// Commands succeed with empty output unless a response was scripted.
/// `vtysh -f <file>` commands additionally capture the configuration
/// file's contents before the temp file disappears.
#[derive(Default)]
pub struct MockRunner {
    commands: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, ExecResult)>>,
    frr_configs: Mutex<Vec<String>>,
}

impl MockRunner {
    /// Creates a runner where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a result for commands containing `marker`.
    /// Earlier scripts win over later ones.
    pub fn respond(&self, marker: impl Into<String>, result: ExecResult) {
        self.responses.lock().unwrap().push((marker.into(), result));
    }

    /// Scripts a failure for commands containing `marker`.
    pub fn fail_matching(&self, marker: impl Into<String>, stderr: impl Into<String>) {
        self.respond(marker, ExecResult::failed(2, stderr));
    }

    /// Returns every command issued so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Returns true if any issued command contains `fragment`.
    pub fn contains(&self, fragment: &str) -> bool {
        self.commands().iter().any(|cmd| cmd.contains(fragment))
    }

    /// Counts issued commands containing `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.commands()
            .iter()
            .filter(|cmd| cmd.contains(fragment))
            .count()
    }

    /// Returns the FRR configuration blocks applied via `vtysh -f`,
    /// in application order.
    pub fn frr_configs(&self) -> Vec<String> {
        self.frr_configs.lock().unwrap().clone()
    }

    /// Returns true if any applied FRR configuration contains `fragment`.
    pub fn frr_config_contains(&self, fragment: &str) -> bool {
        self.frr_configs().iter().any(|cfg| cfg.contains(fragment))
    }

    /// Forgets all recorded commands and FRR configurations.
    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
        self.frr_configs.lock().unwrap().clear();
    }

    fn capture_frr_config(&self, cmd: &str) {
        if !cmd.contains("vtysh -f") {
            return;
        }
        // The path is the sole double-quoted argument.
        if let Some(path) = cmd.split('"').nth(1) {
            if let Ok(contents) = std::fs::read_to_string(path) {
                self.frr_configs.lock().unwrap().push(contents);
            }
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, cmd: &str) -> AgentResult<ExecResult> {
        self.commands.lock().unwrap().push(cmd.to_string());
        self.capture_frr_config(cmd);

        let responses = self.responses.lock().unwrap();
        for (marker, result) in responses.iter() {
            if cmd.contains(marker.as_str()) {
                return Ok(result.clone());
            }
        }
        Ok(ExecResult::ok(""))
    }
}
