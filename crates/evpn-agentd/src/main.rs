//! evpnagentd - OVN EVPN agent daemon
//!
//! Entry point for the agent.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use evpn_agent_common::{AgentConfig, ShellRunner};
use evpn_agentd::EvpnDriver;

/// Initializes tracing/logging subsystem
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    info!("--- Starting evpnagentd ---");

    let mut config = AgentConfig::default();
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration invalid");
        return ExitCode::FAILURE;
    }

    let config = Arc::new(config);
    let runner = Arc::new(ShellRunner);
    let _driver = Arc::new(EvpnDriver::new(config, runner));

    // The deployment's OVN IDL integration supplies the Southbound
    // client and the watcher event stream, then calls
    // evpn_agentd::run(driver, sb, events).

    info!("evpnagentd initialization complete (awaiting IDL integration)");

    ExitCode::SUCCESS
}
