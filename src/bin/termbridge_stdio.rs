#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use poem_mcpserver::McpServer;
use termbridge::bridge::{BridgeConfig, Orchestrator, TerminalTools};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so the protocol stream stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = Arc::new(Orchestrator::new(BridgeConfig::from_env()));

    poem_mcpserver::stdio::stdio(McpServer::new().tools(TerminalTools { orchestrator })).await?;

    Ok(())
}
