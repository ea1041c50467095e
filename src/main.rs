#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, get, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;

use termbridge::bridge::{BridgeConfig, Orchestrator, TerminalTools, viewer::viewer_endpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let port: u16 = std::env::var("TERMBRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr = format!("0.0.0.0:{}", port);

    let orchestrator = Arc::new(Orchestrator::new(BridgeConfig::from_env()));

    info!("Starting terminal bridge on {}", addr);
    info!("MCP endpoint at /  -  viewer WebSocket at /ws");
    info!("Use the terminal_connect tool to open the remote shell");

    let mcp_orchestrator = orchestrator.clone();
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(TerminalTools {
                    orchestrator: mcp_orchestrator.clone(),
                })
            }),
        )
        .at("/ws", get(viewer_endpoint))
        .data(orchestrator)
        .with(Tracing);

    Server::new(TcpListener::bind(addr))
        .name("Terminal Bridge")
        .run(app)
        .await?;

    Ok(())
}
