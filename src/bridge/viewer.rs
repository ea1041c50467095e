//! WebSocket gateway for browser terminals.
//!
//! Each viewer is one duplex WebSocket carrying JSON frames. Inbound
//! `input` frames are written straight into the shell (overlaid
//! keystrokes, never attributed to a command); `resize` frames
//! propagate PTY dimensions. Outbound frames come from the fan-out
//! bus through this viewer's bounded queue, so a stalled browser can
//! never stall the shell producer.
//!
//! Deregistration is guaranteed and idempotent: whichever of the
//! reader loop or the writer task finishes first, the viewer leaves
//! the bus exactly once.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use poem::IntoResponse;
use poem::handler;
use poem::web::Data;
use poem::web::websocket::{Message, WebSocket};
use tracing::{debug, info, warn};

use super::orchestrator::Orchestrator;
use super::types::{ClientFrame, ServerFrame};

/// `GET /ws` — attach a browser terminal to the shared session.
#[handler]
pub async fn viewer_endpoint(
    ws: WebSocket,
    Data(orchestrator): Data<&Arc<Orchestrator>>,
) -> impl IntoResponse {
    let orchestrator = orchestrator.clone();
    ws.on_upgrade(move |socket| run_viewer(socket, orchestrator))
}

async fn run_viewer(socket: poem::web::websocket::WebSocketStream, orchestrator: Arc<Orchestrator>) {
    let bus = orchestrator.bus();
    let (viewer_id, mut frames) = bus.register().await;
    let (mut sink, mut stream) = socket.split();

    // Tell the new viewer where it stands before any output flows.
    let connected = orchestrator.is_connected().await;
    let hello = ServerFrame::Status { connected };
    if send_frame(&mut sink, &hello).await.is_err() {
        bus.unregister(viewer_id).await;
        return;
    }

    // Outbound: drain the bounded queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound: keystrokes and resizes until the browser goes away.
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Input { data }) => {
                    if let Err(e) = orchestrator.viewer_input(&data).await {
                        debug!("viewer {} input dropped: {}", viewer_id, e);
                    }
                }
                Ok(ClientFrame::Resize { cols, rows }) => {
                    if let Err(e) = orchestrator.viewer_resize(cols, rows).await {
                        debug!("viewer {} resize dropped: {}", viewer_id, e);
                    } else {
                        info!("viewer {} resized terminal to {}x{}", viewer_id, cols, rows);
                    }
                }
                Err(e) => warn!("viewer {} sent an unparseable frame: {}", viewer_id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("viewer {} socket error: {}", viewer_id, e);
                break;
            }
        }
    }

    bus.unregister(viewer_id).await;
    writer.abort();
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}
