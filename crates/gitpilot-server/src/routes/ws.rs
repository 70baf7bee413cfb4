use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use gitpilot_core::broadcast::ProgressBroadcaster;
use tracing::debug;

use crate::state::AppState;

/// GET /api/ws: bidirectional observer channel.
///
/// Server-to-client traffic is the same envelope stream as `/api/events`.
/// A client `{"event":"ping","data":…}` is answered with a pong carrying the
/// same data; other client messages are ignored.
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    let broadcaster = app.coordinator.broadcaster().clone();
    ws.on_upgrade(move |socket| observe(socket, broadcaster))
}

async fn observe(mut socket: WebSocket, broadcaster: ProgressBroadcaster) {
    let mut observer = broadcaster.connect();
    let id = observer.id();

    loop {
        tokio::select! {
            frame = observer.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.json.clone().into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = broadcaster.handle_inbound(text.as_str()) else {
                        continue;
                    };
                    let Ok(json) = serde_json::to_string(&reply) else {
                        continue;
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(observer = id, "websocket closed");
}
