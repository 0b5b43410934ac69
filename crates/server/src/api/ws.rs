//! WebSocket feed of per-image conversion progress.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use imgpress_core::{ImageEncoder, ObjectStore, ProgressTracker};

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_EVICTIONS, WS_MESSAGES_SENT};
use crate::state::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler<S, E>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S, E>>>,
) -> impl IntoResponse
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    let tracker = state.progress().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, tracker))
}

/// Handle a single WebSocket connection.
///
/// The connection is one progress observer. It ends when the client goes
/// away or when the tracker drops the observer for falling behind.
async fn handle_socket(socket: WebSocket, tracker: ProgressTracker) {
    let (mut sender, mut receiver) = socket.split();

    let observer_id = Uuid::new_v4().to_string();
    let mut events = tracker.subscribe(observer_id.clone()).await;

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();
    info!(observer = %observer_id, "Progress WebSocket client connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!(observer = %observer_id, "Progress observer dropped, client fell behind");
                    WS_EVICTIONS.inc();
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };

                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("WebSocket send failed, client disconnected");
                            break;
                        }
                        WS_MESSAGES_SENT.inc();
                    }
                    Err(e) => {
                        error!("Failed to serialize ProgressEvent: {}", e);
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                    // Pings are answered by axum; client text is ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracker.unsubscribe(&observer_id).await;
    WS_CONNECTIONS_ACTIVE.dec();
    info!(observer = %observer_id, "Progress WebSocket client disconnected");
}
