use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::json;

use crate::state::AppState;

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is registered with `WsManager` and
/// managed by a sender task plus the receive loop on this task.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manage a single dashboard connection after upgrade.
///
///   1. Registers the connection with `WsManager`.
///   2. Queues a snapshot of every account's status.
///   3. Spawns a sender task that forwards messages from the manager channel.
///   4. Drains inbound frames until the client leaves, then cleans up.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "Dashboard WebSocket connected");

    let mut rx = state.ws_manager.add(conn_id.clone()).await;

    let snapshot = json!({ "type": "snapshot", "data": state.clients.statuses().await });
    state
        .ws_manager
        .send_to(&conn_id, Message::Text(snapshot.to_string().into()))
        .await;

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "Dashboard WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // The dashboard only listens; inbound frames are drained and ignored.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "Dashboard WebSocket receive error");
                break;
            }
        }
    }

    state.ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "Dashboard WebSocket disconnected");
}
