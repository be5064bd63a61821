use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};

use crate::{api::AppState, constants::WS_HEARTBEAT_INTERVAL_SECS, models::PendingRequest};

fn queue_payload(requests: &[PendingRequest]) -> String {
    serde_json::json!({
        "type": "requests",
        "requests": requests
    })
    .to_string()
}

/// WebSocket handler for the approval UI: the full pending queue on connect
/// and again after every change.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut snapshots = state.requests.subscribe();

    let _ = sender
        .send(Message::Text(super::connected_payload("requests").into()))
        .await;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));
        // First iteration always sends the current queue.
        snapshots.mark_changed();
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let json = queue_payload(&snapshots.borrow_and_update());
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read side only watches for the client going away.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::info!("Request queue WebSocket connection closed");
}
