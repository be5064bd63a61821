use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};

use crate::{
    api::AppState,
    constants::{WS_CLIENT_TIMEOUT_SECS, WS_HEARTBEAT_INTERVAL_SECS},
    error::{AppError, RpcError},
    models::{NewRequest, RequestPayload},
    services::RequestStore,
};

static NEXT_PORT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum DappInbound {
    Request {
        id: String,
        origin: String,
        payload: RequestPayload,
    },
}

/// Reply correlated to the inbound `id`. Exactly one of `result`/`error` is set.
#[derive(Debug, Serialize, PartialEq)]
struct DappReply {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl DappReply {
    fn from_outcome(id: String, outcome: crate::error::Result<serde_json::Value>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(err) => Self {
                id,
                result: None,
                error: Some(err.rpc_error()),
            },
        }
    }
}

/// WebSocket handler for dapp-originated requests. One socket is one port.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

// Internal helper that supports `handle_inbound` operations.
fn handle_inbound(
    store: &RequestStore,
    port_id: &str,
    text: &str,
    replies: &mpsc::UnboundedSender<DappReply>,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::debug!("Ignoring unparseable dapp message on {}: {}", port_id, err);
            return;
        }
    };
    let id = raw
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let DappInbound::Request {
        id,
        origin,
        payload,
    } = match serde_json::from_value::<DappInbound>(raw) {
        Ok(message) => message,
        Err(err) => {
            let _ = replies.send(DappReply::from_outcome(
                id,
                Err(AppError::BadRequest(err.to_string())),
            ));
            return;
        }
    };

    let ticket = match store.create_request(NewRequest::new(origin, payload).on_port(port_id)) {
        Ok(ticket) => ticket,
        Err(err) => {
            let _ = replies.send(DappReply::from_outcome(id, Err(err)));
            return;
        }
    };

    let replies = replies.clone();
    tokio::spawn(async move {
        let outcome = ticket.wait().await;
        // The port may already be gone; nobody is left to tell.
        let _ = replies.send(DappReply::from_outcome(id, outcome));
    });
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let port_id = format!("port-{}", NEXT_PORT.fetch_add(1, Ordering::Relaxed));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<DappReply>();

    let _ = sender
        .send(Message::Text(super::connected_payload("dapp").into()))
        .await;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else {
                        break;
                    };
                    let json = serde_json::to_string(&reply).unwrap_or_default();
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let store = state.requests.clone();
    let recv_port = port_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let next_msg =
                timeout(Duration::from_secs(WS_CLIENT_TIMEOUT_SECS), receiver.next()).await;
            let msg = match next_msg {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    tracing::info!("Dapp port {} timed out", recv_port);
                    break;
                }
            };

            match msg {
                Message::Text(text) => handle_inbound(&store, &recv_port, &text, &reply_tx),
                Message::Close(_) => break,
                _ => {}
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

    let cancelled = state.requests.cancel_port(&port_id);
    tracing::info!(
        "Dapp port {} closed, cancelled {} pending request(s)",
        port_id,
        cancelled
    );
}
