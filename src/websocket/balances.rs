use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, timeout, Duration};

use crate::{
    api::AppState,
    constants::{WS_CLIENT_TIMEOUT_SECS, WS_HEARTBEAT_INTERVAL_SECS},
    models::{AggregateStatus, BalancesParams, BalancesUpdate},
    services::{BalancesAggregator, BalancesSubscription},
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum BalancesInbound {
    Subscribe {
        #[serde(flatten)]
        params: BalancesParams,
    },
    Unsubscribe,
}

#[derive(Debug, Serialize)]
struct BalancesMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    update: &'a BalancesUpdate,
    status: AggregateStatus,
}

fn balances_payload(update: &BalancesUpdate, status: AggregateStatus) -> String {
    serde_json::to_string(&BalancesMessage {
        msg_type: "balances",
        update,
        status,
    })
    .unwrap_or_default()
}

// Pending forever while nothing is subscribed, so it can sit in `select!`.
async fn next_update(
    subscription: &mut Option<BalancesSubscription>,
) -> Option<(BalancesUpdate, AggregateStatus)> {
    match subscription {
        Some(sub) => {
            let update = sub.next().await?;
            Some((update, sub.status()))
        }
        None => std::future::pending().await,
    }
}

// The new handle is acquired before the old one is released, so an
// identical target set keeps its running hub.
fn resubscribe(
    slot: &mut Option<BalancesSubscription>,
    aggregator: &BalancesAggregator,
    params: &BalancesParams,
) {
    let sub = aggregator.subscribe(params);
    tracing::info!("Balances socket subscribed to {}", sub.key());
    *slot = Some(sub);
}

/// WebSocket handler for the balances stream. A new `subscribe` message
/// replaces the socket's previous subscription.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription: Option<BalancesSubscription> = None;
    let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));

    let _ = sender
        .send(Message::Text(super::connected_payload("balances").into()))
        .await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            next_msg = timeout(Duration::from_secs(WS_CLIENT_TIMEOUT_SECS), receiver.next()) => {
                let msg = match next_msg {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(_))) | Ok(None) => break,
                    Err(_) => {
                        tracing::info!("Balances WebSocket client timeout");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<BalancesInbound>(&text) {
                        Ok(BalancesInbound::Subscribe { params }) => {
                            resubscribe(&mut subscription, &state.balances, &params);
                        }
                        Ok(BalancesInbound::Unsubscribe) => {
                            subscription = None;
                        }
                        Err(err) => {
                            tracing::debug!("Ignoring balances message: {}", err);
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            next = next_update(&mut subscription) => {
                let Some((update, status)) = next else {
                    subscription = None;
                    continue;
                };
                let json = balances_payload(&update, status);
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(subscription);
    tracing::info!("Balances WebSocket connection closed");
}
