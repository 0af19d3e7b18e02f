//! WebSocket transport: `{"event": ..., "data": {...}}` envelopes in both
//! directions, one live pairing session per connection.

use super::ApiState;
use crate::gateway::{CancelReason, EventSink, Gateway, SessionEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Messages a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum ClientMessage {
    GetPairingCode {
        #[serde(rename = "phoneNumber", default)]
        phone_number: Option<String>,
    },
}

/// WebSocket upgrade handler.
pub(super) async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.gateway))
}

fn connection_id() -> String {
    format!("ws_{}", uuid::Uuid::new_v4().simple())
}

async fn handle_socket(socket: WebSocket, gateway: Gateway) {
    let conn_id = connection_id();
    info!("ws: {conn_id} connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    error!("ws: failed to serialize event: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!("ws: send failed, client disconnected");
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("ws: {conn_id} error: {e}");
                break;
            }
        };
        handle_text(text.as_str(), &conn_id, &gateway, &tx).await;
    }

    // Stop the writer first so sessions see a detached sink.
    send_task.abort();
    let _ = send_task.await;
    disconnect(&gateway, &conn_id).await;
    info!("ws: {conn_id} closed");
}

/// Parse and act on one inbound text frame.
async fn handle_text(
    text: &str,
    conn_id: &str,
    gateway: &Gateway,
    tx: &mpsc::UnboundedSender<SessionEvent>,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => handle_client_message(msg, conn_id, gateway, tx).await,
        Err(e) => {
            debug!("ws: {conn_id} sent unparseable message: {e}");
            let _ = tx.send(SessionEvent::Error {
                message: format!("unrecognized message: {e}"),
            });
        }
    }
}

async fn handle_client_message(
    msg: ClientMessage,
    conn_id: &str,
    gateway: &Gateway,
    tx: &mpsc::UnboundedSender<SessionEvent>,
) {
    match msg {
        ClientMessage::GetPairingCode { phone_number } => {
            // Claimed before the spawn, so a start still in flight for an
            // earlier frame can never register alongside this one.
            let claim = gateway
                .claim_owner(conn_id, CancelReason::Superseded)
                .await;

            let phone_number = phone_number.unwrap_or_default();
            let gateway = gateway.clone();
            let sink = EventSink::new(tx.clone());
            // Progress and failures reach the client through the sink.
            tokio::spawn(async move {
                let _ = gateway.start_pairing(&phone_number, sink, Some(claim)).await;
            });
        }
    }
}

/// The connection is gone: its session goes with it, silently.
async fn disconnect(gateway: &Gateway, conn_id: &str) {
    let released = gateway
        .cancel_owned_by(conn_id, CancelReason::Disconnected)
        .await;
    if released > 0 {
        info!("ws: {conn_id} disconnected, released {released} session(s)");
    }
}
