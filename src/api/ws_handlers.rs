//! WebSocket handler bridging one socket to the hub actor

use super::handlers::BrokerState;
use crate::hub::ConnectionId;
use crate::protocol::Envelope;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

/// WebSocket upgrade handler for `/ws`
pub async fn ws_hub(ws: WebSocketUpgrade, State(state): State<BrokerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Handle an individual WebSocket connection.
///
/// Inbound text frames are forwarded to the hub in receipt order; envelopes
/// the hub addresses to this connection are written in the order the hub
/// produced them.
async fn handle_ws(socket: WebSocket, state: BrokerState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (id, mut outbound) = state.hub.connect();

    // Skip the first immediate tick
    let mut ping_interval = interval_at(Instant::now() + state.ping_interval, state.ping_interval);

    debug!(connection_id = %id, "WebSocket client connected");

    loop {
        tokio::select! {
            // Envelopes routed to this connection by the hub
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    debug!(connection_id = %id, "Hub closed the connection");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };
                if !send_envelope(&mut ws_sender, id, &envelope).await {
                    break;
                }
            }

            // Send periodic pings to detect dead clients
            _ = ping_interval.tick() => {
                if ws_sender.send(Message::Ping(vec![].into())).await.is_err() {
                    debug!(connection_id = %id, "Ping failed, client disconnected");
                    break;
                }
            }

            // Frames from the client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.inbound(id, text.as_str());
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => state.hub.inbound(id, text),
                        Err(e) => warn!(connection_id = %id, error = %e, "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id = %id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "WebSocket error");
                        break;
                    }
                    // Ping/Pong are handled by axum
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.disconnect(id);
    debug!(connection_id = %id, "WebSocket connection closed");
}

async fn send_envelope<S>(ws_sender: &mut S, id: ConnectionId, envelope: &Envelope) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match envelope.to_json() {
        Ok(json) => {
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                debug!(connection_id = %id, "WebSocket send failed, client disconnected");
                return false;
            }
            true
        }
        Err(e) => {
            warn!(connection_id = %id, error = %e, "Failed to serialize envelope");
            true
        }
    }
}
