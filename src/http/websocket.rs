//! WebSocket fan-out endpoint.
//!
//! # Responsibilities
//! - Authenticate the handshake before upgrading
//! - Register the connection with the hub
//! - Translate protocol messages into hub operations
//! - Forward queued events and keep the connection alive with pings
//!
//! # Design Decisions
//! - Browsers cannot set headers on a handshake, so `?access_token=` is accepted
//! - One task per connection; reads, writes and pings share one select loop
//! - Any inbound frame counts as liveness for the idle sweep

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::http::server::AppState;
use crate::realtime::{ClientMessage, ConnectionHandle, FanoutHub, ServerMessage};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let identity = match state
        .identity
        .identify(&headers, params.get("access_token").map(String::as_str))
    {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting realtime handshake");
            return e.into_response();
        }
    };

    let hub = state.hub.clone();
    let ping_every = Duration::from_secs(state.config.realtime.ping_interval_secs.max(1));
    ws.on_upgrade(move |socket| async move {
        let (handle, rx) = hub.register(identity);
        handle_socket(socket, hub, handle, rx, ping_every).await;
    })
}

async fn handle_socket(
    socket: WebSocket,
    hub: Arc<FanoutHub>,
    handle: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<Arc<ServerMessage>>,
    ping_every: Duration,
) {
    let id = handle.id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = handle.closed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            inbound = ws_rx.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::debug!(connection = %id, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                };
                hub.touch(id);

                let reply = match message {
                    Message::Text(text) => Some(handle_client_text(&hub, &handle, text.as_str())),
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => Some(handle_client_text(&hub, &handle, text)),
                        Err(_) => Some(ServerMessage::error("invalid_message", "expected UTF-8 JSON")),
                    },
                    Message::Ping(data) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        None
                    }
                    Message::Pong(_) => None,
                    Message::Close(_) => break,
                };

                if let Some(reply) = reply {
                    if send_json(&mut ws_tx, &reply).await.is_err() {
                        break;
                    }
                }
            }

            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if send_json(&mut ws_tx, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.disconnect(id);
}

fn handle_client_text(hub: &FanoutHub, handle: &ConnectionHandle, text: &str) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return ServerMessage::error("invalid_message", e.to_string()),
    };

    match message {
        ClientMessage::Subscribe { topics } => match hub.subscribe(handle.id(), &topics) {
            Ok(topics) => ServerMessage::Subscribed { topics },
            Err(e) => ServerMessage::error("subscribe_failed", e.to_string()),
        },
        ClientMessage::Unsubscribe { topics } => match hub.unsubscribe(handle.id(), &topics) {
            Ok(topics) => ServerMessage::Unsubscribed { topics },
            Err(e) => ServerMessage::error("unsubscribe_failed", e.to_string()),
        },
        ClientMessage::Ping => ServerMessage::Pong,
    }
}

async fn send_json<S>(sink: &mut S, message: &ServerMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server message");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}
