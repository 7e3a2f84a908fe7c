#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, MAX_CHAT_LEN, MAX_ROOM_ID_LEN, MAX_USERNAME_LEN, ServerMessage};
use super::registry::ConnectionRegistry;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At the 100 msg/s rate limit, 64 slots = 640ms of burst buffer; frames
/// queued beyond that are stale and dropped early.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if no frame arrives within this window. Prevents
/// Slowloris-style holds on the connection semaphore.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Handles a single WebSocket connection from registration to cleanup.
///
/// Inbound events are fire-and-forget: malformed or droppable frames are
/// logged and counted, never answered with an error over the socket.
pub async fn handle_connection(
    socket: WebSocket,
    rooms: Arc<RoomRegistry>,
    connections: ConnectionRegistry,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let conn_id = connections.on_connect();
    info!("New WebSocket connection: {}", conn_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel of pre-serialized frames for this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let conn_id_send = conn_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", conn_id_send);
    });

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}, dropping frames", conn_id);
                    }
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        handle_client_message(
                            client_msg,
                            &conn_id,
                            &tx,
                            &rooms,
                            &connections,
                            &metrics,
                        )
                        .await;
                        metrics.observe_message_handling(start.elapsed());
                    }
                    Err(e) => {
                        warn!("Invalid frame from connection {}: {}", conn_id, e);
                        metrics.inc_errors();
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Handled by the WebSocket layer
            }
            _ => {
                warn!("Unexpected message type from connection {}", conn_id);
            }
        }
    }

    // Disconnects are never errors: always run leave cleanup for whatever
    // room the connection was bound to, so no ghost participant lingers.
    if let Some((room_id, username)) = connections.on_disconnect(&conn_id) {
        info!("Connection {} dropped while in room {}, leaving as {}", conn_id, room_id, username);
        rooms.leave(&room_id, &conn_id, &username).await;
    }

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", conn_id);
}

/// Dispatches one inbound event. Room-scoped events that fail their
/// precondition are dropped inside the room registry; nothing is ever
/// reported back over the socket.
async fn handle_client_message(
    message: ClientMessage,
    conn_id: &str,
    tx: &mpsc::Sender<Arc<String>>,
    rooms: &Arc<RoomRegistry>,
    connections: &ConnectionRegistry,
    metrics: &ServerMetrics,
) {
    match message {
        ClientMessage::Join { room_id, username } => {
            if room_id.is_empty()
                || room_id.len() > MAX_ROOM_ID_LEN
                || username.is_empty()
                || username.len() > MAX_USERNAME_LEN
            {
                warn!("Join with invalid room id or username from {}, dropping", conn_id);
                metrics.inc_errors();
                return;
            }
            // One room per connection: rebinding performs leave-then-join.
            if let Some((old_room, old_name)) = connections.binding(conn_id) {
                rooms.leave(&old_room, conn_id, &old_name).await;
                connections.unbind(conn_id);
            }
            if rooms.join(&room_id, conn_id, &username, tx.clone()).await {
                connections.bind(conn_id, &room_id, &username);
            }
        }

        ClientMessage::Leave { room_id, username } => {
            rooms.leave(&room_id, conn_id, &username).await;
            if connections.binding(conn_id).is_some_and(|(bound, _)| bound == room_id) {
                connections.unbind(conn_id);
            }
        }

        ClientMessage::CodeChange { room_id, username, code } => {
            rooms.update_buffer(&room_id, conn_id, &username, code).await;
        }

        ClientMessage::LanguageChange { room_id, username, language } => {
            rooms.update_language(&room_id, conn_id, &username, language).await;
        }

        ClientMessage::ChatMessage { room_id, username, message } => {
            if message.len() > MAX_CHAT_LEN {
                warn!("Oversized chat message from {} ({} bytes), dropping", conn_id, message.len());
                metrics.inc_errors();
                return;
            }
            rooms.chat(&room_id, &username, message).await;
        }

        ClientMessage::WebrtcOffer { room_id, from, to, offer } => {
            let target = to.clone();
            let frame = ServerMessage::WebrtcOffer { offer, from, to };
            rooms.relay_signal(&room_id, conn_id, target.as_deref(), &frame).await;
        }

        ClientMessage::WebrtcAnswer { room_id, from, to, answer } => {
            let target = to.clone();
            let frame = ServerMessage::WebrtcAnswer { answer, from, to };
            rooms.relay_signal(&room_id, conn_id, target.as_deref(), &frame).await;
        }

        ClientMessage::WebrtcIce { room_id, from, to, candidate } => {
            let target = to.clone();
            let frame = ServerMessage::WebrtcIce { candidate, from, to };
            rooms.relay_signal(&room_id, conn_id, target.as_deref(), &frame).await;
        }
    }
}
