use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth;
use crate::clock::generate_peer_id;
use crate::protocol::{self, ERR_INVALID_JSON, ERR_RATE_LIMITED};
use crate::rendezvous::DEFAULT_TTL_MS;
use crate::rooms::{next_session_id, RoomKey, RoomMember, OUTBOUND_QUEUE_DEPTH};
use crate::state::SharedState;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum HandshakeRejection {
    #[error("connection rate limit exceeded")]
    ConnectionLimit,
    #[error("invalid or missing credential")]
    Unauthorized,
}

impl HandshakeRejection {
    fn status(&self) -> StatusCode {
        match self {
            HandshakeRejection::ConnectionLimit => StatusCode::TOO_MANY_REQUESTS,
            HandshakeRejection::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuery {
    namespace: Option<String>,
    room: Option<String>,
    #[serde(default, alias = "peer_id")]
    peer_id: Option<String>,
    token: Option<String>,
}

/// `GET /signal`: authenticate, admit and upgrade a signaling session.
pub async fn signal_handler(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<SignalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_address = client_address(&headers, remote);

    if let Err(rejection) = admit(&state, &headers, &query, &client_address) {
        return rejection.status().into_response();
    }

    let key = RoomKey::new(query.namespace, query.room);
    let peer_id = query
        .peer_id
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| generate_peer_id(&state.clock));

    ws.on_upgrade(move |socket| handle_socket(socket, state, key, peer_id, client_address))
}

/// Steps 2 and 3 of the handshake pipeline. A connection slot claimed before
/// an auth failure is released so the bucket only counts live sessions.
fn admit(
    state: &SharedState,
    headers: &HeaderMap,
    query: &SignalQuery,
    client_address: &str,
) -> Result<(), HandshakeRejection> {
    if !state.limiter.allow_connection(client_address) {
        state.metrics.rate_limited_total.inc();
        warn!(client_address, "peer.connection_rate_limited");
        return Err(HandshakeRejection::ConnectionLimit);
    }

    let token = auth::extract_token(headers, query.token.as_deref());
    if !state.verifier.verify(token.as_deref()) {
        state.limiter.release_connection(client_address);
        state.metrics.auth_failures_total.inc();
        warn!(client_address, "peer.auth_failed");
        return Err(HandshakeRejection::Unauthorized);
    }

    Ok(())
}

/// First hop of `X-Forwarded-For` when present, else the socket peer.
fn client_address(headers: &HeaderMap, remote: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .unwrap_or_else(|| remote.ip().to_string())
}

async fn handle_socket(
    socket: WebSocket,
    state: SharedState,
    key: RoomKey,
    peer_id: String,
    client_address: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);

    // Outbound task: drain the bounded queue into the sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let session_id = next_session_id();
    let now = state.clock.now_ms();
    state.hub.join(
        &key,
        RoomMember {
            session_id,
            peer_id: peer_id.clone(),
            client_address: client_address.clone(),
            connected_at: now,
            sender: tx.clone(),
        },
    );

    let mut metadata = serde_json::Map::new();
    metadata.insert("transport".into(), Value::String("websocket".into()));
    state.rendezvous.register(
        &key,
        &peer_id,
        Vec::new(),
        Some(DEFAULT_TTL_MS),
        metadata,
        session_id,
        now,
    );

    state.metrics.connections_total.inc();
    state.metrics.active_connections.inc();
    info!(
        peer_id = %peer_id,
        namespace = %key.namespace,
        room = %key.room,
        client_address = %client_address,
        "peer.connected"
    );

    let welcome = protocol::welcome(&peer_id, &key, &state.clock.now_iso());
    let admitted = tokio::time::timeout(HANDSHAKE_DEADLINE, tx.send(Message::Text(welcome)))
        .await
        .map(|sent| sent.is_ok())
        .unwrap_or(false);

    let mut shutdown = state.shutdown.subscribe();

    if admitted && !*shutdown.borrow() {
        loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            debug!(peer_id = %peer_id, error = %err, "signal read error");
                            break;
                        }
                        None => break,
                    };
                    match message {
                        Message::Text(text) => {
                            dispatch_frame(&state, &key, &peer_id, &client_address, &tx, &text);
                        }
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                dispatch_frame(&state, &key, &peer_id, &client_address, &tx, &text);
                            }
                            Err(_) => {
                                if state.limiter.allow_message(&client_address, state.clock.now_ms()) {
                                    state.metrics.messages_total.inc();
                                    let _ = tx.try_send(Message::Text(protocol::error_envelope(
                                        ERR_INVALID_JSON,
                                    )));
                                } else {
                                    state.metrics.rate_limited_total.inc();
                                    let _ = tx.try_send(Message::Text(protocol::error_envelope(
                                        ERR_RATE_LIMITED,
                                    )));
                                }
                            }
                        },
                        Message::Close(_) => break,
                        // Axum answers pings on our behalf while the stream is polled.
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
                _ = shutdown.changed() => {
                    debug!(peer_id = %peer_id, "closing session for shutdown");
                    let _ = tx.try_send(Message::Close(None));
                    break;
                }
            }
        }
    } else if !admitted {
        warn!(peer_id = %peer_id, "welcome not delivered within handshake deadline");
    }

    // Teardown runs exactly once: every path funnels here. Both removals are
    // guarded by the session id, so a reconnect that already superseded this
    // session keeps its room membership and registry record.
    state.hub.leave(&key, &peer_id, session_id);
    state.rendezvous.remove_peer(&key, &peer_id, session_id);
    state.limiter.release_connection(&client_address);
    state.metrics.connection_closed();
    info!(
        peer_id = %peer_id,
        namespace = %key.namespace,
        room = %key.room,
        "peer.disconnected"
    );
    writer.abort();
}

/// In-order dispatch for one inbound frame: rate-check, count, parse, then
/// classify as heartbeat, telemetry or relay.
fn dispatch_frame(
    state: &SharedState,
    key: &RoomKey,
    peer_id: &str,
    client_address: &str,
    tx: &mpsc::Sender<Message>,
    text: &str,
) {
    if !state.limiter.allow_message(client_address, state.clock.now_ms()) {
        state.metrics.rate_limited_total.inc();
        let _ = tx.try_send(Message::Text(protocol::error_envelope(ERR_RATE_LIMITED)));
        return;
    }
    state.metrics.messages_total.inc();

    let payload = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => {
            let _ = tx.try_send(Message::Text(protocol::error_envelope(ERR_INVALID_JSON)));
            return;
        }
    };

    match payload.get("type").and_then(Value::as_str) {
        Some("heartbeat") => {
            let _ = tx.try_send(Message::Text(protocol::heartbeat_ack(
                &state.clock.now_iso(),
            )));
        }
        Some("telemetry") => {
            protocol::record_telemetry(&state.metrics, &payload);
        }
        _ => {
            let stamped = protocol::stamp_relay(payload, peer_id, key, &state.clock.now_iso());
            let stats = state.hub.fanout(key, peer_id, &stamped);
            if stats.dropped > 0 || stats.closed > 0 {
                debug!(
                    peer_id = %peer_id,
                    room = %key,
                    dropped = stats.dropped,
                    closed = stats.closed,
                    "fanout backpressure"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(xff: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", xff.parse().unwrap());
        headers
    }

    #[test]
    fn forwarded_header_first_hop_wins() {
        let remote: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(
            client_address(&headers_with("203.0.113.7, 10.0.0.2"), remote),
            "203.0.113.7"
        );
        assert_eq!(
            client_address(&headers_with(" 203.0.113.9 "), remote),
            "203.0.113.9"
        );
    }

    #[test]
    fn socket_address_is_the_fallback() {
        let remote: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(client_address(&HeaderMap::new(), remote), "10.0.0.1");
        // An empty header value is treated as absent.
        assert_eq!(client_address(&headers_with(""), remote), "10.0.0.1");
    }
}
