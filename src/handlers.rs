use axum::{
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::auth;
use crate::rooms::{next_session_id, RoomKey};
use crate::state::SharedState;

/// Browser clients call every endpoint cross-origin, so the header set rides
/// on all responses and bare OPTIONS short-circuits to 204.
pub async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type,Authorization"),
    );
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "ok": true, "now": state.clock.now_iso() }))
}

/// GET /metrics, Prometheus text exposition.
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[derive(Debug, Deserialize)]
pub struct BootstrapQuery {
    namespace: Option<String>,
    room: Option<String>,
}

/// GET /bootstrap: room size plus the advertised signaling URL.
pub async fn bootstrap(
    State(state): State<SharedState>,
    Query(query): Query<BootstrapQuery>,
) -> Json<Value> {
    let key = RoomKey::new(query.namespace, query.room);
    Json(json!({
        "namespace": key.namespace,
        "room": key.room,
        "peers": state.hub.member_count(&key),
        "signalingUrl": state.config.public_signaling_url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    namespace: Option<String>,
    room: Option<String>,
    peer_id: String,
    #[serde(default)]
    addresses: Vec<String>,
    ttl_ms: Option<u64>,
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// POST /rendezvous/register: authenticated advertisement of a peer.
pub async fn rendezvous_register(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> Response {
    let token = auth::extract_token(&headers, query.token.as_deref());
    if !state.verifier.verify(token.as_deref()) {
        state.metrics.auth_failures_total.inc();
        warn!(endpoint = "/rendezvous/register", "peer.auth_failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };
    if body.peer_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "peerId required" })),
        )
            .into_response();
    }

    let key = RoomKey::new(body.namespace, body.room);
    // Each HTTP registration gets its own owner token; only a later
    // re-registration can displace the record before its TTL runs out.
    let record = state.rendezvous.register(
        &key,
        &body.peer_id,
        body.addresses,
        body.ttl_ms,
        body.metadata,
        next_session_id(),
        state.clock.now_ms(),
    );
    Json(record).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    namespace: Option<String>,
    room: Option<String>,
    limit: Option<usize>,
}

/// GET /rendezvous/discover: unauthenticated lookup of live records.
pub async fn rendezvous_discover(
    State(state): State<SharedState>,
    Query(query): Query<DiscoverQuery>,
) -> Json<Value> {
    let key = RoomKey::new(query.namespace, query.room);
    let peers = state
        .rendezvous
        .discover(&key, query.limit, state.clock.now_ms());
    Json(json!({
        "namespace": key.namespace,
        "room": key.room,
        "peers": peers,
    }))
}

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found" })),
    )
        .into_response()
}
