use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use unblink_protocol::RelayConfig;

use crate::auth;
use crate::broadcast::EventBroadcaster;
use crate::cv::{self, CvEventBus, IngestError};
use crate::db::Db;
use crate::node_conn::{ConnCtx, NodeTable, run_node_conn};
use crate::registry::ServiceRegistry;
use crate::session::SessionManager;
use crate::storage::StorageManager;
use crate::streams::{RealtimeStreamManager, StreamEvent};
use crate::transport::WsTransport;

/// Shared application state behind both listeners.
pub struct AppState {
    pub config: RelayConfig,
    pub db: Arc<Db>,
    pub services: Arc<ServiceRegistry>,
    pub nodes: Arc<NodeTable>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<CvEventBus>,
    pub storage: Arc<StorageManager>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub streams: Arc<RealtimeStreamManager>,
    pub stream_events: mpsc::UnboundedSender<StreamEvent>,
    pub started_at: std::time::Instant,
}

impl AppState {
    fn conn_ctx(&self) -> ConnCtx {
        ConnCtx {
            db: Arc::clone(&self.db),
            services: Arc::clone(&self.services),
            nodes: Arc::clone(&self.nodes),
            stream_events: self.stream_events.clone(),
            dashboard_url: self.config.dashboard_url.clone(),
        }
    }
}

/// Machine-facing router (RELAY_PORT): node and worker sockets, frame
/// downloads, event publication.
pub fn build_relay_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/node/connect", get(node_ws_upgrade))
        .route("/worker/connect", get(worker_ws_upgrade))
        .route("/frames/{frame_id}", get(get_frame))
        .route("/events", post(post_event))
        .route("/healthz", get(health_check))
        .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1MB: worker event payloads
        .with_state(state)
}

/// Dashboard-facing router (API_PORT).
pub fn build_api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/authorize", post(authorize_node))
        .route("/api/status", get(status))
        .route("/node/{id}", axum::routing::delete(revoke_node))
        .route("/node/{id}/services", get(list_node_services))
        .route(
            "/node/{id}/services/{service_id}",
            axum::routing::delete(delete_service),
        )
        .route("/node/{id}/offer", post(node_offer))
        .route("/node/{id}/events", get(node_events))
        .route("/node/{id}/events/subscribe", get(events_subscribe))
        .route("/healthz", get(health_check))
        .layer(RequestBodyLimitLayer::new(256 * 1024)) // SDP offers fit comfortably
        .with_state(state)
}

/// Query parameters accepted wherever a JWT may arrive by query instead of
/// header (browser WebSocket clients cannot set Authorization).
#[derive(Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

/// Extract and validate the user JWT from Authorization header or query
/// parameter. Prefers the header.
fn extract_claims(
    headers: &HeaderMap,
    query: &AuthQuery,
    jwt_secret: &str,
) -> Result<auth::Claims, (StatusCode, String)> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Missing token".to_string()))?;

    auth::validate_jwt(token, jwt_secret).map_err(|e| {
        tracing::warn!("Invalid JWT: {e}");
        (
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        )
    })
}

/// Check node existence and ownership. 404 for unknown nodes, 403 for
/// someone else's node.
fn check_node_owner(
    state: &AppState,
    node_id: &str,
    user_id: &str,
) -> Result<(), (StatusCode, String)> {
    match state.db.node_by_id(node_id) {
        Ok(Some(_)) => {}
        Ok(None) => return Err((StatusCode::NOT_FOUND, "Node not found".to_string())),
        Err(e) => {
            tracing::error!(%node_id, "Node lookup failed: {e}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ));
        }
    }
    match state.db.node_owned_by(node_id, user_id) {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::warn!(%node_id, %user_id, "Node ownership mismatch");
            Err((StatusCode::FORBIDDEN, "Access denied".to_string()))
        }
        Err(e) => {
            tracing::error!(%node_id, "Ownership check failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ))
        }
    }
}

/// The worker key presented on frame downloads and event publication.
fn worker_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-worker-key").and_then(|v| v.to_str().ok())
}

/// GET /healthz - liveness for load balancers, no auth
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /node/connect - WebSocket upgrade, node bridging protocol
async fn node_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ctx = state.conn_ctx();
    ws.max_message_size(2 * 1024 * 1024) // DATA payload ceiling
        .on_upgrade(move |socket| run_node_conn(WsTransport::new(socket), ctx))
}

/// GET /worker/connect - WebSocket upgrade, worker registration + fan-out
async fn worker_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let bus = Arc::clone(&state.bus);
    ws.on_upgrade(move |socket| cv::handle_worker_socket(socket, bus))
}

/// GET /frames/:frame_id - raw JPEG, requires a live worker key
async fn get_frame(
    State(state): State<Arc<AppState>>,
    Path(frame_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(key) = worker_key(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing X-Worker-Key").into_response();
    };
    if state.bus.registry.authenticate(key).await.is_none() {
        return (StatusCode::UNAUTHORIZED, "Invalid worker key").into_response();
    }

    match state.storage.read_frame(&frame_id).await {
        Ok(Some(bytes)) => (
            [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Frame not found").into_response(),
        Err(e) => {
            tracing::warn!(%frame_id, "Frame read failed: {e:#}");
            (StatusCode::NOT_FOUND, "Frame not found").into_response()
        }
    }
}

/// POST /events - worker-published event, requires a live worker key
async fn post_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(key) = worker_key(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing X-Worker-Key" })),
        )
            .into_response();
    };
    let Some(worker_id) = state.bus.registry.authenticate(key).await else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid worker key" })),
        )
            .into_response();
    };

    match state.bus.ingest_event(payload).await {
        Ok(stored) => {
            tracing::debug!(%worker_id, event_id = %stored.id, "Event published");
            (StatusCode::OK, Json(json!(stored))).into_response()
        }
        Err(e @ (IngestError::MissingServiceId | IngestError::NotAnObject)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(IngestError::Storage(e)) => {
            tracing::error!("Event storage failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to store event" })),
            )
                .into_response()
        }
    }
}

/// GET /api/status - operational counters (requires JWT)
async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_claims(&headers, &query, &state.config.jwt_secret) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connected_nodes": state.nodes.len().await,
        "services": state.services.len().await,
        "webrtc_sessions": state.sessions.list().await.len(),
        "realtime_streams": state.streams.stream_count().await,
        "workers": state.bus.registry.worker_count().await,
        "event_subscribers": state.broadcaster.subscriber_count().await,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct AuthorizeRequest {
    node_id: String,
}

/// POST /api/authorize - associate a node with the authenticated user and
/// push the minted token over the node's pending connection, if any.
async fn authorize_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    Json(request): Json<AuthorizeRequest>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => {
            return (status, Json(json!({ "error": msg }))).into_response();
        }
    };
    if request.node_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "node_id is required" })),
        )
            .into_response();
    }
    // A valid JWT for a deleted user must not mint node tokens
    match state.db.user_exists(&claims.sub) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(user_id = %claims.sub, "Authorize by unknown user");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unknown user" })),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("User lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response();
        }
    }

    let token = match state.db.authorize_node(&request.node_id, &claims.sub) {
        Ok(token) => token,
        Err(e) if e.to_string().contains("already owned") => {
            tracing::warn!(node_id = %request.node_id, user_id = %claims.sub, "Authorize denied");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Node is owned by another user" })),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!(node_id = %request.node_id, "Authorize failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to authorize node" })),
            )
                .into_response();
        }
    };

    // If the node is connected and waiting, hand it the token right away.
    let delivered = match state.nodes.get(&request.node_id).await {
        Some(handle) => handle.send_auth_token(token).await.is_ok(),
        None => false,
    };

    tracing::info!(
        node_id = %request.node_id,
        user_id = %claims.sub,
        delivered,
        "Node authorized"
    );
    Json(json!({ "node_id": request.node_id, "delivered": delivered })).into_response()
}

/// DELETE /node/:id - detach a node from its owner and retire its services.
///
/// The node's token stops registering immediately; an open connection is
/// left to die on its next reconnect.
async fn revoke_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if let Err((status, msg)) = check_node_owner(&state, &node_id, &claims.sub) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    if let Err(e) = state.db.revoke_node_owner(&node_id) {
        tracing::error!(%node_id, "Revoke failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to revoke node" })),
        )
            .into_response();
    }
    for service in state.services.remove_node(&node_id).await {
        let _ = state
            .stream_events
            .send(StreamEvent::ServiceRemoved(service.descriptor.id));
    }
    tracing::info!(target: "audit", %node_id, user_id = %claims.sub, "Node revoked");
    Json(json!({ "node_id": node_id, "revoked": true })).into_response()
}

/// DELETE /node/:id/services/:service_id - remove a service
async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path((node_id, service_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if let Err((status, msg)) = check_node_owner(&state, &node_id, &claims.sub) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    // The service must belong to THIS node, in the db or live registry,
    // before anything is deleted.
    let persisted = match state.db.service_by_id(&service_id) {
        Ok(row) => row.is_some_and(|s| s.node_id == node_id),
        Err(e) => {
            tracing::error!(%service_id, "Service lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response();
        }
    };
    let live = state
        .services
        .get(&service_id)
        .await
        .is_some_and(|s| s.node_id == node_id);
    if !persisted && !live {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Service not found" })),
        )
            .into_response();
    }

    if persisted && let Err(e) = state.db.delete_service(&service_id) {
        tracing::error!(%service_id, "Service delete failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to delete service" })),
        )
            .into_response();
    }
    if live {
        state.services.remove(&service_id).await;
        let _ = state
            .stream_events
            .send(StreamEvent::ServiceRemoved(service_id.clone()));
    }
    tracing::info!(target: "audit", %node_id, %service_id, "Service deleted");
    Json(json!({ "service_id": service_id, "deleted": true })).into_response()
}

/// GET /node/:id/services - live services of an owned node
async fn list_node_services(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if let Err((status, msg)) = check_node_owner(&state, &node_id, &claims.sub) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    let services = state.services.list_for_node(&node_id).await;
    Json(services).into_response()
}

#[derive(Deserialize)]
struct OfferRequest {
    sdp: String,
    #[serde(rename = "serviceId")]
    service_id: String,
}

/// POST /node/:id/offer - negotiate a WebRTC session for a camera
async fn node_offer(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    Json(request): Json<OfferRequest>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if let Err((status, msg)) = check_node_owner(&state, &node_id, &claims.sub) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }
    if request.sdp.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Malformed offer: empty sdp" })),
        )
            .into_response();
    }

    let Some(service) = state.services.get(&request.service_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Service not found" })),
        )
            .into_response();
    };
    if service.node_id != node_id {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Service not found" })),
        )
            .into_response();
    }
    let Some(node) = state.nodes.get_registered(&node_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Node is not connected" })),
        )
            .into_response();
    };

    match state
        .sessions
        .create_session(node, &service, request.sdp)
        .await
    {
        Ok((session_id, answer)) => {
            tracing::info!(%session_id, service_id = %request.service_id, "Offer answered");
            Json(json!({ "type": "answer", "sdp": answer, "sessionId": session_id }))
                .into_response()
        }
        Err(e) => {
            tracing::error!(service_id = %request.service_id, "Session setup failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Media pipeline failure" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    token: Option<String>,
    service_id: Option<String>,
    limit: Option<usize>,
}

/// GET /node/:id/events - recent stored events for an owned node
async fn node_events(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let auth_query = AuthQuery {
        token: query.token.clone(),
    };
    let claims = match extract_claims(&headers, &auth_query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };
    if let Err((status, msg)) = check_node_owner(&state, &node_id, &claims.sub) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    let services = match state.db.services_for_node(&node_id) {
        Ok(list) => list,
        Err(e) => {
            tracing::error!(%node_id, "Service lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response();
        }
    };
    let service_ids: Vec<String> = match &query.service_id {
        Some(filter) => {
            if !services.iter().any(|s| &s.id == filter) {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "Service not found" })),
                )
                    .into_response();
            }
            vec![filter.clone()]
        }
        None => services.into_iter().map(|s| s.id).collect(),
    };

    let limit = query.limit.unwrap_or(50).min(500);
    match state.db.recent_events(&service_ids, limit) {
        Ok(events) => {
            let body: Vec<serde_json::Value> = events
                .into_iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "service_id": e.service_id,
                        "payload": e.payload,
                        "created_at": e.created_at,
                    })
                })
                .collect();
            Json(body).into_response()
        }
        Err(e) => {
            tracing::error!(%node_id, "Event query failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

/// GET /node/:id/events/subscribe - live event stream for dashboards
async fn events_subscribe(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth_query = AuthQuery {
        token: query.token.clone(),
    };
    let claims = match extract_claims(&headers, &auth_query, &state.config.jwt_secret) {
        Ok(c) => c,
        Err((status, msg)) => return (status, msg).into_response(),
    };
    if let Err((status, msg)) = check_node_owner(&state, &node_id, &claims.sub) {
        return (status, msg).into_response();
    }

    let broadcaster = Arc::clone(&state.broadcaster);
    let service_id = query.service_id.clone();
    ws.on_upgrade(move |mut socket| async move {
        let (subscription, mut events) = broadcaster.subscribe(&node_id, service_id).await;
        tracing::debug!(%node_id, %subscription, "Event subscriber connected");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let frame = json!({
                        "type": "event",
                        "id": event.id,
                        "service_id": event.service_id,
                        "created_at": event.created_at,
                        "data": event.payload,
                    });
                    if socket
                        .send(axum::extract::ws::Message::Text(frame.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(axum::extract::ws::Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }
        broadcaster.unsubscribe(subscription).await;
        tracing::debug!(%node_id, %subscription, "Event subscriber disconnected");
    })
    .into_response()
}
