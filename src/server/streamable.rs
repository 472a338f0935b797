//! Streamable JSON-RPC 2.0 server: POST batches + SSE sessions
//!
//! One endpoint serves both directions: POST carries single messages or
//! arrays (responses preserve request order; notifications produce no
//! response), GET opens an SSE session with a heartbeat and coalesced
//! resource-update events. Internal events published to the message
//! queue are fanned out to sessions through fixed worker pools.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::core::config::ServerConfig;
use crate::core::error::{HubError, HubResult};
use crate::core::metrics::global_metrics;
use crate::protocol::messages::{
    CallToolParams, GetPromptParams, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ResourceParams, methods,
};
use crate::protocol::types::{
    JsonRpcError, JsonRpcMessage, JsonRpcResponse, PROTOCOL_VERSION, ServerCapabilities,
    ServerInfo, error_codes,
};
use crate::queue::MessageQueue;
use crate::server::proxy::HubRouter;
use crate::server::workers::WorkerPool;

/// Channels the server pumps from the queue onto SSE sessions
const EVENT_CHANNELS: [&str; 3] = ["logs", "processes", "errors"];
/// Channel carrying per-request activity records
const ACTIVITY_CHANNEL: &str = "activity";
/// Bound on each session's pending resource-update buffer
const MAX_PENDING_UPDATES: usize = 256;

/// One SSE event queued toward a session
#[derive(Debug, Clone)]
struct SessionEvent {
    event: String,
    data: String,
}

/// Server-side state of one SSE session
struct Session {
    id: String,
    events: mpsc::Sender<SessionEvent>,
    /// Resource-update URIs awaiting a coalesced flush
    pending_updates: StdMutex<Vec<String>>,
    /// URIs this session subscribed to
    subscriptions: StdMutex<HashSet<String>>,
}

impl Session {
    fn subscribe(&self, uri: &str) {
        self.subscriptions
            .lock()
            .expect("session subscriptions lock")
            .insert(uri.to_string());
    }

    fn unsubscribe(&self, uri: &str) {
        self.subscriptions
            .lock()
            .expect("session subscriptions lock")
            .remove(uri);
    }

    fn wants(&self, uri: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("session subscriptions lock")
            .contains(uri)
    }

    fn push_update(&self, uri: &str) {
        let mut pending = self.pending_updates.lock().expect("session updates lock");
        if pending.len() >= MAX_PENDING_UPDATES {
            pending.remove(0);
        }
        pending.push(uri.to_string());
    }

    fn take_updates(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_updates.lock().expect("session updates lock"))
    }
}

struct ServerState {
    config: ServerConfig,
    router: HubRouter,
    queue: Arc<MessageQueue>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    notification_pool: WorkerPool,
    event_pool: WorkerPool,
    server_info: ServerInfo,
}

/// The hub's client-facing transport
pub struct StreamableServer {
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    server_task: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl StreamableServer {
    /// Create a server; `start` binds and begins serving.
    pub fn new(config: ServerConfig, router: HubRouter, queue: Arc<MessageQueue>) -> Self {
        let state = Arc::new(ServerState {
            notification_pool: WorkerPool::new(
                "notifications",
                config.notification_workers,
                config.notification_queue,
            ),
            event_pool: WorkerPool::new("events", config.event_workers, config.event_queue),
            config,
            router,
            queue,
            sessions: RwLock::new(HashMap::new()),
            server_info: ServerInfo::new("mcp-hub", env!("CARGO_PKG_VERSION")),
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            shutdown,
            server_task: None,
            background: Vec::new(),
            local_addr: None,
        }
    }

    /// Bind the configured port (or the next free one) and serve.
    /// Returns the bound address.
    pub async fn start(&mut self) -> HubResult<SocketAddr> {
        let listener = bind_with_fallback(self.state.config.port).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);

        let app = Router::new()
            .route("/mcp", post(handle_mcp_post).get(handle_mcp_sse))
            .route("/health", get(handle_health))
            .route("/mcp/connect", get(handle_legacy_connect))
            .route("/mcp/events", get(handle_mcp_sse))
            .route("/mcp/logs", get(handle_legacy_logs))
            .route("/mcp/processes", get(handle_legacy_processes))
            .route("/mcp/scripts", get(handle_legacy_scripts))
            .route("/mcp/execute", post(handle_legacy_execute))
            .route("/mcp/stop", post(handle_legacy_stop))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .with_state(self.state.clone());

        let mut shutdown_rx = self.shutdown.subscribe();
        let server_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(%err, "http server exited with error");
            }
        });
        self.server_task = Some(server_task);

        self.background.push(spawn_update_aggregator(
            self.state.clone(),
            self.shutdown.subscribe(),
        ));
        for channel in EVENT_CHANNELS {
            self.background.push(spawn_queue_pump(
                self.state.clone(),
                channel,
                self.shutdown.subscribe(),
            ));
        }

        info!(%addr, "streamable server started");
        Ok(addr)
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live SSE sessions
    pub async fn session_count(&self) -> usize {
        self.state.sessions.read().await.len()
    }

    /// Queue a resource-update notification toward subscribed sessions;
    /// deliveries are coalesced within the aggregation window.
    pub async fn publish_resource_update(&self, uri: &str) {
        let sessions = self.state.sessions.read().await;
        for session in sessions.values() {
            if session.wants(uri) {
                session.push_update(uri);
            }
        }
    }

    /// Graceful shutdown: stop pools and pumps, close sessions within
    /// the grace period, then stop the HTTP server.
    pub async fn stop(&mut self) {
        let grace = Duration::from_millis(self.state.config.shutdown_grace_ms);
        let _ = self.shutdown.send(true);

        self.state.notification_pool.stop(grace).await;
        self.state.event_pool.stop(grace).await;

        for task in self.background.drain(..) {
            task.abort();
        }

        // Dropping the senders ends each session's SSE stream.
        self.state.sessions.write().await.clear();

        if let Some(task) = self.server_task.take()
            && tokio::time::timeout(grace, task).await.is_err()
        {
            warn!("http server did not stop within grace period");
        }
        info!("streamable server stopped");
    }
}

async fn bind_with_fallback(port: u16) -> HubResult<tokio::net::TcpListener> {
    if port == 0 {
        return Ok(tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?);
    }
    for candidate in port..port.saturating_add(100) {
        match tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                if candidate != port {
                    warn!(requested = port, bound = candidate, "port occupied, moved");
                }
                return Ok(listener);
            }
            Err(_) => continue,
        }
    }
    Err(HubError::connection(format!(
        "no free port in {port}..{}",
        port.saturating_add(100)
    )))
}

// ============================================================================
// Session plumbing
// ============================================================================

impl ServerState {
    async fn create_session(self: &Arc<Self>) -> (Arc<Session>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            events: tx,
            pending_updates: StdMutex::new(Vec::new()),
            subscriptions: StdMutex::new(HashSet::new()),
        });
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        info!(session = %session.id, "sse session established");
        (session, rx)
    }

    async fn remove_session(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            debug!(session = %session_id, "sse session removed");
        }
    }

    /// Fan an SSE event out to every session through the notification
    /// pool, with a per-session send timeout.
    fn broadcast(self: &Arc<Self>, event: SessionEvent) {
        let state = self.clone();
        let submitted = self.notification_pool.submit(async move {
            let sessions: Vec<Arc<Session>> =
                state.sessions.read().await.values().cloned().collect();
            let timeout = Duration::from_millis(state.config.session_send_timeout_ms);
            for session in sessions {
                match session.events.send_timeout(event.clone(), timeout).await {
                    Ok(()) => {}
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        warn!(session = %session.id, "session send timed out");
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        state.remove_session(&session.id).await;
                    }
                }
            }
        });
        if let Err(err) = submitted {
            warn!(%err, "notification dropped");
        }
    }
}

fn spawn_update_aggregator(
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let window = Duration::from_millis(state.config.update_aggregation_ms.max(1));
        let mut ticker = tokio::time::interval(window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let sessions: Vec<Arc<Session>> =
                state.sessions.read().await.values().cloned().collect();
            let mut dead = Vec::new();
            for session in sessions {
                if session.events.is_closed() {
                    dead.push(session.id.clone());
                    continue;
                }
                let uris = session.take_updates();
                if uris.is_empty() {
                    continue;
                }
                let event = SessionEvent {
                    event: methods::RESOURCES_UPDATED.to_string(),
                    data: json!({ "uris": uris }).to_string(),
                };
                if session.events.try_send(event).is_err() {
                    debug!(session = %session.id, "update flush dropped");
                }
            }
            for id in dead {
                state.remove_session(&id).await;
            }
        }
    })
}

/// Forward queue deliveries on one channel to all sessions: the event
/// pool shapes the message, the notification pool fans it out.
fn spawn_queue_pump(
    state: Arc<ServerState>,
    channel: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = state.queue.subscribe(channel).await;
        loop {
            let message = tokio::select! {
                message = subscription.recv() => message,
                _ = shutdown.changed() => {
                    let _ = state.queue.unsubscribe(&subscription.id).await;
                    return;
                }
            };
            let Some(message) = message else { return };

            let fan_out = state.clone();
            let submitted = state.event_pool.submit(async move {
                let data = match serde_json::to_string(&message) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(%err, "unserializable queue message");
                        return;
                    }
                };
                fan_out.broadcast(SessionEvent {
                    event: format!("notifications/{channel}"),
                    data,
                });
            });
            if let Err(err) = submitted {
                warn!(channel, %err, "event dropped");
            }
        }
    })
}

// ============================================================================
// POST handling
// ============================================================================

async fn handle_mcp_post(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session_hint = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Ok(parsed) = serde_json::from_slice::<Value>(&body) else {
        return Json(parse_error()).into_response();
    };

    match parsed {
        Value::Array(items) => {
            if items.is_empty() {
                return StatusCode::OK.into_response();
            }
            let mut responses = Vec::new();
            for item in items {
                if let Some(response) = dispatch_value(&state, item, session_hint.as_deref()).await
                {
                    responses.push(response);
                }
            }
            if responses.is_empty() {
                StatusCode::OK.into_response()
            } else {
                Json(responses).into_response()
            }
        }
        value => match dispatch_value(&state, value, session_hint.as_deref()).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::OK.into_response(),
        },
    }
}

fn parse_error() -> JsonRpcMessage {
    JsonRpcMessage::Error(JsonRpcError::error(
        Value::Null,
        error_codes::PARSE_ERROR,
        "Parse error".to_string(),
        None,
    ))
}

/// Dispatch one decoded JSON value; `None` means no response is owed
/// (notification input).
async fn dispatch_value(
    state: &Arc<ServerState>,
    value: Value,
    session_hint: Option<&str>,
) -> Option<JsonRpcMessage> {
    let Value::Object(ref object) = value else {
        // Null and other non-object bodies are undecodable messages.
        return Some(parse_error());
    };
    let Some(method) = object.get("method").and_then(Value::as_str).map(String::from) else {
        return Some(JsonRpcMessage::Error(JsonRpcError::error(
            object.get("id").cloned().unwrap_or(Value::Null),
            error_codes::INVALID_REQUEST,
            "Invalid Request".to_string(),
            None,
        )));
    };
    let params = object.get("params").cloned();
    let id = object.get("id").cloned();

    // Notifications produce no response.
    let Some(id) = id else {
        debug!(%method, "notification received");
        return None;
    };

    let session_id = session_hint
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let started = Instant::now();
    let outcome = handle_method(state, &method, params, &session_id).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    global_metrics().record_request(&method).await;
    let _ = state
        .queue
        .send(
            ACTIVITY_CHANNEL,
            "request",
            json!({
                "method": method,
                "sessionId": session_id,
                "durationMs": duration_ms,
            }),
            0,
        )
        .await;

    Some(match outcome {
        Ok(result) => JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: crate::protocol::types::JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
        }),
        Err((code, message)) => {
            JsonRpcMessage::Error(JsonRpcError::error(id, code, message, None))
        }
    })
}

type MethodOutcome = Result<Value, (i32, String)>;

fn require_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, (i32, String)> {
    let value = params.ok_or((
        error_codes::INVALID_PARAMS,
        "missing params".to_string(),
    ))?;
    serde_json::from_value(value)
        .map_err(|e| (error_codes::INVALID_PARAMS, format!("invalid params: {e}")))
}

fn hub_error(err: HubError) -> (i32, String) {
    (err.json_rpc_code(), err.to_string())
}

async fn handle_method(
    state: &Arc<ServerState>,
    method: &str,
    params: Option<Value>,
    session_id: &str,
) -> MethodOutcome {
    match method {
        methods::INITIALIZE => {
            if let Some(params) = params {
                let _: InitializeParams = serde_json::from_value(params).map_err(|e| {
                    (error_codes::INVALID_PARAMS, format!("invalid params: {e}"))
                })?;
            }
            let result = InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities::hub_default(),
                server_info: state.server_info.clone(),
            };
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        methods::PING => Ok(json!({})),
        methods::TOOLS_LIST => {
            let result = ListToolsResult {
                tools: state.router.list_tools().await,
                next_cursor: None,
            };
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        methods::TOOLS_CALL => {
            let params: CallToolParams = require_params(params)?;
            let arguments = params
                .arguments
                .map(|args| serde_json::to_value(args).unwrap_or(Value::Null));
            let result = state
                .router
                .call_tool(&params.name, arguments)
                .await
                .map_err(hub_error)?;
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        methods::RESOURCES_LIST => {
            let result = ListResourcesResult {
                resources: state.router.list_resources().await,
                next_cursor: None,
            };
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        methods::RESOURCES_READ => {
            let params: ResourceParams = require_params(params)?;
            let result = state
                .router
                .read_resource(&params.uri)
                .await
                .map_err(hub_error)?;
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        methods::RESOURCES_SUBSCRIBE => {
            let params: ResourceParams = require_params(params)?;
            if let Some(session) = state.sessions.read().await.get(session_id) {
                session.subscribe(&params.uri);
            } else {
                debug!(session = %session_id, uri = %params.uri, "subscribe without sse session");
            }
            Ok(json!({}))
        }
        methods::RESOURCES_UNSUBSCRIBE => {
            let params: ResourceParams = require_params(params)?;
            if let Some(session) = state.sessions.read().await.get(session_id) {
                session.unsubscribe(&params.uri);
            }
            Ok(json!({}))
        }
        methods::PROMPTS_LIST => {
            let result = ListPromptsResult {
                prompts: state.router.list_prompts().await,
                next_cursor: None,
            };
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        methods::PROMPTS_GET => {
            let params: GetPromptParams = require_params(params)?;
            let result = state.router.get_prompt(params).await.map_err(hub_error)?;
            serde_json::to_value(result)
                .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        unknown => Err((
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {unknown}"),
        )),
    }
}

// ============================================================================
// SSE handling
// ============================================================================

async fn handle_mcp_sse(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let (session, rx) = state.create_session().await;

    let established = SessionEvent {
        event: methods::CONNECTION_ESTABLISHED.to_string(),
        data: json!({ "sessionId": session.id }).to_string(),
    };

    let heartbeat = Duration::from_millis(state.config.heartbeat_interval_ms.max(1));
    let first_tick = tokio::time::Instant::now() + heartbeat;
    let ticker = tokio::time::interval_at(first_tick, heartbeat);

    // The stream ends when the session's sender side is dropped, which
    // is how shutdown and eviction close the connection.
    let events = stream::unfold((rx, ticker), |(mut rx, mut ticker)| async move {
        tokio::select! {
            message = rx.recv() => message.map(|event| (event, (rx, ticker))),
            _ = ticker.tick() => Some((
                SessionEvent { event: "ping".to_string(), data: "{}".to_string() },
                (rx, ticker),
            )),
        }
    });

    let stream = stream::once(async move { established })
        .chain(events)
        .map(|event| Ok::<Event, Infallible>(Event::default().event(event.event).data(event.data)));

    (
        [
            ("Cache-Control", "no-cache"),
            ("Connection", "keep-alive"),
            ("X-Accel-Buffering", "no"),
        ],
        Sse::new(stream),
    )
}

// ============================================================================
// Health and legacy projections
// ============================================================================

async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let sessions = state.sessions.read().await.len();
    Json(json!({
        "status": "ok",
        "sessions": sessions,
        "mode": "hub",
    }))
}

async fn handle_legacy_connect() -> Json<Value> {
    Json(json!({
        "sessionId": uuid::Uuid::new_v4().to_string(),
        "endpoint": "/mcp",
    }))
}

async fn handle_legacy_logs(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let messages = state
        .queue
        .receive("logs", 100, false, Duration::ZERO)
        .await;
    Json(json!({ "logs": messages }))
}

async fn handle_legacy_processes(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let messages = state
        .queue
        .receive("processes", 100, false, Duration::ZERO)
        .await;
    Json(json!({ "processes": messages }))
}

async fn handle_legacy_scripts(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let names: Vec<String> = state
        .router
        .list_tools()
        .await
        .into_iter()
        .map(|tool| tool.name)
        .collect();
    Json(json!({ "scripts": names }))
}

async fn handle_legacy_execute(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Value>,
) -> Response {
    let Some(name) = body.get("name").and_then(Value::as_str) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing tool name"})),
        )
            .into_response();
    };
    match state.router.call_tool(name, body.get("arguments").cloned()).await {
        Ok(result) => Json(serde_json::to_value(result).unwrap_or(Value::Null)).into_response(),
        Err(err) => Json(json!({"error": err.to_string()})).into_response(),
    }
}

async fn handle_legacy_stop(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    if let Some(session_id) = body.get("sessionId").and_then(Value::as_str) {
        state.remove_session(session_id).await;
        state.router.manager().disconnect_session(session_id).await;
    }
    Json(json!({"ok": true}))
}
