//! Gateway WebSocket server — Axum-based HTTP + WS server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use swarm_core::{AgentStatus, Swarm, TransportEvent};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::clients::ClientRegistry;
use crate::events::EventBus;
use crate::protocol::{
    self, ERR_INVALID_METHOD, ERR_INVALID_PARAMS, GatewayEvent, GatewayRequest, GatewayResponse,
};

/// Shared state for all WebSocket connections
#[derive(Clone)]
pub struct GatewayState {
    pub swarm: Arc<Swarm>,
    pub events: EventBus,
    pub clients: ClientRegistry,
    pub start_time: std::time::Instant,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    /// `events` must be the same bus the swarm was built with, otherwise
    /// clients never see stream or status events.
    pub fn new(bind: SocketAddr, swarm: Arc<Swarm>, events: EventBus) -> Self {
        let state = GatewayState {
            swarm,
            events,
            clients: ClientRegistry::new(),
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.state.events
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.state.clients
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/health", get(health_handler))
            .route("/api/status", get(status_handler))
            .route("/api/agents", get(agents_handler))
            .route("/api/agents/{id}", get(agent_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Start the server (blocks until shutdown)
    pub async fn run(self) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Gateway listening on {}", self.bind);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

fn health_payload(state: &GatewayState) -> Value {
    json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    })
}

async fn status_payload(state: &GatewayState) -> Value {
    json!({
        "status": "ok",
        "swarm": state.swarm.status(),
        "active_streams": state.swarm.streams().session_count().await,
        "connected_clients": state.clients.count().await,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    })
}

/// Profile, live state and performance of one agent
fn agent_detail(state: &GatewayState, agent_id: &str) -> Option<Value> {
    let agent = state.swarm.registry().get(agent_id)?;
    let performance = state.swarm.performance(agent_id).ok()?;
    Some(json!({ "agent": agent, "performance": performance }))
}

// ── HTTP Handlers ──

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(health_payload(&state))
}

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(status_payload(&state).await)
}

async fn agents_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(json!({ "agents": state.swarm.agents() }))
}

async fn agent_handler(
    State(state): State<GatewayState>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    match agent_detail(&state, &agent_id) {
        Some(detail) => (StatusCode::OK, axum::Json(detail)),
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": format!("Agent not found: {}", agent_id) })),
        ),
    }
}

// ── WebSocket Handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!("WebSocket connection from {}", addr);
    ws.on_upgrade(move |socket| handle_ws(socket, state, addr))
}

/// Serialized form of an event if this client should receive it
fn deliverable(event: TransportEvent, client_id: &str) -> Option<String> {
    if !event.target.includes(client_id) {
        return None;
    }
    match serde_json::to_string(&GatewayEvent::from(event)) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            None
        }
    }
}

async fn handle_ws(socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let client = state.clients.connect(addr).await;
    let client_id = client.id.clone();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<String>();

    let hello = GatewayEvent::new(
        protocol::events::CONNECTED,
        json!({ "client_id": client_id }),
    );
    if let Ok(json) = serde_json::to_string(&hello) {
        let _ = direct_tx.send(json);
    }

    // Forward direct responses and matching bus events to this client
    let forward_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(json) => json,
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Ok(event) => match deliverable(event, &forward_id) {
                        Some(json) => json,
                        None => continue,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged by {} events", forward_id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if ws_sender.send(Message::Text(outgoing.into())).await.is_err() {
                break;
            }
        }
    });

    // Process incoming messages from this client
    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Close(_)) => {
                debug!("Client {} closed the connection", client_id);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error from {}: {}", addr, e);
                break;
            }
        };

        state.clients.record_activity(&client_id).await;

        // A batch dispatch can take a while; keep reading so stream.stop gets through
        let state = state.clone();
        let client_id = client_id.clone();
        let direct_tx = direct_tx.clone();
        tokio::spawn(async move {
            let response = handle_request(&state, &client_id, &msg).await;
            match serde_json::to_string(&response) {
                Ok(json) => {
                    let _ = direct_tx.send(json);
                }
                Err(e) => error!("Failed to serialize response: {}", e),
            }
        });
    }

    send_task.abort();
    client_disconnected(&state, &client_id).await;
}

/// Release everything a departed client left behind
async fn client_disconnected(state: &GatewayState, client_id: &str) {
    let stopped = state.swarm.disconnect(client_id).await;
    if stopped > 0 {
        info!("Stopped {} streams of departed client {}", stopped, client_id);
    }
    state.clients.disconnect(client_id).await;
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Optional array of strings, e.g. `targets` or `capabilities`
fn string_list_param(params: &Value, key: &str) -> Result<Option<Vec<String>>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("'{}' must contain only strings", key))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(format!("'{}' must be an array", key)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

async fn handle_request(state: &GatewayState, client_id: &str, raw: &str) -> GatewayResponse {
    let req: GatewayRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            return GatewayResponse::err(None, ERR_INVALID_PARAMS, format!("Invalid JSON: {}", e));
        }
    };

    let id = req.id.clone();
    debug!("Client {} called {}", client_id, req.method);

    match req.method.as_str() {
        protocol::methods::STATUS_GET => GatewayResponse::ok(id, status_payload(state).await),

        protocol::methods::AGENTS_LIST => GatewayResponse::ok(id, to_json(&state.swarm.agents())),

        protocol::methods::AGENT_PERFORMANCE => {
            let Some(agent_id) = str_param(&req.params, "agent_id") else {
                return GatewayResponse::err(id, ERR_INVALID_PARAMS, "Missing 'agent_id' parameter");
            };
            match state.swarm.performance(agent_id) {
                Ok(report) => GatewayResponse::ok(id, to_json(&report)),
                Err(e) => GatewayResponse::from_error(id, &e),
            }
        }

        protocol::methods::AGENT_STATUS_SET => {
            let Some(agent_id) = str_param(&req.params, "agent_id") else {
                return GatewayResponse::err(id, ERR_INVALID_PARAMS, "Missing 'agent_id' parameter");
            };
            let Some(status) = str_param(&req.params, "status").and_then(AgentStatus::from_string)
            else {
                return GatewayResponse::err(
                    id,
                    ERR_INVALID_PARAMS,
                    "'status' must be one of idle, busy, error, offline",
                );
            };
            match state.swarm.set_agent_status(agent_id, status) {
                Ok(()) => GatewayResponse::ok(id, json!({ "agent_id": agent_id, "status": status })),
                Err(e) => GatewayResponse::from_error(id, &e),
            }
        }

        protocol::methods::MESSAGE_SEND => {
            let content = match str_param(&req.params, "content") {
                Some(c) if !c.trim().is_empty() => c,
                _ => {
                    return GatewayResponse::err(
                        id,
                        ERR_INVALID_PARAMS,
                        "Missing or empty 'content' parameter",
                    );
                }
            };
            let targets = match string_list_param(&req.params, "targets") {
                Ok(t) => t,
                Err(msg) => return GatewayResponse::err(id, ERR_INVALID_PARAMS, msg),
            };
            let capabilities = match string_list_param(&req.params, "capabilities") {
                Ok(c) => c.unwrap_or_default(),
                Err(msg) => return GatewayResponse::err(id, ERR_INVALID_PARAMS, msg),
            };
            let conversation_id = str_param(&req.params, "conversation_id").map(str::to_string);

            match state
                .swarm
                .handle_message(content, targets, &capabilities, conversation_id)
                .await
            {
                Ok(result) => GatewayResponse::ok(id, to_json(&result)),
                Err(e) => GatewayResponse::from_error(id, &e),
            }
        }

        protocol::methods::STREAM_START => {
            let Some(content) = str_param(&req.params, "content") else {
                return GatewayResponse::err(id, ERR_INVALID_PARAMS, "Missing 'content' parameter");
            };
            let agent_id = str_param(&req.params, "agent_id").map(str::to_string);
            let model = str_param(&req.params, "model").map(str::to_string);
            let capabilities = match string_list_param(&req.params, "capabilities") {
                Ok(c) => c.unwrap_or_default(),
                Err(msg) => return GatewayResponse::err(id, ERR_INVALID_PARAMS, msg),
            };

            match state
                .swarm
                .start_stream(client_id, content, agent_id, &capabilities, model)
                .await
            {
                // Progress arrives as events; the session runs detached
                Ok(handle) => GatewayResponse::ok(
                    id,
                    json!({ "session_id": handle.session_id, "agent_id": handle.agent_id }),
                ),
                Err(e) => GatewayResponse::from_error(id, &e),
            }
        }

        protocol::methods::STREAM_STOP => {
            let Some(session_id) = str_param(&req.params, "session_id") else {
                return GatewayResponse::err(id, ERR_INVALID_PARAMS, "Missing 'session_id' parameter");
            };
            // Other clients' sessions read as not found
            match state.swarm.stop_client_stream(client_id, session_id).await {
                Ok(()) => GatewayResponse::ok(id, json!({ "session_id": session_id, "stopped": true })),
                Err(e) => GatewayResponse::from_error(id, &e),
            }
        }

        _ => GatewayResponse::err(id, ERR_INVALID_METHOD, format!("Unknown method: {}", req.method)),
    }
}
