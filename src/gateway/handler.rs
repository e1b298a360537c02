//! HTTP and WebSocket handlers
//!
//! REST endpoints for agent status and control, an inbound endpoint for the
//! iMessage bridge, and two WebSockets: `/ws` for chatting with agents and
//! `/ws/logs` for watching raw agent protocol lines.

use crate::channels::InboundMessage;
use crate::gateway::server::{DispatchOutcome, Gateway, InboundText};
use crate::task::{ReplyTarget, SubmitOutcome, TaskSource};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP application
pub fn router(gateway: Arc<Gateway>) -> Router {
    let cors = build_cors(&gateway.config().gateway.cors_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/restart", post(restart_agents))
        .route("/api/agents/:id/abort", post(abort_agent_task))
        .route("/api/sessions", get(list_sessions))
        .route("/api/message", post(send_message))
        .route("/api/channels/imessage/inbound", post(imessage_inbound))
        .route("/ws", get(ws_upgrade))
        .route("/ws/logs", get(ws_logs_upgrade))
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// =============================================================================
// REST handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.status())
}

async fn list_agents(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.list_agents())
}

async fn restart_agents(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let restarted = gateway.restart_agent_processes().await;
    Json(serde_json::json!({ "restarted": restarted }))
}

async fn abort_agent_task(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if gateway.get_agent(&id).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown agent: {}", id));
    }
    match gateway.abort_current_task(&id).await {
        Ok(aborted) => Json(serde_json::json!({ "aborted": aborted })).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn list_sessions(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.list_sessions())
}

/// Send message request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    text: String,
    /// Address a specific agent instead of routing by keyword
    #[serde(default)]
    agent_id: Option<String>,
    /// Reuse a conversation across requests
    #[serde(default)]
    conversation: Option<String>,
    /// How long to wait for the reply; defaults to the task timeout
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Send message response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    conversation: String,
    agent_id: Option<String>,
    task_id: Option<String>,
    reply: Option<String>,
}

/// Send text to an agent and wait for its reply
async fn send_message(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<SendMessageRequest>,
) -> axum::response::Response {
    let conversation = request
        .conversation
        .unwrap_or_else(|| format!("http:{}", uuid::Uuid::new_v4()));

    if let Some(agent_id) = &request.agent_id {
        if let Err(e) = gateway.set_active_agent(&conversation, agent_id) {
            return error_response(StatusCode::NOT_FOUND, e.to_string());
        }
    }

    let (tx, rx) = oneshot::channel();
    let inbound = InboundText::new(
        &conversation,
        TaskSource::Web,
        ReplyTarget::Detached,
        request.text,
    )
    .with_on_reply(tx);

    let (agent_id, task_id) = match gateway.dispatch(inbound).await {
        Ok(DispatchOutcome::Empty) => {
            return error_response(StatusCode::BAD_REQUEST, "Message text is empty");
        }
        Ok(DispatchOutcome::NoAgent) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "No agent available");
        }
        Ok(DispatchOutcome::Switched { agent_id }) => (Some(agent_id), None),
        Ok(DispatchOutcome::NewSession { agent_id, task }) => {
            (Some(agent_id), task.map(|t| t.task_id().to_string()))
        }
        Ok(DispatchOutcome::Submitted { agent_id, outcome }) => {
            (Some(agent_id), Some(outcome.task_id().to_string()))
        }
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    };

    let wait_ms = request
        .timeout_ms
        .unwrap_or(gateway.config().gateway.task_timeout_ms);
    let reply = if wait_ms == 0 {
        rx.await.ok()
    } else {
        match tokio::time::timeout(Duration::from_millis(wait_ms), rx).await {
            Ok(reply) => reply.ok(),
            Err(_) => {
                return error_response(StatusCode::GATEWAY_TIMEOUT, "Timed out waiting for reply");
            }
        }
    };

    Json(SendMessageResponse {
        conversation,
        agent_id,
        task_id,
        reply,
    })
    .into_response()
}

/// Inbound message from the iMessage bridge; replies go back through the bridge
async fn imessage_inbound(
    State(gateway): State<Arc<Gateway>>,
    Json(message): Json<InboundMessage>,
) -> impl IntoResponse {
    tracing::debug!(chat_id = %message.chat_id, "Received iMessage");

    let inbound = InboundText::new(
        format!("imessage:{}", message.chat_id),
        TaskSource::IMessage,
        ReplyTarget::Channel {
            chat_id: message.chat_id,
            sender: message.sender,
        },
        message.text,
    );

    // The bridge does not wait for agents
    tokio::spawn(async move {
        if let Err(e) = gateway.dispatch(inbound).await {
            tracing::warn!("Failed to dispatch iMessage: {}", e);
        }
    });

    (StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": true })))
}

// =============================================================================
// WebSocket handlers
// =============================================================================

/// Browser → gateway frames
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    /// Text for the active agent (keywords and `new` are honoured)
    Prompt { text: String },
    /// Abort the current task of an agent (the active one by default)
    Abort {
        #[serde(default, rename = "agentId")]
        agent_id: Option<String>,
    },
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_ws(socket, gateway))
}

/// Chat socket: prompts in, replies and background events out
async fn handle_client_ws(socket: WebSocket, gateway: Arc<Gateway>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let conversation = format!("web:{}", client_id);
    tracing::info!(client_id = %client_id, "WebSocket client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let hello = serde_json::json!({
        "type": "hello",
        "clientId": client_id,
        "agents": gateway.list_agents(),
    });
    let _ = tx.send(hello.to_string());

    // Replies for this socket and hub events for everyone
    let mut events = BroadcastStream::new(gateway.hub().subscribe_events());
    let send_client_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                reply = rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        if event.origin() == Some(send_client_id.as_str()) {
                            continue;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(_) => continue,
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        tracing::debug!(
                            client_id = %send_client_id,
                            skipped = n,
                            "WebSocket client lagged"
                        );
                        continue;
                    }
                    None => break,
                },
            };
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let recv_gateway = gateway.clone();
    let recv_client_id = client_id.clone();
    let recv_conversation = conversation.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let frame = match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    let preview: String = text.chars().take(200).collect();
                    tracing::warn!(
                        client_id = %recv_client_id,
                        "Invalid client frame: {} (raw: {})",
                        e,
                        preview
                    );
                    continue;
                }
            };

            match frame {
                ClientFrame::Prompt { text } => {
                    let target = ReplyTarget::Socket {
                        client_id: recv_client_id.clone(),
                        tx: tx.clone(),
                    };
                    let inbound =
                        InboundText::new(&recv_conversation, TaskSource::Web, target, text);
                    match recv_gateway.dispatch(inbound).await {
                        Ok(DispatchOutcome::Submitted {
                            agent_id,
                            outcome: SubmitOutcome::Queued { task_id, position },
                        }) => {
                            let queued = serde_json::json!({
                                "type": "queued",
                                "agentId": agent_id,
                                "taskId": task_id,
                                "position": position,
                            });
                            let _ = tx.send(queued.to_string());
                        }
                        Ok(DispatchOutcome::NoAgent) => {
                            let error = serde_json::json!({
                                "type": "error",
                                "message": "No agent available",
                            });
                            let _ = tx.send(error.to_string());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(client_id = %recv_client_id, "Dispatch failed: {}", e);
                        }
                    }
                }
                ClientFrame::Abort { agent_id } => {
                    let agent_id = agent_id
                        .or_else(|| recv_gateway.active_agent(&recv_conversation))
                        .unwrap_or_else(|| recv_gateway.registry().default_agent_id().to_string());
                    if let Err(e) = recv_gateway.abort_current_task(&agent_id).await {
                        tracing::warn!(
                            client_id = %recv_client_id,
                            agent_id = %agent_id,
                            "Abort failed: {}",
                            e
                        );
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    gateway.end_conversation(&conversation);
    tracing::info!(client_id = %client_id, "WebSocket client disconnected");
}

async fn ws_logs_upgrade(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs_ws(socket, gateway))
}

/// Log socket: every decoded agent line, read-only
async fn handle_logs_ws(socket: WebSocket, gateway: Arc<Gateway>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut lines = BroadcastStream::new(gateway.hub().subscribe_lines());

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(event)) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(_))) => continue,
                None => break,
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
