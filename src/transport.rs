//! WebSocket and HTTP transport.
//!
//! ```text
//! GET /ws                    first frame {client_id, window}, then {timestamp, value} frames
//! GET /sessions              active client ids
//! GET /sessions/{client_id}  session snapshot
//! GET /history/{client_id}   persisted results
//! GET /stats                 registry counters
//! GET /metrics               Prometheus text
//! GET /health
//! ```
//!
//! A rejected handshake closes the socket with code 4001. A malformed point
//! frame gets an error reply and the connection stays open. Disconnecting
//! deactivates the session.

use crate::error::EngineError;
use crate::flow::{Admission, FlowOutput, IngestFlow};
use crate::persistence::HistoryStore;
use crate::pipeline::Engine;
use crate::signal::{DataPoint, PointPayload, PointVerdict, SessionInit};
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Close code sent when the session-initiation frame is rejected.
pub const CLOSE_INVALID_SESSION: u16 = 4001;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn HistoryStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{client_id}", get(session_snapshot))
        .route("/history/{client_id}", get(history))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

// ============================================================================
// WIRE REPLIES
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
}

impl ErrorReply {
    fn invalid_point(e: &EngineError) -> Self {
        Self {
            error: "Invalid data point".into(),
            kind: e.kind(),
            timestamp: None,
        }
    }

    fn rejected(timestamp: f64, e: &EngineError) -> Self {
        Self {
            error: e.to_string(),
            kind: e.kind(),
            timestamp: Some(timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
struct BackpressureReply {
    backpressure: Dropped,
}

#[derive(Debug, Serialize)]
struct Dropped {
    dropped_timestamp: f64,
}

/// `EngineError` as an HTTP response.
struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DuplicateSession(_) => StatusCode::CONFLICT,
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Validation(_)
            | EngineError::Configuration(_)
            | EngineError::SessionInactive(_) => StatusCode::BAD_REQUEST,
        };
        let body = ErrorReply {
            error: self.0.to_string(),
            kind: self.0.kind(),
            timestamp: None,
        };
        (status, Json(body)).into_response()
    }
}

fn parse_init(raw: &[u8]) -> Result<SessionInit, EngineError> {
    let mut buf = raw.to_vec();
    simd_json::from_slice::<SessionInit>(&mut buf)
        .map_err(|_| EngineError::Validation("invalid session request".into()))
}

fn parse_point(raw: &[u8]) -> Result<DataPoint, EngineError> {
    let mut buf = raw.to_vec();
    let payload = simd_json::from_slice::<PointPayload>(&mut buf)
        .map_err(|_| EngineError::Validation("Invalid data point".into()))?;
    DataPoint::try_from(payload)
}

// ============================================================================
// WEBSOCKET
// ============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to encode reply.");
            return Ok(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn close_with(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Reads the session-initiation frame and opens the session.
async fn handshake(socket: &mut WebSocket, engine: &Engine) -> Result<String, EngineError> {
    let raw = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => break text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Binary(bytes))) => break bytes.to_vec(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => {
                return Err(EngineError::Validation(
                    "connection closed before session request".into(),
                ));
            }
        }
    };

    let init = parse_init(&raw)?;
    let registration = engine.open_session(&init)?;
    Ok(registration.session().client_id().to_string())
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connection = uuid::Uuid::new_v4();
    let client_id = match handshake(&mut socket, &state.engine).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%connection, error = %e, "Rejected session request.");
            close_with(socket, CLOSE_INVALID_SESSION, e.to_string()).await;
            return;
        }
    };

    let (flow, mut outputs) = match IngestFlow::start(Arc::clone(&state.engine), &client_id) {
        Ok(started) => started,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "Could not start ingest flow.");
            close_with(socket, CLOSE_INVALID_SESSION, e.to_string()).await;
            return;
        }
    };
    info!(%connection, client_id = %client_id, "Client connected.");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let raw = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    _ => break,
                };

                let sent = match parse_point(&raw).and_then(|point| flow.submit(point)) {
                    Ok(Admission::Queued) => Ok(()),
                    Ok(Admission::DroppedOldest(dropped)) => {
                        let reply = BackpressureReply {
                            backpressure: Dropped {
                                dropped_timestamp: dropped.timestamp,
                            },
                        };
                        send_json(&mut socket, &reply).await
                    }
                    Err(e @ EngineError::SessionInactive(_)) => {
                        let reply = ErrorReply {
                            error: e.to_string(),
                            kind: e.kind(),
                            timestamp: None,
                        };
                        send_json(&mut socket, &reply).await
                    }
                    Err(e) => {
                        crate::metrics::REJECTED_TOTAL.inc();
                        send_json(&mut socket, &ErrorReply::invalid_point(&e)).await
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
            output = outputs.recv() => {
                let sent = match output {
                    Some(FlowOutput::Verdict(result)) => {
                        send_json(&mut socket, &PointVerdict::from(&result)).await
                    }
                    Some(FlowOutput::Rejected { timestamp, error }) => {
                        send_json(&mut socket, &ErrorReply::rejected(timestamp, &error)).await
                    }
                    None => break,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    flow.close();
    if let Err(e) = state.engine.close_session(&client_id) {
        warn!(client_id = %client_id, error = %e, "Failed to deactivate session.");
    }
    info!(%connection, client_id = %client_id, "Client disconnected.");
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Serialize)]
struct SessionsReply {
    active: Vec<String>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsReply> {
    Json(SessionsReply {
        active: state.engine.list_active().into_iter().collect(),
    })
}

async fn session_snapshot(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    match state.engine.snapshot(&client_id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn history(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    let store = Arc::clone(&state.store);
    let records = tokio::task::spawn_blocking(move || store.history(&client_id)).await;
    match records {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "History query failed.");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "History task failed.");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.engine.stats()).into_response()
}

async fn metrics_handler() -> String {
    crate::metrics::render()
}

async fn health_handler() -> &'static str {
    "OK"
}
