use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{ClientEvent, ErrorMessage, ErrorResponse, ServerEvent};
use crate::services::auth_service::{get_auth_token, verify_token, AuthError, VerifiedUser};
use crate::utils::scope_guard::ScopeGuard;
use crate::ws::{EngineCommand, EngineHandle, Outbound};
use crate::AppState;

/// Query parameters of the websocket endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub client_id: Option<String>,
    pub token: Option<String>,
}

/// WebSocket handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    info!("New WebSocket connection attempt");

    let user = match identify(&params, &headers, state.config.auth_jwt_secret.as_deref()) {
        Ok(user) => Some(user),
        Err(e) if state.config.auth_required => {
            warn!("Rejecting websocket upgrade: {}", e);
            return ErrorResponse::with_status(StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
        Err(e) => {
            debug!("Proceeding unauthenticated: {}", e);
            None
        }
    };

    let client_id = params
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, state.engine, client_id, user))
}

/// The `token` query parameter wins over headers and cookies
fn identify(params: &WsParams, headers: &HeaderMap, secret: Option<&str>) -> Result<VerifiedUser, AuthError> {
    let token = match params.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => token.to_string(),
        None => get_auth_token(headers)?,
    };
    verify_token(&token, secret)
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, engine: EngineHandle, client_id: String, user: Option<VerifiedUser>) {
    let conn_id = engine.next_conn_id();
    let (outbox, mut outbound) = mpsc::unbounded_channel::<Outbound>();
    let errors = outbox.clone();

    let registered = engine.send(EngineCommand::Connect {
        conn_id,
        client_id: client_id.clone(),
        user_id: user.map(|u| u.uid),
        outbox,
    });
    if let Err(e) = registered {
        error!("Dropping connection {}: {}", conn_id, e);
        return;
    }
    info!("WebSocket connection {} established for client {}", conn_id, client_id);

    // Abnormal drops must still reach the engine
    let disconnect_engine = engine.clone();
    let _disconnect = ScopeGuard::new(move || {
        let _ = disconnect_engine.send(EngineCommand::Disconnect { conn_id });
    });

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Drain the outbox into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(next) = outbound.recv().await {
            match next {
                Outbound::Event(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to serialize {} for connection {}: {}", event.name(), conn_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::POLICY,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Forward client events to the engine
    let recv_engine = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    debug!("Connection {} sent {:?}", conn_id, event);
                    if recv_engine.send(EngineCommand::Client { conn_id, event }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to parse message from connection {}: {}", conn_id, e);
                    let _ = errors.send(Outbound::Event(ServerEvent::Error(ErrorMessage {
                        message: format!("Invalid message: {}", e),
                    })));
                }
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
    info!("WebSocket connection {} terminated", conn_id);
}
