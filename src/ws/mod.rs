pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::state::{AppState, ConnectionContext};

const MAX_USERNAME_CHARS: usize = 32;

/// Identity is established upstream; the edge trusts these parameters.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
    pub username: Option<String>,
}

impl WsQuery {
    fn identity(&self) -> Option<(String, String)> {
        let user_id = self.user_id.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let username = self
            .username
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(user_id);
        Some((
            user_id.to_string(),
            username.chars().take(MAX_USERNAME_CHARS).collect(),
        ))
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some((user_id, username)) = params.identity() else {
        tracing::warn!("WebSocket request without user_id rejected");
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    };

    tracing::info!("WebSocket connection request: user={} ({})", username, user_id);

    let ctx = ConnectionContext {
        connection_id: ulid::Ulid::new().to_string(),
        user_id,
        username,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, state))
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            true
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, ctx: ConnectionContext, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut outbound = state.hub.register(&ctx.connection_id).await;

    let current_session = match state.ensure_user(&ctx.user_id, &ctx.username).await {
        Ok(user) => user.current_session,
        Err(e) => {
            tracing::error!("Failed to load user {}: {}", ctx.user_id, e);
            None
        }
    };

    let welcome = ServerMessage::Welcome {
        protocol: PROTOCOL_VERSION.to_string(),
        user_id: ctx.user_id.clone(),
        username: ctx.username.clone(),
        server_now: chrono::Utc::now().to_rfc3339(),
        current_session,
    };
    if !send_json(&mut sender, &welcome).await {
        tracing::error!("Failed to send welcome message");
        state.disconnect(&ctx.connection_id).await;
        return;
    }

    tracing::info!(
        "WebSocket connected: {} ({}) as {}",
        ctx.username,
        ctx.user_id,
        ctx.connection_id
    );

    loop {
        tokio::select! {
            // Messages addressed to this connection or its session channel
            queued = outbound.recv() => {
                match queued {
                    Some(msg) => {
                        if !send_json(&mut sender, &msg).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Handle client messages
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message from {}: {}", ctx.user_id, text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => handlers::handle_message(client_msg, &ctx, &state).await,
                            Err(e) => {
                                tracing::warn!("Failed to parse client message: {}", e);
                                Some(ServerMessage::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    msg: format!("Invalid message format: {}", e),
                                })
                            }
                        };
                        if let Some(response) = response {
                            if !send_json(&mut sender, &response).await {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.disconnect(&ctx.connection_id).await;
    tracing::info!("WebSocket connection closed for {} ({})", ctx.username, ctx.user_id);
}
