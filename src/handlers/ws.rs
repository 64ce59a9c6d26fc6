use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{error, info};

use crate::collab::registry::SessionHandle;
use crate::collab::CollabEngine;
use crate::models::{ClientEvent, ErrorMessage, ServerEvent};
use crate::services::auth_service::AuthUser;

/// WebSocket handler
///
/// Authentication already happened in the middleware; an unauthenticated
/// caller never reaches the upgrade.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Extension(user): Extension<AuthUser>,
    State(engine): State<Arc<CollabEngine>>,
) -> Response {
    info!("New WebSocket connection attempt by {}", user.email);
    ws.on_upgrade(move |socket| handle_socket(socket, user, engine))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, user: AuthUser, engine: Arc<CollabEngine>) {
    // The session's channel carries every outbound event; the receiver is
    // drained into the socket by the send task below.
    let (session, mut outbox) = SessionHandle::new(user);

    info!(
        "WebSocket connection established for {} with connection_id: {}",
        session.user.email, session.conn_id
    );

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Pump queued server events out to the client
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize outbound event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // Read incoming frames and hand parsed events to the engine. Only text
    // frames are processed; anything else ends the loop and tears the
    // connection down.
    let session2 = session.clone();
    let engine2 = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(Message::Text(msg))) = receiver.next().await {
            let event: ClientEvent = match serde_json::from_str(&msg) {
                Ok(event) => event,
                Err(e) => {
                    error!(
                        "Failed to parse message from {}: {}",
                        session2.user.email, e
                    );
                    session2.send(ServerEvent::Error(ErrorMessage {
                        message: format!("Unrecognized message: {}", e),
                    }));
                    continue;
                }
            };
            engine2.handle_event(&session2, event).await;
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    // Cascade: presence leaves every joined room and held locks are freed.
    engine.disconnect(&session).await;

    info!(
        "WebSocket connection terminated for {} ({})",
        session.user.email, session.conn_id
    );
}
