//! WebSocket transport for the progress subscription protocol.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use progress_gateway::{ClientMessage, ProgressGateway, ServerMessage};
use std::sync::Arc;
use tracing::{debug, warn};

/// WebSocket handler
pub async fn progress_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<ProgressGateway>) {
    let (connection_id, mut outbound) = gateway.connect().await;
    let (mut sink, mut inbound) = socket.split();

    // Outgoing: gateway -> socket
    let forward = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize server message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Incoming: socket -> gateway
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    if let Err(e) = gateway.handle_client_message(connection_id, message).await {
                        warn!(%connection_id, "Client message rejected: {}", e);
                    }
                }
                Err(e) => {
                    debug!(%connection_id, "Unparseable client message: {}", e);
                    gateway
                        .send_to(
                            connection_id,
                            ServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            },
                        )
                        .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%connection_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    gateway.disconnect(connection_id).await;
    forward.abort();
}
