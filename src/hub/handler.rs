//! Subscriber Stream Handler
//!
//! `GET /api/v1/stream/:sid` upgrades to a WebSocket that carries every event
//! delivered to subscriber `sid`, plus a small control protocol for
//! subscribing to feeds over the socket itself.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::messages::{ClientMessage, ServerMessage};
use crate::api::AppState;
use crate::engine::FeedEngine;

/// WebSocket upgrade handler for a subscriber's event stream
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Path(subscriber_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let engine = Arc::clone(&state.engine);
    ws.on_upgrade(move |socket| handle_socket(socket, engine, subscriber_id))
}

fn to_text<T: Serialize>(message: &T) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize message");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, engine: Arc<FeedEngine>, subscriber_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let hub = Arc::clone(engine.hub());

    let (connection_id, mut events) = match hub.connect(&subscriber_id).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!(subscriber_id = %subscriber_id, error = %e, "Subscriber rejected");
            if let Some(message) = to_text(&ServerMessage::Error {
                message: e.to_string(),
            }) {
                let _ = sender.send(message).await;
            }
            return;
        }
    };

    // Control replies share the socket with events
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let _ = control_tx.send(ServerMessage::Connected {
        subscriber_id: subscriber_id.clone(),
    });

    let sid_for_send = subscriber_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => to_text(&event),
                    // Replaced by a newer connection for this subscriber
                    None => break,
                },
                control = control_rx.recv() => match control {
                    Some(control) => to_text(&control),
                    None => break,
                },
            };

            if let Some(message) = message {
                if sender.send(message).await.is_err() {
                    tracing::debug!(subscriber_id = %sid_for_send, "Stream send failed, closing");
                    break;
                }
            }
        }
    });

    let sid_for_recv = subscriber_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(message) => {
                    if !handle_ws_message(&engine, &sid_for_recv, &control_tx, message).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(subscriber_id = %sid_for_recv, error = %e, "Stream receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.disconnect(&subscriber_id, &connection_id).await;
}

/// Returns false if the connection should be closed
async fn handle_ws_message(
    engine: &FeedEngine,
    subscriber_id: &str,
    control: &mpsc::UnboundedSender<ServerMessage>,
    message: Message,
) -> bool {
    let reply = match message {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client) => handle_client_message(engine, subscriber_id, client).await,
            Err(e) => ServerMessage::Error {
                message: format!("Invalid message format: {}", e),
            },
        },
        Message::Binary(_) => ServerMessage::Error {
            message: "Binary messages not supported".to_string(),
        },
        Message::Ping(_) | Message::Pong(_) => return true,
        Message::Close(_) => {
            tracing::debug!(subscriber_id = %subscriber_id, "Subscriber requested close");
            return false;
        }
    };

    control.send(reply).is_ok()
}

async fn handle_client_message(
    engine: &FeedEngine,
    subscriber_id: &str,
    message: ClientMessage,
) -> ServerMessage {
    let result = match &message {
        ClientMessage::Subscribe { feed_id } => engine.subscribe(feed_id, subscriber_id).await,
        ClientMessage::Unsubscribe { feed_id } => engine.unsubscribe(feed_id, subscriber_id).await,
        ClientMessage::Ping => return ServerMessage::Pong,
    };

    match (result, message) {
        (Err(e), _) => ServerMessage::Error {
            message: e.to_string(),
        },
        (Ok(()), ClientMessage::Subscribe { feed_id }) => ServerMessage::Subscribed { feed_id },
        (Ok(()), ClientMessage::Unsubscribe { feed_id }) => ServerMessage::Unsubscribed { feed_id },
        (Ok(()), ClientMessage::Ping) => ServerMessage::Pong,
    }
}
