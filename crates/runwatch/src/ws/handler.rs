//! WebSocket handler for dashboard clients.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::api::AppState;

use super::hub::BroadcastHub;
use super::types::{WsCommand, WsEvent};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// WebSocket upgrade handler.
///
/// GET /api/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, hub))
}

/// Serve one client: replay history, then stream live events until either
/// side goes away.
async fn handle_ws_connection(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sender, mut receiver) = socket.split();

    let subscription = hub.subscribe();
    let conn_id = subscription.id;
    let mut events = subscription.receiver;

    if send_event(&mut sender, &WsEvent::from(subscription.replay))
        .await
        .is_err()
    {
        warn!("Failed to send history to connection {}", conn_id);
        hub.unsubscribe(conn_id);
        return;
    }

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        // The first tick fires immediately.
        ping_interval.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        // Dropped by the hub; the client reconnects for a fresh replay.
                        info!("Connection {} fell behind, closing", conn_id);
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    if send_event(&mut sender, &WsEvent::from(event)).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if send_event(&mut sender, &WsEvent::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsCommand>(text.as_str()) {
                Ok(WsCommand::Pong) => {}
                Err(e) => debug!("Ignoring message from connection {}: {}", conn_id, e),
            },
            Ok(Message::Close(_)) => {
                debug!("Connection {} closed by client", conn_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error on connection {}: {}", conn_id, e);
                break;
            }
        }
    }

    send_task.abort();
    hub.unsubscribe(conn_id);
}

async fn send_event<S>(sender: &mut S, event: &WsEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}
