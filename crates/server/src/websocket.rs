use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use flowsmith_core::{EventType, ExecutionEvent, ExecutionId, ExecutionPlan};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{parse_execution_id, ApiError, ApiResult};
use crate::config::AppState;

/// WebSocket message types for live execution updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsMessage {
    /// Subscription confirmation
    Subscribed { execution_id: ExecutionId },
    /// Current plan state, sent once after subscribing
    Snapshot { plan: ExecutionPlan },
    /// An engine event for the subscribed execution
    Event { event: ExecutionEvent },
    /// Error message
    Error { message: String },
}

/// Stream the events of one execution to the client
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Response> {
    let execution_id = parse_execution_id(&execution_id)?;

    if state.engine.get_plan(execution_id).await.is_none() {
        return Err(ApiError::not_found(format!(
            "Execution {} not found",
            execution_id
        )));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, execution_id)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, execution_id: ExecutionId) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the snapshot so nothing published in between is lost
    let (subscription, mut events) = state.engine.event_bus().channel(execution_id);

    if !send(&mut sender, &WsMessage::Subscribed { execution_id }).await {
        return;
    }

    let Some(plan) = state.engine.get_plan(execution_id).await else {
        send(
            &mut sender,
            &WsMessage::Error {
                message: format!("Execution {} not found", execution_id),
            },
        )
        .await;
        return;
    };

    let finished = plan.status.is_terminal();
    if !send(&mut sender, &WsMessage::Snapshot { plan }).await {
        return;
    }

    if !finished {
        tracing::info!("Client subscribed to execution {}", execution_id);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let done = event.event_type() == EventType::ExecutionComplete;
                    if !send(&mut sender, &WsMessage::Event { event }).await || done {
                        break;
                    }
                }
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    subscription.unsubscribe();
    let _ = sender.send(Message::Close(None)).await;

    tracing::info!("WebSocket connection for execution {} terminated", execution_id);
}

/// Serialize and send one message; false once the client is gone
async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(msg_json) => sender.send(Message::Text(msg_json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize WebSocket message: {}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsmith_core::{EventPayload, NodeId, NodeStatus};

    #[test]
    fn test_event_message_wire_format() {
        let execution_id = ExecutionId::new();
        let msg = WsMessage::Event {
            event: ExecutionEvent::new(
                execution_id,
                EventPayload::NodeComplete {
                    node_id: NodeId::new("n1"),
                    node_label: "Scraper".to_string(),
                    status: NodeStatus::Success,
                    duration_ms: 12,
                    attempts: 1,
                    error: None,
                },
            ),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["type"], "node:complete");
        assert_eq!(json["event"]["executionId"], execution_id.to_string());
        assert_eq!(json["event"]["nodeLabel"], "Scraper");
    }

    #[test]
    fn test_subscribed_message_wire_format() {
        let execution_id = ExecutionId::new();
        let json = serde_json::to_value(WsMessage::Subscribed { execution_id }).unwrap();

        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["executionId"], execution_id.to_string());
    }
}
