use crate::types::{ExecutionId, ExecutionMode, NodeId, NodeStatus, PlanStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

/// A progress event for one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ExecutionEvent {
    pub fn new(execution_id: ExecutionId, payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

/// Type-specific event fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventPayload {
    #[serde(rename = "execution:start")]
    ExecutionStart {
        total_nodes: usize,
        mode: ExecutionMode,
    },
    #[serde(rename = "node:start")]
    NodeStart {
        node_id: NodeId,
        node_label: String,
        attempt: u32,
    },
    #[serde(rename = "node:progress")]
    NodeProgress {
        node_id: NodeId,
        node_label: String,
        progress: f32,
        message: Option<String>,
    },
    #[serde(rename = "node:complete")]
    NodeComplete {
        node_id: NodeId,
        node_label: String,
        status: NodeStatus,
        duration_ms: u64,
        attempts: u32,
        error: Option<String>,
    },
    #[serde(rename = "execution:complete")]
    ExecutionComplete {
        status: PlanStatus,
        completed_nodes: usize,
        failed_nodes: usize,
        skipped_nodes: usize,
        total_duration_ms: u64,
    },
    #[serde(rename = "execution:error")]
    ExecutionError {
        error: String,
        node_id: Option<NodeId>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ExecutionStart { .. } => EventType::ExecutionStart,
            EventPayload::NodeStart { .. } => EventType::NodeStart,
            EventPayload::NodeProgress { .. } => EventType::NodeProgress,
            EventPayload::NodeComplete { .. } => EventType::NodeComplete,
            EventPayload::ExecutionComplete { .. } => EventType::ExecutionComplete,
            EventPayload::ExecutionError { .. } => EventType::ExecutionError,
        }
    }
}

/// Discriminant used to subscribe to one kind of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ExecutionStart,
    NodeStart,
    NodeProgress,
    NodeComplete,
    ExecutionComplete,
    ExecutionError,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::ExecutionStart,
        EventType::NodeStart,
        EventType::NodeProgress,
        EventType::NodeComplete,
        EventType::ExecutionComplete,
        EventType::ExecutionError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ExecutionStart => "execution:start",
            EventType::NodeStart => "node:start",
            EventType::NodeProgress => "node:progress",
            EventType::NodeComplete => "node:complete",
            EventType::ExecutionComplete => "execution:complete",
            EventType::ExecutionError => "execution:error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type EventHandler = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    event_type: EventType,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Registry {
    fn add(&self, event_type: EventType, handler: EventHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                event_type,
                handler,
            });
        id
    }

    fn remove(&self, ids: &[u64]) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| !ids.contains(&s.id));
    }
}

/// Publish/subscribe channel for execution progress.
///
/// Constructed explicitly and shared by `Arc`; there is no global instance.
/// Publishing is synchronous: handlers run on the publisher's thread in
/// subscription order. The subscriber list is snapshotted before dispatch,
/// so handlers may subscribe or unsubscribe while a publish is in progress.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event of one type
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        let id = self.registry.add(event_type, Arc::new(handler));
        self.subscription(vec![id])
    }

    /// Receive every event regardless of type or execution
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        let ids = EventType::ALL
            .iter()
            .map(|event_type| self.registry.add(*event_type, handler.clone()))
            .collect();
        self.subscription(ids)
    }

    /// Receive every event of one execution
    pub fn subscribe_to_execution<F>(&self, execution_id: ExecutionId, handler: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if event.execution_id == execution_id {
                handler(event);
            }
        })
    }

    /// Bridge one execution's events into an async channel
    pub fn channel(
        &self,
        execution_id: ExecutionId,
    ) -> (Subscription, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe_to_execution(execution_id, move |event| {
            // Receiver gone means the consumer stopped listening.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver an event to all matching handlers
    pub fn publish(&self, event: ExecutionEvent) {
        let event_type = event.event_type();
        let handlers: Vec<EventHandler> = self
            .registry
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.event_type == event_type)
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(
                    "Event handler panicked while handling {} for execution {}",
                    event_type,
                    event.execution_id
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn subscription(&self, ids: Vec<u64>) -> Subscription {
        Subscription {
            registry: Arc::downgrade(&self.registry),
            ids,
        }
    }
}

/// Handle returned by every subscribe call.
///
/// Dropping it unsubscribes; call [`Subscription::detach`] to keep the
/// handler registered for the lifetime of the bus.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    registry: Weak<Registry>,
    ids: Vec<u64>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn detach(mut self) {
        self.ids.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn start_event(execution_id: ExecutionId) -> ExecutionEvent {
        ExecutionEvent::new(
            execution_id,
            EventPayload::ExecutionStart {
                total_nodes: 3,
                mode: ExecutionMode::Parallel,
            },
        )
    }

    fn error_event(execution_id: ExecutionId) -> ExecutionEvent {
        ExecutionEvent::new(
            execution_id,
            EventPayload::ExecutionError {
                error: "boom".to_string(),
                node_id: None,
            },
        )
    }

    #[test]
    fn test_event_wire_format() {
        let event = ExecutionEvent::new(
            ExecutionId::new(),
            EventPayload::NodeComplete {
                node_id: NodeId::new("n1"),
                node_label: "Scraper".to_string(),
                status: NodeStatus::Failed,
                duration_ms: 12,
                attempts: 2,
                error: Some("timeout".to_string()),
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node:complete");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["durationMs"], 12);

        let parsed: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.payload, event.payload);
    }

    #[test]
    fn test_subscribe_by_type() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = bus.subscribe(EventType::ExecutionError, move |e| {
            sink.lock().unwrap().push(e.event_type());
        });

        let id = ExecutionId::new();
        bus.publish(start_event(id));
        bus.publish(error_event(id));

        assert_eq!(*seen.lock().unwrap(), vec![EventType::ExecutionError]);
    }

    #[test]
    fn test_subscribe_to_execution_filters_and_unsubscribes() {
        let bus = EventBus::new();
        let mine = ExecutionId::new();
        let other = ExecutionId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let sub = bus.subscribe_to_execution(mine, move |e| {
            sink.lock().unwrap().push(e.execution_id);
        });

        bus.publish(start_event(mine));
        bus.publish(start_event(other));
        bus.publish(error_event(mine));
        assert_eq!(*seen.lock().unwrap(), vec![mine, mine]);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(start_event(mine));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let _a = bus.subscribe(EventType::ExecutionStart, move |_| {
            first.lock().unwrap().push("first");
        });
        let _b = bus.subscribe(EventType::ExecutionStart, |_| panic!("handler failure"));
        let third = seen.clone();
        let _c = bus.subscribe(EventType::ExecutionStart, move |_| {
            third.lock().unwrap().push("third");
        });

        bus.publish(start_event(ExecutionId::new()));

        assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn test_handler_can_unsubscribe_during_publish() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU64::new(0));

        let own = slot.clone();
        let counter = count.clone();
        let sub = bus.subscribe(EventType::ExecutionStart, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            own.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.publish(start_event(ExecutionId::new()));
        bus.publish(start_event(ExecutionId::new()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_subscription_survives_drop() {
        let bus = EventBus::new();
        bus.subscribe(EventType::NodeStart, |_| {}).detach();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_bridge() {
        let bus = EventBus::new();
        let id = ExecutionId::new();
        let (_sub, mut rx) = bus.channel(id);

        bus.publish(start_event(ExecutionId::new()));
        bus.publish(error_event(id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id, id);
        assert_eq!(event.event_type(), EventType::ExecutionError);
    }
}
