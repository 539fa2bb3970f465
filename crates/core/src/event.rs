//! Domain event system for observing the agent without coupling to it.
//!
//! Events are published when something interesting happens in the runtime.
//! Other components (CLI progress output, diagnostics) subscribe to react.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::agent::AgentState;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A user turn started
    TurnStarted {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The agent state machine moved
    StateChanged {
        session_id: String,
        from: AgentState,
        to: AgentState,
    },

    /// A generation finished and was normalized
    Generated {
        session_id: String,
        backend: String,
        /// Name of the normalizer strategy that found calls, if any
        strategy: Option<String>,
        call_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Retrieved chunks were injected into context
    ContextRetrieved {
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A user turn finished
    TurnFinished {
        session_id: String,
        generations: u32,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            tool_name: "book_flight".into(),
            is_error: false,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, is_error, .. } => {
                assert_eq!(tool_name, "book_flight");
                assert!(!is_error);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
