//! Flow event system for observability.
//!
//! Emits [`FlowEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (dashboards, loggers, tests) can follow message handling
//! without coupling to the agent internals.

use serde::{Deserialize, Serialize};

/// Events emitted while an agent handles traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// A hook stage returned nothing; the payload went no further.
    MessageDropped {
        direction: String,
        stage: String,
        priority: i32,
    },
    SenderRejected {
        peer: String,
    },
    HookFailed {
        direction: String,
        stage: String,
        priority: i32,
        error: String,
    },
    HandlerFailed {
        route: String,
        error: String,
    },
    Transitioned {
        key: String,
        from_state: String,
        to_state: String,
        trigger: String,
    },
    TriggerRecorded {
        key: String,
        route: String,
        action: String,
        trigger: String,
    },
    OutboxDrained {
        outbox: String,
        entries: usize,
    },
    SendFailed {
        route: String,
        error: String,
    },
    ListeningEnded,
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Collect every event currently buffered in `rx` without waiting.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
