use crate::{FlowNodeStatus, FlowTraceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published while traces move through a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    TraceStarted {
        trace_id: String,
        stream_id: String,
        contexts: usize,
        timestamp: DateTime<Utc>,
    },
    NodeProcessed {
        trace_id: String,
        node_id: String,
        consumed: usize,
        emitted: usize,
        timestamp: DateTime<Utc>,
    },
    ContextsHeld {
        trace_id: String,
        node_id: String,
        context_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    ContextsFailed {
        trace_id: String,
        node_id: String,
        context_ids: Vec<String>,
        status: FlowNodeStatus,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ContextFinished {
        trace_id: String,
        context_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    TraceCompleted {
        trace_id: String,
        status: FlowTraceStatus,
        timestamp: DateTime<Utc>,
    },
    TraceRecovered {
        trace_id: String,
        offered: usize,
        retried: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn trace_id(&self) -> &str {
        match self {
            ExecutionEvent::TraceStarted { trace_id, .. }
            | ExecutionEvent::NodeProcessed { trace_id, .. }
            | ExecutionEvent::ContextsHeld { trace_id, .. }
            | ExecutionEvent::ContextsFailed { trace_id, .. }
            | ExecutionEvent::ContextFinished { trace_id, .. }
            | ExecutionEvent::TraceCompleted { trace_id, .. }
            | ExecutionEvent::TraceRecovered { trace_id, .. } => trace_id,
        }
    }
}

/// Process-wide event bus. Lossy: slow receivers miss events rather than
/// slowing the pipeline down.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
