use crate::FlowData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Status of a single token at its current position.
///
/// `NEW -> PENDING -> READY -> ARCHIVED`, with `READY -> RETRYABLE | ERROR`
/// on failure and `RETRYABLE -> READY` on redelivery. `ARCHIVED` and
/// `ERROR` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNodeStatus {
    New,
    Pending,
    Ready,
    Archived,
    Error,
    Retryable,
}

impl FlowNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowNodeStatus::Archived | FlowNodeStatus::Error)
    }

    pub fn can_transition_to(self, next: FlowNodeStatus) -> bool {
        use FlowNodeStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        match self {
            New => matches!(next, Pending | Ready | Archived | Error),
            Pending => matches!(next, Ready | Archived | Error),
            Ready => matches!(next, Archived | Error | Retryable),
            Retryable => matches!(next, Ready | Error),
            Archived | Error => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowNodeStatus::New => "NEW",
            FlowNodeStatus::Pending => "PENDING",
            FlowNodeStatus::Ready => "READY",
            FlowNodeStatus::Archived => "ARCHIVED",
            FlowNodeStatus::Error => "ERROR",
            FlowNodeStatus::Retryable => "RETRYABLE",
        }
    }
}

impl fmt::Display for FlowNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowTraceStatus {
    Ready,
    Running,
    Archived,
    Error,
    Terminate,
}

impl FlowTraceStatus {
    /// Statuses after which no further trace status write may succeed.
    pub const EXCLUSIVE: [FlowTraceStatus; 3] = [
        FlowTraceStatus::Archived,
        FlowTraceStatus::Error,
        FlowTraceStatus::Terminate,
    ];

    pub fn is_exclusive(self) -> bool {
        Self::EXCLUSIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowTraceStatus::Ready => "READY",
            FlowTraceStatus::Running => "RUNNING",
            FlowTraceStatus::Archived => "ARCHIVED",
            FlowTraceStatus::Error => "ERROR",
            FlowTraceStatus::Terminate => "TERMINATE",
        }
    }
}

impl fmt::Display for FlowTraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One data item's journey through one point of the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowContext {
    pub id: String,
    pub trace_id: String,
    pub stream_id: String,
    /// Node id once claimed by a node, event id while in flight.
    pub position: String,
    pub status: FlowNodeStatus,
    pub to_batch: String,
    pub data: FlowData,
    pub operator: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl FlowContext {
    pub fn new(
        trace_id: impl Into<String>,
        stream_id: impl Into<String>,
        position: impl Into<String>,
        data: FlowData,
        operator: impl Into<String>,
        to_batch: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            stream_id: stream_id.into(),
            position: position.into(),
            status: FlowNodeStatus::New,
            to_batch: to_batch.into(),
            data,
            operator: operator.into(),
            retry_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// A fresh `NEW` context at `position` in the same trace and batch.
    pub fn derive(&self, position: impl Into<String>, data: FlowData) -> Self {
        FlowContext::new(
            self.trace_id.clone(),
            self.stream_id.clone(),
            position,
            data,
            self.operator.clone(),
            self.to_batch.clone(),
        )
    }

    pub fn with_to_batch(mut self, to_batch: impl Into<String>) -> Self {
        self.to_batch = to_batch.into();
        self
    }

    /// Apply a status change in memory. Moves the state machine does not
    /// allow, such as leaving a final status or going back to `NEW`, are
    /// refused.
    pub fn set_status(&mut self, status: FlowNodeStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        if status == FlowNodeStatus::Archived {
            self.archived_at = Some(self.updated_at);
        }
        true
    }
}

/// One invocation of a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowTrace {
    pub id: String,
    pub stream_id: String,
    pub operator: String,
    pub application: String,
    pub start_node: String,
    #[serde(default)]
    pub context_pool: BTreeSet<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: FlowTraceStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl FlowTrace {
    pub fn new(
        stream_id: impl Into<String>,
        start_node: impl Into<String>,
        operator: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            operator: operator.into(),
            application: application.into(),
            start_node: start_node.into(),
            context_pool: BTreeSet::new(),
            start_time: Utc::now(),
            end_time: None,
            status: FlowTraceStatus::Running,
            error: None,
        }
    }
}

/// Persisted schedule entry for contexts awaiting redelivery.
/// One record per `to_batch`, so a batch is retried as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub to_batch: String,
    pub trace_id: String,
    pub stream_id: String,
    pub node_id: String,
    pub context_ids: Vec<String>,
    pub retry_count: u32,
    pub next_retry_time: DateTime<Utc>,
}

impl RetryRecord {
    /// Group contexts by `to_batch`. All contexts are expected to sit at the same node.
    pub fn group(contexts: &[FlowContext], next_retry_time: DateTime<Utc>) -> Vec<RetryRecord> {
        let mut records: Vec<RetryRecord> = Vec::new();
        for ctx in contexts {
            match records
                .iter_mut()
                .find(|r| r.to_batch == ctx.to_batch && r.node_id == ctx.position)
            {
                Some(record) => {
                    record.context_ids.push(ctx.id.clone());
                    record.retry_count = record.retry_count.max(ctx.retry_count);
                }
                None => records.push(RetryRecord {
                    to_batch: ctx.to_batch.clone(),
                    trace_id: ctx.trace_id.clone(),
                    stream_id: ctx.stream_id.clone(),
                    node_id: ctx.position.clone(),
                    context_ids: vec![ctx.id.clone()],
                    retry_count: ctx.retry_count,
                    next_retry_time,
                }),
            }
        }
        records
    }
}
