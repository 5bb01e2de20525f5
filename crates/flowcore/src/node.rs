use crate::{ConditionEvaluationError, FlowData, NodeError};
use async_trait::async_trait;

/// Business task executed by a State node.
///
/// Receives the payloads of one batch (M) and returns any number (N) of
/// output payloads. Delivery is at-least-once, so implementations should be
/// idempotent for a given set of context ids.
#[async_trait]
pub trait Jober: Send + Sync {
    /// Type identifier used in a node's `task.type` (e.g. "http.request")
    fn jober_type(&self) -> &str;

    async fn execute(&self, ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError>;
}

/// Identifies the batch a Jober is running for.
#[derive(Debug, Clone)]
pub struct JoberContext {
    pub trace_id: String,
    pub node_id: String,
    pub to_batch: String,
    pub context_ids: Vec<String>,
    /// Attempt number, 0 on first delivery
    pub retry_count: u32,
}

impl JoberContext {
    pub fn new(trace_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            node_id: node_id.into(),
            to_batch: String::new(),
            context_ids: Vec::new(),
            retry_count: 0,
        }
    }
}

/// Evaluates condition rules and post-filters against a token's data.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, data: &FlowData) -> Result<bool, ConditionEvaluationError>;
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&str, &FlowData) -> Result<bool, ConditionEvaluationError> + Send + Sync,
{
    fn evaluate(&self, expression: &str, data: &FlowData) -> Result<bool, ConditionEvaluationError> {
        self(expression, data)
    }
}

/// Jober backed by a closure; handy for embedding and tests.
pub struct FnJober<F> {
    jober_type: String,
    func: F,
}

impl<F> FnJober<F>
where
    F: Fn(Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> + Send + Sync,
{
    pub fn new(jober_type: impl Into<String>, func: F) -> Self {
        Self {
            jober_type: jober_type.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Jober for FnJober<F>
where
    F: Fn(Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> + Send + Sync,
{
    fn jober_type(&self) -> &str {
        &self.jober_type
    }

    async fn execute(&self, _ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        (self.func)(data)
    }
}
