use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph validation error: {0}")]
    Graph(#[from] GraphValidationError),

    #[error("Condition evaluation error: {0}")]
    Condition(#[from] ConditionEvaluationError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Flow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Flow definition {0} is inactive")]
    DefinitionInactive(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    #[error("Trace {trace_id} is already {status}")]
    TraceTerminated { trace_id: String, status: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raised while turning a graph document into a [`crate::FlowDefinition`].
/// Always fatal: the flow is never run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("Flow has no start node")]
    MissingStartNode,

    #[error("Flow has more than one start node: {0:?}")]
    MultipleStartNodes(Vec<String>),

    #[error("Flow has no end node")]
    MissingEndNode,

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Event {event} references unknown node {node}")]
    UnknownNode { event: String, node: String },

    #[error("Node {node} ({kind}) has {actual} outgoing events, expected {expected}")]
    EventCardinality {
        node: String,
        kind: String,
        expected: String,
        actual: usize,
    },

    #[error("Join node {0} has no incoming events")]
    JoinWithoutInput(String),

    #[error("Event {0} leaves a condition node but has no condition rule")]
    MissingConditionRule(String),

    #[error("Cyclic dependency detected through node {0} without a condition guard")]
    CyclicDependency(String),

    #[error("Node {0} is not reachable from the start node")]
    Unreachable(String),

    #[error("Invalid property '{property}' on {node}: {message}")]
    InvalidProperty {
        node: String,
        property: String,
        message: String,
    },

    #[error("Malformed graph document: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionEvaluationError {
    #[error("Expression '{expression}' evaluated to {actual}, expected a boolean")]
    NotBoolean { expression: String, actual: String },

    #[error("Cannot parse expression '{expression}': {message}")]
    Parse { expression: String, message: String },

    #[error("No condition evaluator configured for rule '{0}'")]
    NoEvaluator(String),
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Unknown jober type: {0}")]
    UnknownJober(String),
}

#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("Timed out acquiring lock {0}")]
    Timeout(String),

    #[error("Lock provider failure: {0}")]
    Provider(String),
}
