//! Core abstractions for the flow engine
//!
//! Data model, graph definitions, persistence and locking contracts, and
//! the collaborator traits the runtime consumes. Nothing here drives a
//! pipeline; see `flowruntime` for that.

mod context;
mod data;
mod definition;
mod error;
pub mod events;
pub mod lock;
mod node;
pub mod repo;

pub use context::{FlowContext, FlowNodeStatus, FlowTrace, FlowTraceStatus, RetryRecord};
pub use data::{lookup, FlowData};
pub use definition::{
    DefinitionStatus, ErrorPolicy, FlowDefinition, FlowEvent, FlowNode, FlowNodeKind,
    GraphDocument, GraphNode, JoinMode, NodeProperties, TaskFilter, TaskSpec, TriggerMode,
};
pub use error::{
    ConditionEvaluationError, FlowError, GraphValidationError, LockError, NodeError,
    PersistenceError,
};
pub use events::{EventBus, ExecutionEvent};
pub use lock::{
    DistributedFlowLocks, DistributedLockProvider, FlowLockGuard, FlowLocks, InMemoryLockProvider,
    LocalFlowLocks,
};
pub use node::{ConditionEvaluator, FnJober, Jober, JoberContext};
pub use repo::{
    FlowContextRepo, FlowDefinitionRepo, FlowTraceRepo, InMemoryContextRepo,
    InMemoryDefinitionRepo, InMemoryTraceRepo,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
