//! Built-in collaborators for the flow engine
//!
//! Jobers for common State node tasks, plus a rule evaluator for
//! condition branches and post-filters.

mod condition;
mod debug;
mod http;
mod time;
mod transform;

pub use condition::RuleConditionEvaluator;
pub use debug::{LogJober, LogJoberFactory};
pub use http::{HttpRequestJober, HttpRequestJoberFactory};
pub use time::{DelayJober, DelayJoberFactory};
pub use transform::{JsonPickJober, JsonPickJoberFactory, JsonSetJober, JsonSetJoberFactory};

use flowruntime::{FlowRuntimeBuilder, JoberRegistry};
use std::sync::Arc;

/// Register all built-in jobers with a registry
pub fn register_all(registry: &mut JoberRegistry) {
    registry.register(Arc::new(LogJoberFactory));
    registry.register(Arc::new(HttpRequestJoberFactory));
    registry.register(Arc::new(JsonSetJoberFactory));
    registry.register(Arc::new(JsonPickJoberFactory));
    registry.register(Arc::new(DelayJoberFactory));
}

/// Builder preloaded with every built-in jober and the rule evaluator
pub fn with_builtins(mut builder: FlowRuntimeBuilder) -> FlowRuntimeBuilder {
    register_all(builder.registry_mut());
    builder.evaluator(Arc::new(RuleConditionEvaluator::new()))
}
