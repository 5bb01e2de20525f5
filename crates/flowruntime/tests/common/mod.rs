// crates/flowruntime/tests/common/mod.rs
#![allow(dead_code)]

use flowcore::{
    ConditionEvaluationError, ConditionEvaluator, FlowContext, FlowContextRepo, FlowData,
    FlowDefinition, FlowNodeStatus, FlowTrace, FlowTraceRepo, FlowTraceStatus, FnJober,
    GraphDocument, InMemoryContextRepo, InMemoryDefinitionRepo, InMemoryLockProvider,
    InMemoryTraceRepo, Jober, JoberContext, NodeError,
};
use flowruntime::{FlowRuntime, FlowRuntimeBuilder, RuntimeConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowruntime=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn config(worker_id: &str) -> RuntimeConfig {
    RuntimeConfig {
        worker_id: worker_id.to_string(),
        ..RuntimeConfig::default()
    }
}

/// Understands a handful of fixed rules over `business.x`.
pub fn test_evaluator() -> Arc<dyn ConditionEvaluator> {
    Arc::new(|rule: &str, data: &FlowData| {
        let x = data.get("x").and_then(Value::as_i64);
        match (rule, x) {
            ("x > 0", Some(x)) => Ok(x > 0),
            ("x <= 0", Some(x)) => Ok(x <= 0),
            ("x > 10", Some(x)) => Ok(x > 10),
            ("always", _) => Ok(true),
            (rule, _) => Err(ConditionEvaluationError::NotBoolean {
                expression: rule.to_string(),
                actual: "null".to_string(),
            }),
        }
    })
}

pub fn builder(worker_id: &str) -> FlowRuntimeBuilder {
    FlowRuntime::builder(config(worker_id)).evaluator(test_evaluator())
}

pub fn runtime_with(jobers: Vec<Arc<dyn Jober>>) -> Arc<FlowRuntime> {
    let mut builder = builder("worker-test");
    for jober in jobers {
        builder.registry_mut().register_jober(jober);
    }
    Arc::new(builder.build())
}

pub async fn register(runtime: &FlowRuntime, document: GraphDocument) -> String {
    let definition = FlowDefinition::from_document(document).expect("valid graph");
    runtime.register_definition(definition).await.expect("registered")
}

/// Adds `inc` to `business.x`.
pub fn increment(inc: i64) -> Arc<dyn Jober> {
    Arc::new(FnJober::new("increment", move |data: Vec<FlowData>| {
        Ok(data
            .into_iter()
            .map(|d| {
                let x = d.get("x").and_then(Value::as_i64).unwrap_or(0);
                d.with_business(json!({ "x": x + inc }))
            })
            .collect())
    }))
}

/// Fails the first `failures` invocations, then passes data through.
pub struct FlakyJober {
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyJober {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Jober for FlakyJober {
    fn jober_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: &JoberContext, data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(NodeError::ExecutionFailed(format!("flaky failure {}", call + 1)));
        }
        Ok(data)
    }
}

pub async fn wait_for_trace_status(
    runtime: &FlowRuntime,
    trace_id: &str,
    status: FlowTraceStatus,
) -> FlowTrace {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let trace = runtime.trace(trace_id).await.unwrap();
        if let Some(trace) = trace.filter(|t| t.status == status) {
            return trace;
        }
        if tokio::time::Instant::now() >= deadline {
            let current = runtime.trace(trace_id).await.unwrap().map(|t| t.status);
            panic!("trace {} never reached {:?}, last seen {:?}", trace_id, status, current);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds for the trace's contexts.
pub async fn wait_for_contexts<F>(runtime: &FlowRuntime, trace_id: &str, check: F) -> Vec<FlowContext>
where
    F: Fn(&[FlowContext]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let contexts = runtime.contexts(trace_id).await.unwrap();
        if check(&contexts) {
            return contexts;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("contexts of trace {} never satisfied the check: {:#?}", trace_id, contexts);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds; `what` names the condition in the panic.
pub async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn at(contexts: &[FlowContext], position: &str, status: FlowNodeStatus) -> Vec<FlowContext> {
    contexts
        .iter()
        .filter(|c| c.position == position && c.status == status)
        .cloned()
        .collect()
}

/// Repositories and lock backend shared by several simulated workers.
pub struct Cluster {
    pub contexts: Arc<InMemoryContextRepo>,
    pub traces: Arc<InMemoryTraceRepo>,
    pub definitions: Arc<InMemoryDefinitionRepo>,
    pub provider: Arc<InMemoryLockProvider>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(InMemoryContextRepo::new()),
            traces: Arc::new(InMemoryTraceRepo::new()),
            definitions: Arc::new(InMemoryDefinitionRepo::new()),
            provider: Arc::new(InMemoryLockProvider::new()),
        }
    }

    pub fn worker(&self, config: RuntimeConfig, jobers: Vec<Arc<dyn Jober>>) -> Arc<FlowRuntime> {
        let mut builder = FlowRuntime::builder(config)
            .evaluator(test_evaluator())
            .context_repo(self.contexts.clone())
            .trace_repo(self.traces.clone())
            .definition_repo(self.definitions.clone())
            .lock_provider(self.provider.clone());
        for jober in jobers {
            builder.registry_mut().register_jober(jober);
        }
        Arc::new(builder.build())
    }

    /// Persist a running trace as a crashed worker would have left it.
    pub async fn seed(&self, stream_id: &str, contexts: &[(&str, FlowNodeStatus)]) -> (String, Vec<FlowContext>) {
        let mut trace = FlowTrace::new(stream_id, "start", "op", "app");
        let contexts: Vec<FlowContext> = contexts
            .iter()
            .map(|(position, status)| {
                let mut context = FlowContext::new(
                    trace.id.clone(),
                    stream_id,
                    *position,
                    FlowData::new(json!({"x": 1})),
                    "op",
                    "batch-1",
                );
                context.status = *status;
                context
            })
            .collect();
        trace.context_pool = contexts.iter().map(|c| c.id.clone()).collect();
        let trace_id = trace.id.clone();
        self.traces.batch_create(&[trace]).await.unwrap();
        self.contexts.batch_create(&contexts).await.unwrap();
        (trace_id, contexts)
    }
}
