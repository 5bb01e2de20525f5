use crate::config::RuntimeConfig;
use crate::owner::TraceOwnerService;
use crate::pipeline::Pipeline;
use crate::registry::JoberRegistry;
use crate::services::Services;
use crate::{ExpiredTraceCleaner, RestartContextSchedule, RetryDispatcher};
use chrono::Utc;
use flowcore::{
    ConditionEvaluator, DefinitionStatus, DistributedLockProvider, EventBus, ExecutionEvent,
    FlowContext, FlowContextRepo, FlowData, FlowDefinition, FlowDefinitionRepo, FlowError,
    FlowLocks, FlowTrace, FlowTraceRepo, FlowTraceStatus, InMemoryContextRepo,
    InMemoryDefinitionRepo, InMemoryLockProvider, InMemoryTraceRepo, LocalFlowLocks, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime: owns the collaborators and one pipeline per stream id
pub struct FlowRuntime {
    services: Arc<Services>,
    definitions: Arc<dyn FlowDefinitionRepo>,
    registry: Arc<JoberRegistry>,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl FlowRuntime {
    /// Runtime with in-memory repositories and default settings
    pub fn new() -> Self {
        Self::builder(RuntimeConfig::default()).build()
    }

    pub fn builder(config: RuntimeConfig) -> FlowRuntimeBuilder {
        FlowRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.services.config
    }

    pub fn registry(&self) -> &Arc<JoberRegistry> {
        &self.registry
    }

    pub fn context_repo(&self) -> &Arc<dyn FlowContextRepo> {
        &self.services.contexts
    }

    pub fn trace_repo(&self) -> &Arc<dyn FlowTraceRepo> {
        &self.services.traces
    }

    pub fn definition_repo(&self) -> &Arc<dyn FlowDefinitionRepo> {
        &self.definitions
    }

    pub fn owner(&self) -> &Arc<TraceOwnerService> {
        &self.services.owner
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.services.events.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    /// Store a definition. A cached pipeline of the same stream id is
    /// replaced on next use.
    pub async fn register_definition(&self, definition: FlowDefinition) -> Result<String> {
        let stream_id = definition.stream_id();
        self.definitions.save(definition).await?;
        self.evict(&stream_id).await;
        tracing::info!("Registered flow definition {}", stream_id);
        Ok(stream_id)
    }

    /// Parse, validate and store a graph document.
    pub async fn register_graph_json(&self, json: &str) -> Result<String> {
        let definition = FlowDefinition::from_json(json)?;
        self.register_definition(definition).await
    }

    pub async fn set_definition_status(&self, stream_id: &str, status: DefinitionStatus) -> Result<()> {
        self.definitions.update_status(stream_id, status).await?;
        self.evict(stream_id).await;
        tracing::info!("Flow definition {} is now {:?}", stream_id, status);
        Ok(())
    }

    async fn evict(&self, stream_id: &str) {
        if let Some(pipeline) = self.pipelines.write().await.remove(stream_id) {
            pipeline.shutdown();
        }
    }

    /// Pipeline of `stream_id`, built on first use.
    pub async fn pipeline(&self, stream_id: &str) -> Result<Arc<Pipeline>> {
        if let Some(pipeline) = self.pipelines.read().await.get(stream_id) {
            return Ok(pipeline.clone());
        }

        let definition = self
            .definitions
            .find(stream_id)
            .await?
            .ok_or_else(|| FlowError::DefinitionNotFound(stream_id.to_string()))?;
        if !definition.is_active() {
            return Err(FlowError::DefinitionInactive(stream_id.to_string()));
        }

        let mut pipelines = self.pipelines.write().await;
        if let Some(pipeline) = pipelines.get(stream_id) {
            return Ok(pipeline.clone());
        }
        let pipeline = Arc::new(Pipeline::build(definition, self.services.clone(), &self.registry)?);
        pipelines.insert(stream_id.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    /// Start a trace of `stream_id`, one start context per input item.
    /// All inputs share one batch. Returns the trace id.
    pub async fn start(
        &self,
        stream_id: &str,
        data: Vec<FlowData>,
        operator: &str,
        application: &str,
    ) -> Result<String> {
        if data.is_empty() {
            return Err(FlowError::Configuration("a trace needs at least one input".to_string()));
        }
        let pipeline = self.pipeline(stream_id).await?;
        let start_node = pipeline.definition().start_node.clone();

        let mut trace = FlowTrace::new(stream_id, start_node.clone(), operator, application);
        let to_batch = uuid::Uuid::new_v4().to_string();
        let contexts: Vec<FlowContext> = data
            .into_iter()
            .map(|d| {
                FlowContext::new(
                    trace.id.clone(),
                    stream_id,
                    start_node.clone(),
                    d,
                    operator,
                    to_batch.clone(),
                )
            })
            .collect();
        trace.context_pool = contexts.iter().map(|c| c.id.clone()).collect();
        let trace_id = trace.id.clone();

        self.services.traces.batch_create(&[trace]).await?;
        self.services.contexts.batch_create(&contexts).await?;
        if !self.services.owner.own(&trace_id).await? {
            tracing::warn!("Trace {} was claimed by another worker before it started", trace_id);
        }

        tracing::info!(
            "Started trace {} of {} with {} contexts",
            trace_id,
            stream_id,
            contexts.len()
        );
        self.services.events.emit(ExecutionEvent::TraceStarted {
            trace_id: trace_id.clone(),
            stream_id: stream_id.to_string(),
            contexts: contexts.len(),
            timestamp: Utc::now(),
        });

        pipeline.start().offer(contexts).await?;
        Ok(trace_id)
    }

    /// Release contexts held by a manual State node. `data` optionally
    /// replaces their payloads. Returns the number of contexts released.
    pub async fn complete(
        &self,
        trace_id: &str,
        node_id: &str,
        context_ids: Vec<String>,
        data: Option<Vec<FlowData>>,
    ) -> Result<usize> {
        let trace = self.live_trace(trace_id).await?;
        let pipeline = self.pipeline(&trace.stream_id).await?;
        let node = pipeline
            .node(node_id)
            .ok_or_else(|| FlowError::NodeNotFound(node_id.to_string()))?;
        node.complete(context_ids, data).await
    }

    /// Stop a trace. Its contexts keep their status and are no longer
    /// propagated.
    pub async fn terminate(&self, trace_id: &str) -> Result<()> {
        let trace = self.live_trace(trace_id).await?;
        let changed = self
            .services
            .traces
            .update_status(&[trace_id.to_string()], FlowTraceStatus::Terminate)
            .await?;
        if changed == 0 {
            return Err(FlowError::TraceTerminated {
                trace_id: trace_id.to_string(),
                status: "closed".to_string(),
            });
        }
        self.services.owner.release(trace_id).await?;
        if let Some(pipeline) = self.pipelines.read().await.get(&trace.stream_id) {
            pipeline.forget(trace_id);
        }

        tracing::info!("Terminated trace {}", trace_id);
        self.services.events.emit(ExecutionEvent::TraceCompleted {
            trace_id: trace_id.to_string(),
            status: FlowTraceStatus::Terminate,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn live_trace(&self, trace_id: &str) -> Result<FlowTrace> {
        let trace = self
            .services
            .traces
            .find(trace_id)
            .await?
            .ok_or_else(|| FlowError::TraceNotFound(trace_id.to_string()))?;
        if trace.status.is_exclusive() {
            return Err(FlowError::TraceTerminated {
                trace_id: trace_id.to_string(),
                status: trace.status.to_string(),
            });
        }
        Ok(trace)
    }

    pub async fn trace(&self, trace_id: &str) -> Result<Option<FlowTrace>> {
        Ok(self.services.traces.find(trace_id).await?)
    }

    /// Every context of the trace, oldest first.
    pub async fn contexts(&self, trace_id: &str) -> Result<Vec<FlowContext>> {
        Ok(self.services.contexts.find_by_trace_id(trace_id).await?)
    }

    /// Start recovery, retry and cleanup loops until `cancel` fires.
    pub fn spawn_schedules(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            Arc::new(RestartContextSchedule::new(self.clone())).spawn(cancel.clone()),
            Arc::new(RetryDispatcher::new(self.clone())).spawn(cancel.clone()),
            Arc::new(ExpiredTraceCleaner::new(self.clone())).spawn(cancel),
        ]
    }

    /// Stop every pipeline worker.
    pub async fn shutdown(&self) {
        let mut pipelines = self.pipelines.write().await;
        for (stream_id, pipeline) in pipelines.drain() {
            pipeline.shutdown();
            tracing::debug!("Stopped pipeline {}", stream_id);
        }
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles a [`FlowRuntime`]; anything not supplied is in-memory.
pub struct FlowRuntimeBuilder {
    config: RuntimeConfig,
    contexts: Option<Arc<dyn FlowContextRepo>>,
    traces: Option<Arc<dyn FlowTraceRepo>>,
    definitions: Option<Arc<dyn FlowDefinitionRepo>>,
    locks: Option<Arc<dyn FlowLocks>>,
    lock_provider: Option<Arc<dyn DistributedLockProvider>>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    registry: JoberRegistry,
}

impl FlowRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            contexts: None,
            traces: None,
            definitions: None,
            locks: None,
            lock_provider: None,
            evaluator: None,
            registry: JoberRegistry::new(),
        }
    }

    pub fn context_repo(mut self, repo: Arc<dyn FlowContextRepo>) -> Self {
        self.contexts = Some(repo);
        self
    }

    pub fn trace_repo(mut self, repo: Arc<dyn FlowTraceRepo>) -> Self {
        self.traces = Some(repo);
        self
    }

    pub fn definition_repo(mut self, repo: Arc<dyn FlowDefinitionRepo>) -> Self {
        self.definitions = Some(repo);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn FlowLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Backend holding trace ownership leases
    pub fn lock_provider(mut self, provider: Arc<dyn DistributedLockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn registry(mut self, registry: JoberRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut JoberRegistry {
        &mut self.registry
    }

    pub fn build(self) -> FlowRuntime {
        let provider = self
            .lock_provider
            .unwrap_or_else(|| Arc::new(InMemoryLockProvider::new()));
        let owner = Arc::new(TraceOwnerService::new(
            provider,
            self.config.worker_id.clone(),
            self.config.ownership_ttl,
        ));
        let services = Arc::new(Services {
            contexts: self
                .contexts
                .unwrap_or_else(|| Arc::new(InMemoryContextRepo::new())),
            traces: self.traces.unwrap_or_else(|| Arc::new(InMemoryTraceRepo::new())),
            locks: self.locks.unwrap_or_else(|| Arc::new(LocalFlowLocks::new())),
            owner,
            events: Arc::new(EventBus::new(self.config.event_buffer_size)),
            evaluator: self.evaluator,
            config: self.config,
        });
        tracing::debug!("Flow runtime {} ready", services.config.worker_id);

        FlowRuntime {
            services,
            definitions: self
                .definitions
                .unwrap_or_else(|| Arc::new(InMemoryDefinitionRepo::new())),
            registry: Arc::new(self.registry),
            pipelines: RwLock::new(HashMap::new()),
        }
    }
}
