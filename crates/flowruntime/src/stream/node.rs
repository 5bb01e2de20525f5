use super::filter::BatchFilter;
use super::{FlowPublisher, JoinBarrier, Publisher, Stage, Subscriber, Subscription, Whether};
use crate::services::Services;
use chrono::Utc;
use flowcore::{
    ConditionEvaluator, ErrorPolicy, ExecutionEvent, FlowContext, FlowData, FlowError, FlowEvent,
    FlowNode, FlowNodeKind, FlowNodeStatus, Jober, JoberContext, Result, TaskFilter,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Work for a node's worker task.
pub(crate) enum Inbound {
    /// Drained from an upstream subscription
    Delivered {
        event_id: String,
        contexts: Vec<FlowContext>,
    },
    /// Replayed by crash recovery
    Offered(Vec<FlowContext>),
    /// Re-invoked by the retry dispatcher, already `READY` on this node
    Retry(Vec<FlowContext>),
    /// Manual completion of held contexts
    Complete {
        context_ids: Vec<String>,
        data: Option<Vec<FlowData>>,
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// What a node does with a claimed batch.
pub(crate) enum Behavior {
    State {
        jober: Option<Arc<dyn Jober>>,
        post_filter: Option<(String, Arc<dyn ConditionEvaluator>)>,
    },
    Condition,
    Parallel,
    Join(JoinBarrier),
    End,
}

/// Every node except the start node: consumes contexts from its incoming
/// events, applies its behavior, and publishes over its outgoing events.
pub struct NodeProcessor {
    node: FlowNode,
    behavior: Behavior,
    publisher: FlowPublisher,
    services: Arc<Services>,
    incoming: HashSet<String>,
    filters: HashMap<String, BatchFilter>,
    upstream: Mutex<HashMap<String, Arc<Subscription>>>,
    held: Mutex<BTreeMap<String, FlowContext>>,
    tasks: Arc<Semaphore>,
    inbox: mpsc::UnboundedSender<Inbound>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl NodeProcessor {
    pub(crate) fn new(
        node: FlowNode,
        behavior: Behavior,
        incoming: &[&FlowEvent],
        services: Arc<Services>,
    ) -> Self {
        let (inbox, receiver) = mpsc::unbounded_channel();
        let filters = incoming
            .iter()
            .filter_map(|event| {
                event.task_filter.map(|filter| match filter {
                    TaskFilter::MinimumSize { threshold } => {
                        (event.meta_id.clone(), BatchFilter::new(threshold))
                    }
                })
            })
            .collect();
        Self {
            publisher: FlowPublisher::new(node.meta_id.clone(), services.clone()),
            incoming: incoming.iter().map(|e| e.meta_id.clone()).collect(),
            filters,
            upstream: Mutex::new(HashMap::new()),
            held: Mutex::new(BTreeMap::new()),
            tasks: Arc::new(Semaphore::new(services.config.max_concurrent_tasks.max(1))),
            inbox,
            receiver: Mutex::new(Some(receiver)),
            node,
            behavior,
            services,
        }
    }

    pub fn node(&self) -> &FlowNode {
        &self.node
    }

    pub fn kind(&self) -> FlowNodeKind {
        self.node.kind
    }

    /// Ids of contexts waiting for manual completion.
    pub fn held_context_ids(&self) -> Vec<String> {
        self.held
            .lock()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Contexts buffered by `minimumSize` filters of incoming events.
    pub fn filtered_waiting(&self) -> usize {
        self.filters.values().map(BatchFilter::waiting).sum()
    }

    /// Contexts of `trace_id` kept in memory by this node: held for manual
    /// completion, waiting at a join, or buffered by a task filter.
    pub fn buffered(&self, trace_id: &str) -> usize {
        let held = self
            .held
            .lock()
            .map(|h| h.values().filter(|c| c.trace_id == trace_id).count())
            .unwrap_or(0);
        let joined = match &self.behavior {
            Behavior::Join(barrier) => barrier.waiting_in_trace(trace_id),
            _ => 0,
        };
        let filtered: usize = self.filters.values().map(|f| f.waiting_in_trace(trace_id)).sum();
        held + joined + filtered
    }

    /// Drop everything buffered for `trace_id`. Persisted contexts are left
    /// as they are.
    pub fn forget(&self, trace_id: &str) -> usize {
        let mut dropped = self
            .held
            .lock()
            .map(|mut held| {
                let before = held.len();
                held.retain(|_, c| c.trace_id != trace_id);
                before - held.len()
            })
            .unwrap_or(0);
        if let Behavior::Join(barrier) = &self.behavior {
            dropped += barrier.forget(trace_id);
        }
        dropped += self.filters.values().map(|f| f.forget(trace_id)).sum::<usize>();
        if dropped > 0 {
            tracing::debug!(
                "Node {} dropped {} buffered contexts of trace {}",
                self.node.meta_id,
                dropped,
                trace_id
            );
        }
        dropped
    }

    fn buffered_traces(&self) -> BTreeSet<String> {
        let mut traces: BTreeSet<String> = self
            .held
            .lock()
            .map(|h| h.values().map(|c| c.trace_id.clone()).collect())
            .unwrap_or_default();
        if let Behavior::Join(barrier) = &self.behavior {
            traces.extend(barrier.traces());
        }
        for filter in self.filters.values() {
            traces.extend(filter.traces());
        }
        traces
    }

    /// Forget buffers of traces that were closed, deleted, or are no longer
    /// owned by this worker.
    async fn sweep(&self) {
        for trace_id in self.buffered_traces() {
            let closed = match self.services.trace_status(&trace_id).await {
                Ok(Some(status)) => status.is_exclusive(),
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!("Node {} could not check trace {}: {}", self.node.meta_id, trace_id, e);
                    continue;
                }
            };
            if closed || !self.services.owner.is_own(&trace_id) {
                self.forget(&trace_id);
            }
        }
    }

    /// Hand contexts positioned on one of this node's incoming events to
    /// the worker, bypassing the subscription. Used by recovery.
    pub fn offer(&self, contexts: Vec<FlowContext>) -> Result<()> {
        self.send(Inbound::Offered(contexts))
    }

    pub(crate) fn retry(&self, contexts: Vec<FlowContext>) -> Result<()> {
        self.send(Inbound::Retry(contexts))
    }

    /// Release held contexts of a manual node. `data` replaces their
    /// payloads before the Jober runs. Returns the number released.
    pub async fn complete(&self, context_ids: Vec<String>, data: Option<Vec<FlowData>>) -> Result<usize> {
        if !self.node.is_manual() {
            return Err(FlowError::Configuration(format!(
                "node {} is not a manual node",
                self.node.meta_id
            )));
        }
        let (reply, response) = oneshot::channel();
        self.send(Inbound::Complete {
            context_ids,
            data,
            reply,
        })?;
        response.await.map_err(|_| self.stopped())?
    }

    fn send(&self, message: Inbound) -> Result<()> {
        self.inbox.send(message).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> FlowError {
        FlowError::Configuration(format!("worker of node {} is not running", self.node.meta_id))
    }

    /// Start the worker task. Only the first call spawns anything.
    pub(crate) fn run(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().ok()?.take()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(this.services.config.buffer_sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        this.sweep().await;
                        continue;
                    }
                    message = receiver.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                this.handle(message).await;
            }
            tracing::debug!("Worker of node {} stopped", this.node.meta_id);
        }))
    }

    async fn handle(self: &Arc<Self>, message: Inbound) {
        match message {
            Inbound::Delivered { event_id, contexts } => {
                let consumed = contexts.len();
                if let Err(e) = self.accept(contexts).await {
                    tracing::error!("Node {} failed to accept contexts: {}", self.node.meta_id, e);
                }
                let upstream = self
                    .upstream
                    .lock()
                    .ok()
                    .and_then(|u| u.get(&event_id).cloned());
                if let Some(subscription) = upstream {
                    subscription.request(consumed);
                }
            }
            Inbound::Offered(contexts) => {
                if let Err(e) = self.accept(contexts).await {
                    tracing::error!("Node {} failed to accept recovered contexts: {}", self.node.meta_id, e);
                }
            }
            // Contexts that never ran go back through the manual hold.
            Inbound::Retry(contexts) => match &self.behavior {
                Behavior::State { .. } if contexts.iter().any(|c| c.retry_count > 0) => {
                    self.spawn_execute(contexts, None);
                }
                _ => self.dispatch(contexts).await,
            },
            Inbound::Complete {
                context_ids,
                data,
                reply,
            } => {
                let result = self.release_held(context_ids, data).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Pre-filter, claim and dispatch contexts arriving on incoming events.
    async fn accept(self: &Arc<Self>, contexts: Vec<FlowContext>) -> Result<()> {
        let contexts = self.live(contexts).await?;

        let mut batches: Vec<Vec<FlowContext>> = Vec::new();
        let mut direct: Vec<((String, String), Vec<FlowContext>)> = Vec::new();
        let mut filtered: BTreeMap<String, Vec<FlowContext>> = BTreeMap::new();
        for context in contexts {
            if self.filters.contains_key(&context.position) {
                filtered.entry(context.position.clone()).or_default().push(context);
                continue;
            }
            let key = (context.trace_id.clone(), context.to_batch.clone());
            match direct.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.push(context),
                None => direct.push((key, vec![context])),
            }
        }
        for (event_id, group) in filtered {
            if let Some(filter) = self.filters.get(&event_id) {
                batches.extend(filter.admit(group));
            }
        }
        batches.extend(direct.into_iter().map(|(_, group)| group));

        for batch in batches {
            match self.claim(&batch).await {
                Ok(claimed) => self.dispatch(claimed).await,
                Err(e) => self.fail(batch, &e).await,
            }
        }
        Ok(())
    }

    /// Drop contexts whose trace is gone, already in an exclusive status, or
    /// driven by another worker. They keep whatever status they were
    /// persisted with.
    async fn live(&self, contexts: Vec<FlowContext>) -> Result<Vec<FlowContext>> {
        let traces: BTreeSet<String> = contexts.iter().map(|c| c.trace_id.clone()).collect();
        let mut dead = HashSet::new();
        for trace_id in traces {
            if !self.services.owner.is_own(&trace_id) {
                tracing::debug!(
                    "Node {} dropping contexts of trace {} owned elsewhere",
                    self.node.meta_id,
                    trace_id
                );
                dead.insert(trace_id);
                continue;
            }
            match self.services.trace_status(&trace_id).await? {
                Some(status) if !status.is_exclusive() => {}
                status => {
                    tracing::debug!(
                        "Node {} dropping contexts of trace {} ({:?})",
                        self.node.meta_id,
                        trace_id,
                        status
                    );
                    dead.insert(trace_id);
                }
            }
        }
        Ok(contexts
            .into_iter()
            .filter(|c| !dead.contains(&c.trace_id))
            .collect())
    }

    /// Move still-pending contexts from the event onto this node as `READY`.
    async fn claim(&self, batch: &[FlowContext]) -> Result<Vec<FlowContext>> {
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        let mut stored: HashMap<String, FlowContext> = self
            .services
            .contexts
            .get_by_ids(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(mut context) = stored.remove(id) else {
                continue;
            };
            let pending = matches!(context.status, FlowNodeStatus::New | FlowNodeStatus::Pending);
            if !pending || !self.incoming.contains(&context.position) {
                tracing::debug!(
                    "Node {} skipping context {} ({} at {})",
                    self.node.meta_id,
                    context.id,
                    context.status,
                    context.position
                );
                continue;
            }
            context.position = self.node.meta_id.clone();
            context.set_status(FlowNodeStatus::Ready);
            claimed.push(context);
        }
        if !claimed.is_empty() {
            self.services.contexts.batch_update(&claimed).await?;
        }
        Ok(claimed)
    }

    /// Apply the node's behavior to claimed contexts. A failure marks the
    /// batch `ERROR`; State batches fail through their error policy.
    async fn dispatch(self: &Arc<Self>, batch: Vec<FlowContext>) {
        if batch.is_empty() {
            return;
        }
        let outcome = match &self.behavior {
            Behavior::State { .. } if self.node.is_manual() => {
                self.hold(batch);
                return;
            }
            Behavior::State { .. } => {
                self.spawn_execute(batch, None);
                return;
            }
            Behavior::Join(barrier) => {
                self.join(barrier, batch).await;
                return;
            }
            Behavior::Condition => self.route(batch.clone()).await,
            Behavior::Parallel => self.fork(batch.clone()).await,
            Behavior::End => self.finish(batch.clone()).await,
        };
        if let Err(e) = outcome {
            self.fail(batch, &e).await;
        }
    }

    fn hold(&self, batch: Vec<FlowContext>) {
        let trace_id = batch[0].trace_id.clone();
        let context_ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        if let Ok(mut held) = self.held.lock() {
            for context in batch {
                held.insert(context.id.clone(), context);
            }
        }
        tracing::info!(
            "Node {} holding {} contexts of trace {} for manual completion",
            self.node.meta_id,
            context_ids.len(),
            trace_id
        );
        self.services.events.emit(ExecutionEvent::ContextsHeld {
            trace_id,
            node_id: self.node.meta_id.clone(),
            context_ids,
            timestamp: Utc::now(),
        });
    }

    async fn release_held(self: &Arc<Self>, context_ids: Vec<String>, data: Option<Vec<FlowData>>) -> Result<usize> {
        let mut batch = Vec::new();
        let mut missing = Vec::new();
        if let Ok(mut held) = self.held.lock() {
            for id in context_ids {
                match held.remove(&id) {
                    Some(context) => batch.push(context),
                    None => missing.push(id),
                }
            }
        }
        if !missing.is_empty() {
            // held by a previous run of this node
            let stored = self.services.contexts.get_by_ids(&missing).await?;
            batch.extend(
                stored
                    .into_iter()
                    .filter(|c| c.status == FlowNodeStatus::Ready && c.position == self.node.meta_id),
            );
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let trace_id = batch[0].trace_id.clone();
        match self.services.trace_status(&trace_id).await? {
            Some(status) if status.is_exclusive() => {
                return Err(FlowError::TraceTerminated {
                    trace_id,
                    status: status.to_string(),
                });
            }
            None => return Err(FlowError::TraceNotFound(trace_id)),
            Some(_) => {}
        }

        let released = batch.len();
        tracing::info!("Node {} released {} held contexts", self.node.meta_id, released);
        self.spawn_execute(batch, data);
        Ok(released)
    }

    fn spawn_execute(self: &Arc<Self>, batch: Vec<FlowContext>, payloads: Option<Vec<FlowData>>) {
        let this = self.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let Ok(_permit) = tasks.acquire_owned().await else {
                return;
            };
            if let Err(e) = this.execute(&batch, payloads).await {
                this.handle_failure(batch, e).await;
            }
        });
    }

    async fn execute(&self, batch: &[FlowContext], payloads: Option<Vec<FlowData>>) -> Result<()> {
        let Behavior::State { jober, post_filter } = &self.behavior else {
            return Ok(());
        };
        let first = &batch[0];
        let inputs = payloads.unwrap_or_else(|| batch.iter().map(|c| c.data.clone()).collect());

        let outputs = match jober {
            Some(jober) => {
                let ctx = JoberContext {
                    trace_id: first.trace_id.clone(),
                    node_id: self.node.meta_id.clone(),
                    to_batch: first.to_batch.clone(),
                    context_ids: batch.iter().map(|c| c.id.clone()).collect(),
                    retry_count: batch.iter().map(|c| c.retry_count).max().unwrap_or(0),
                };
                tracing::debug!(
                    "Node {} running {} on {} inputs (attempt {})",
                    self.node.meta_id,
                    jober.jober_type(),
                    inputs.len(),
                    ctx.retry_count
                );
                jober.execute(&ctx, inputs).await?
            }
            None => inputs,
        };

        let mut templates = Vec::with_capacity(outputs.len());
        for mut data in outputs {
            let mut pass_data = first.data.pass_data.clone();
            for (key, value) in std::mem::take(&mut data.pass_data) {
                pass_data.entry(key).or_insert(value);
            }
            data.pass_data = pass_data;

            if let Some((rule, evaluator)) = post_filter {
                if !evaluator.evaluate(rule, &data)? {
                    tracing::debug!("Node {} post-filter dropped an output", self.node.meta_id);
                    continue;
                }
            }
            templates.push(first.derive(self.node.meta_id.clone(), data));
        }

        self.advance(batch, &templates).await.map(|_| ())
    }

    /// Persist children of `templates`, archive `inputs`, then deliver.
    /// Returns the number of children delivered.
    async fn advance(&self, inputs: &[FlowContext], templates: &[FlowContext]) -> Result<usize> {
        let emission = self.publisher.prepare(templates).await?;
        let ids: Vec<String> = inputs.iter().map(|c| c.id.clone()).collect();
        self.services
            .contexts
            .update_status(&ids, FlowNodeStatus::Archived)
            .await?;
        let emitted = emission.deliver();

        let trace_id = &inputs[0].trace_id;
        tracing::debug!(
            "Node {} processed {} contexts of trace {}, emitted {}",
            self.node.meta_id,
            inputs.len(),
            trace_id,
            emitted
        );
        self.services.events.emit(ExecutionEvent::NodeProcessed {
            trace_id: trace_id.clone(),
            node_id: self.node.meta_id.clone(),
            consumed: inputs.len(),
            emitted,
            timestamp: Utc::now(),
        });
        if emitted == 0 {
            self.services.finish_if_idle(trace_id).await?;
        }
        Ok(emitted)
    }

    async fn route(&self, batch: Vec<FlowContext>) -> Result<()> {
        let emission = self.publisher.prepare(&batch).await?;
        let failed: HashSet<String> = emission.failed.iter().map(|(c, _)| c.id.clone()).collect();
        for id in &emission.unmatched {
            tracing::warn!("Context {} matched no branch of condition {}", id, self.node.meta_id);
        }
        let routed_nowhere = !emission.unmatched.is_empty();

        let archived: Vec<String> = batch
            .iter()
            .filter(|c| !failed.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();
        self.services
            .contexts
            .update_status(&archived, FlowNodeStatus::Archived)
            .await?;
        let failures = emission.failed.clone();
        let emitted = emission.deliver();

        self.services.events.emit(ExecutionEvent::NodeProcessed {
            trace_id: batch[0].trace_id.clone(),
            node_id: self.node.meta_id.clone(),
            consumed: batch.len(),
            emitted,
            timestamp: Utc::now(),
        });

        for (context, error) in failures {
            self.fail(vec![context], &FlowError::Condition(error)).await;
        }
        if routed_nowhere || emitted == 0 {
            self.services.finish_if_idle(&batch[0].trace_id).await?;
        }
        Ok(())
    }

    async fn fork(&self, batch: Vec<FlowContext>) -> Result<()> {
        let templates: Vec<FlowContext> = batch
            .iter()
            .map(|c| c.clone().with_to_batch(c.id.clone()))
            .collect();
        self.advance(&batch, &templates).await.map(|_| ())
    }

    /// Failures mark the arriving context, or every member once the barrier
    /// has released them.
    async fn join(&self, barrier: &JoinBarrier, batch: Vec<FlowContext>) {
        for context in batch {
            let key = format!("join-{}-{}-{}", self.node.meta_id, context.trace_id, context.to_batch);
            let _guard = match self.services.locks.acquire(&key).await {
                Ok(guard) => guard,
                Err(e) => {
                    self.fail(vec![context], &FlowError::from(e)).await;
                    continue;
                }
            };
            let Some(members) = barrier.arrive(context) else {
                continue;
            };
            tracing::debug!(
                "Join {} complete for batch {} with {} members",
                self.node.meta_id,
                members[0].to_batch,
                members.len()
            );
            let template = members[0].derive(self.node.meta_id.clone(), barrier.aggregate(&members));
            if let Err(e) = self.advance(&members, &[template]).await {
                self.fail(members, &e).await;
            }
        }
    }

    async fn finish(&self, batch: Vec<FlowContext>) -> Result<()> {
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        self.services
            .contexts
            .update_status(&ids, FlowNodeStatus::Archived)
            .await?;
        for context in &batch {
            tracing::debug!("Context {} reached end node {}", context.id, self.node.meta_id);
            self.services.events.emit(ExecutionEvent::ContextFinished {
                trace_id: context.trace_id.clone(),
                context_id: context.id.clone(),
                node_id: self.node.meta_id.clone(),
                timestamp: Utc::now(),
            });
        }
        let traces: BTreeSet<&str> = batch.iter().map(|c| c.trace_id.as_str()).collect();
        for trace_id in traces {
            self.services.finish_if_idle(trace_id).await?;
        }
        Ok(())
    }

    /// Error handler of a State batch. Never propagates.
    async fn handle_failure(&self, batch: Vec<FlowContext>, error: FlowError) {
        let retryable = matches!(
            error,
            FlowError::Node(_) | FlowError::Persistence(_) | FlowError::Lock(_)
        );
        match self.node.properties.error_policy {
            ErrorPolicy::Retry {
                max_retries,
                retry_delay_ms,
            } if retryable && batch.iter().all(|c| c.retry_count < max_retries) => {
                if let Err(e) = self.schedule_retry(batch, &error, retry_delay_ms, max_retries).await {
                    tracing::error!("Node {} could not schedule retry: {}", self.node.meta_id, e);
                }
            }
            _ => self.fail(batch, &error).await,
        }
    }

    async fn schedule_retry(
        &self,
        mut batch: Vec<FlowContext>,
        error: &FlowError,
        retry_delay_ms: u64,
        max_retries: u32,
    ) -> Result<()> {
        for context in &mut batch {
            context.retry_count += 1;
            context.error = Some(error.to_string());
            context.set_status(FlowNodeStatus::Retryable);
        }
        self.services.contexts.batch_update(&batch).await?;
        let next_retry_time = Utc::now() + chrono::Duration::milliseconds(retry_delay_ms as i64);
        self.services
            .contexts
            .save_retry_schedule(&batch, next_retry_time)
            .await?;

        tracing::warn!(
            "Node {} failed on {} contexts (attempt {}/{}), retrying in {}ms: {}",
            self.node.meta_id,
            batch.len(),
            batch[0].retry_count,
            max_retries,
            retry_delay_ms,
            error
        );
        self.services.events.emit(ExecutionEvent::ContextsFailed {
            trace_id: batch[0].trace_id.clone(),
            node_id: self.node.meta_id.clone(),
            context_ids: batch.iter().map(|c| c.id.clone()).collect(),
            status: FlowNodeStatus::Retryable,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Mark contexts `ERROR` and the trace with them.
    async fn fail(&self, mut batch: Vec<FlowContext>, error: &FlowError) {
        let message = error.to_string();
        let trace_id = batch[0].trace_id.clone();
        for context in &mut batch {
            context.error = Some(message.clone());
            context.set_status(FlowNodeStatus::Error);
        }
        tracing::error!(
            "Node {} failed on {} contexts of trace {}: {}",
            self.node.meta_id,
            batch.len(),
            trace_id,
            message
        );

        let outcome = async {
            self.services.contexts.batch_update(&batch).await?;
            self.services.fail_trace(&trace_id, &message).await?;
            Ok::<_, FlowError>(())
        }
        .await;
        if let Err(e) = outcome {
            tracing::error!("Node {} could not record failure: {}", self.node.meta_id, e);
        }
        self.forget(&trace_id);

        self.services.events.emit(ExecutionEvent::ContextsFailed {
            trace_id: trace_id.clone(),
            node_id: self.node.meta_id.clone(),
            context_ids: batch.iter().map(|c| c.id.clone()).collect(),
            status: FlowNodeStatus::Error,
            error: message,
            timestamp: Utc::now(),
        });
        if let Err(e) = self.services.finish_if_idle(&trace_id).await {
            tracing::error!("Node {} could not close trace {}: {}", self.node.meta_id, trace_id, e);
        }
    }
}

impl Stage for NodeProcessor {
    fn node_id(&self) -> &str {
        &self.node.meta_id
    }
}

impl Publisher for NodeProcessor {
    fn subscribe(
        &self,
        event: FlowEvent,
        subscriber: Arc<dyn Subscriber>,
        whether: Option<Whether>,
    ) -> Arc<Subscription> {
        self.publisher.attach(event, subscriber, whether)
    }

    fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.publisher.subscriptions()
    }
}

impl Subscriber for NodeProcessor {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        if let Ok(mut upstream) = self.upstream.lock() {
            upstream.insert(subscription.event_id().to_string(), subscription.clone());
        }
        subscription.request(self.services.config.input_demand);
    }

    fn on_next(&self, event_id: &str, contexts: Vec<FlowContext>) {
        let message = Inbound::Delivered {
            event_id: event_id.to_string(),
            contexts,
        };
        if self.inbox.send(message).is_err() {
            tracing::debug!("Node {} worker stopped, dropping delivery", self.node.meta_id);
        }
    }
}
