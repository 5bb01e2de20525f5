//! Turns a validated [`FlowDefinition`] into a running set of stages.

use crate::registry::JoberRegistry;
use crate::services::Services;
use crate::stream::{Behavior, JoinBarrier, NodeProcessor, Publisher, StartPublisher, Subscriber, Whether};
use flowcore::{
    ConditionEvaluationError, ConditionEvaluator, FlowContext, FlowDefinition, FlowError,
    FlowNode, FlowNodeKind, Result,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stage built for one node.
enum BuiltStage {
    Start(Arc<StartPublisher>),
    Node(Arc<NodeProcessor>),
}

impl BuiltStage {
    fn publisher(&self) -> &dyn Publisher {
        match self {
            BuiltStage::Start(start) => start.as_ref(),
            BuiltStage::Node(node) => node.as_ref(),
        }
    }
}

/// Live pipeline of one flow definition, shared by all its traces.
pub struct Pipeline {
    definition: Arc<FlowDefinition>,
    start: Arc<StartPublisher>,
    nodes: HashMap<String, Arc<NodeProcessor>>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub(crate) fn build(
        definition: Arc<FlowDefinition>,
        services: Arc<Services>,
        registry: &JoberRegistry,
    ) -> Result<Self> {
        let mut stages: BTreeMap<String, BuiltStage> = BTreeMap::new();
        for node in definition.nodes() {
            let stage = build_stage(&definition, node, &services, registry)?;
            stages.insert(node.meta_id.clone(), stage);
        }

        for event in definition.events() {
            let source = stages
                .get(&event.from)
                .ok_or_else(|| FlowError::NodeNotFound(event.from.clone()))?;
            let subscriber: Arc<dyn Subscriber> = match stages.get(&event.to) {
                Some(BuiltStage::Node(node)) => node.clone(),
                _ => return Err(FlowError::NodeNotFound(event.to.clone())),
            };
            let whether = match (&event.condition_rule, definition.node(&event.from).map(|n| n.kind)) {
                (Some(rule), Some(FlowNodeKind::Condition)) => {
                    Some(whether(rule.clone(), evaluator(&services, rule)?))
                }
                _ => None,
            };
            source.publisher().subscribe(event.clone(), subscriber, whether);
        }

        let mut start = None;
        let mut nodes = HashMap::new();
        for (id, stage) in stages {
            match stage {
                BuiltStage::Start(publisher) => start = Some(publisher),
                BuiltStage::Node(node) => {
                    nodes.insert(id, node);
                }
            }
        }
        let start = start.ok_or_else(|| FlowError::NodeNotFound(definition.start_node.clone()))?;

        let cancel = CancellationToken::new();
        for node in nodes.values() {
            node.run(cancel.child_token());
        }
        tracing::info!(
            "Pipeline {} built with {} stages",
            definition.stream_id(),
            nodes.len() + 1
        );

        Ok(Self {
            definition,
            start,
            nodes,
            cancel,
        })
    }

    pub fn stream_id(&self) -> String {
        self.definition.stream_id()
    }

    pub fn definition(&self) -> &Arc<FlowDefinition> {
        &self.definition
    }

    pub fn start(&self) -> &Arc<StartPublisher> {
        &self.start
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<NodeProcessor>> {
        self.nodes.get(node_id)
    }

    /// Node consuming contexts positioned on `event_id`.
    pub fn event_target(&self, event_id: &str) -> Option<&Arc<NodeProcessor>> {
        let target = self.definition.event_target(event_id)?;
        self.nodes.get(&target.meta_id)
    }

    /// Re-inject persisted `NEW`/`PENDING` contexts that share one position:
    /// the start node, or an event feeding some node. Returns how many were
    /// handed over.
    pub async fn offer(&self, position: &str, contexts: Vec<FlowContext>) -> Result<usize> {
        let count = contexts.len();
        if position == self.definition.start_node {
            self.start.offer(contexts).await?;
            return Ok(count);
        }
        let node = self
            .event_target(position)
            .ok_or_else(|| FlowError::NodeNotFound(position.to_string()))?;
        node.offer(contexts)?;
        Ok(count)
    }

    /// Drop what every node buffers in memory for `trace_id`. Returns the
    /// number of contexts dropped.
    pub fn forget(&self, trace_id: &str) -> usize {
        self.nodes.values().map(|node| node.forget(trace_id)).sum()
    }

    /// Stop every node worker. Contexts in flight stay persisted.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_stage(
    definition: &FlowDefinition,
    node: &FlowNode,
    services: &Arc<Services>,
    registry: &JoberRegistry,
) -> Result<BuiltStage> {
    let behavior = match node.kind {
        FlowNodeKind::Start => {
            return Ok(BuiltStage::Start(Arc::new(StartPublisher::new(
                node.clone(),
                services.clone(),
            ))));
        }
        FlowNodeKind::State => {
            let jober = node
                .task
                .as_ref()
                .map(|task| registry.create_jober(task))
                .transpose()?;
            let post_filter = match &node.properties.post_filter {
                Some(rule) => Some((rule.clone(), evaluator(services, rule)?)),
                None => None,
            };
            Behavior::State { jober, post_filter }
        }
        FlowNodeKind::Condition => Behavior::Condition,
        FlowNodeKind::Parallel => Behavior::Parallel,
        FlowNodeKind::Join => {
            let member_count = node
                .properties
                .member_count
                .unwrap_or_else(|| definition.incoming(&node.meta_id).count());
            Behavior::Join(JoinBarrier::new(member_count, node.properties.join_mode))
        }
        FlowNodeKind::End => Behavior::End,
    };

    let incoming: Vec<_> = definition.incoming(&node.meta_id).collect();
    Ok(BuiltStage::Node(Arc::new(NodeProcessor::new(
        node.clone(),
        behavior,
        &incoming,
        services.clone(),
    ))))
}

fn evaluator(services: &Services, rule: &str) -> Result<Arc<dyn ConditionEvaluator>> {
    services
        .evaluator
        .clone()
        .ok_or_else(|| FlowError::Condition(ConditionEvaluationError::NoEvaluator(rule.to_string())))
}

fn whether(rule: String, evaluator: Arc<dyn ConditionEvaluator>) -> Whether {
    Arc::new(move |context: &FlowContext| evaluator.evaluate(&rule, &context.data))
}
