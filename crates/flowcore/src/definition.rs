//! Immutable flow topology.
//!
//! Nodes and events live in id-keyed arenas; events refer to nodes by id
//! only, so a definition is plain data that many traces share read-only.

use crate::GraphValidationError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowNodeKind {
    Start,
    State,
    Condition,
    Parallel,
    Join,
    End,
}

impl fmt::Display for FlowNodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowNodeKind::Start => "start",
            FlowNodeKind::State => "state",
            FlowNodeKind::Condition => "condition",
            FlowNodeKind::Parallel => "parallel",
            FlowNodeKind::Join => "join",
            FlowNodeKind::End => "end",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    #[default]
    Merge,
    Collect,
}

/// What a node does with a token whose task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum ErrorPolicy {
    Error,
    Retry { max_retries: u32, retry_delay_ms: u64 },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    #[default]
    Active,
    Inactive,
}

/// Reference to the Jober a State node runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub jober_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Pre-filter applied to the input of the event's target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskFilter {
    MinimumSize { threshold: usize },
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    pub meta_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition_rule: Option<String>,
    #[serde(default)]
    pub task_filter: Option<TaskFilter>,
}

impl FlowEvent {
    pub fn new(meta_id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            meta_id: meta_id.into(),
            name: None,
            from: from.into(),
            to: to.into(),
            condition_rule: None,
            task_filter: None,
        }
    }

    pub fn with_condition(mut self, rule: impl Into<String>) -> Self {
        self.condition_rule = Some(rule.into());
        self
    }

    pub fn with_filter(mut self, filter: TaskFilter) -> Self {
        self.task_filter = Some(filter);
        self
    }
}

/// Typed view over a node's `properties` map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeProperties {
    pub trigger_mode: TriggerMode,
    pub error_policy: ErrorPolicy,
    pub post_filter: Option<String>,
    pub member_count: Option<usize>,
    pub join_mode: JoinMode,
    pub raw: Map<String, Value>,
}

impl NodeProperties {
    fn parse(node: &str, raw: Map<String, Value>) -> Result<Self, GraphValidationError> {
        let invalid = |property: &str, message: &str| GraphValidationError::InvalidProperty {
            node: node.to_string(),
            property: property.to_string(),
            message: message.to_string(),
        };

        let trigger_mode = match raw.get("triggerMode").and_then(Value::as_str) {
            None | Some("auto") => TriggerMode::Auto,
            Some("manual") => TriggerMode::Manual,
            Some(_) => return Err(invalid("triggerMode", "expected 'auto' or 'manual'")),
        };

        let error_policy = match raw.get("errorPolicy").and_then(Value::as_str) {
            None | Some("error") => ErrorPolicy::Error,
            Some("retry") => {
                let max_retries = match raw.get("maxRetries") {
                    None => 3,
                    Some(v) => v
                        .as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| invalid("maxRetries", "expected an integer between 0 and 4294967295"))?,
                };
                let retry_delay_ms = match raw.get("retryDelayMs") {
                    None => 1000,
                    Some(v) => v
                        .as_u64()
                        .ok_or_else(|| invalid("retryDelayMs", "expected milliseconds"))?,
                };
                ErrorPolicy::Retry {
                    max_retries,
                    retry_delay_ms,
                }
            }
            Some(_) => return Err(invalid("errorPolicy", "expected 'error' or 'retry'")),
        };

        let post_filter = match raw.get("postFilter") {
            None | Some(Value::Null) => None,
            Some(Value::String(rule)) => Some(rule.clone()),
            Some(_) => return Err(invalid("postFilter", "expected an expression string")),
        };

        let member_count = match raw.get("memberCount") {
            None => None,
            Some(v) => match v.as_u64().and_then(|n| usize::try_from(n).ok()) {
                Some(n) if n > 0 => Some(n),
                _ => return Err(invalid("memberCount", "expected a positive integer")),
            },
        };

        let join_mode = match raw.get("joinMode").and_then(Value::as_str) {
            None | Some("merge") => JoinMode::Merge,
            Some("collect") => JoinMode::Collect,
            Some(_) => return Err(invalid("joinMode", "expected 'merge' or 'collect'")),
        };

        Ok(Self {
            trigger_mode,
            error_policy,
            post_filter,
            member_count,
            join_mode,
            raw,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowNode {
    pub meta_id: String,
    pub name: String,
    pub kind: FlowNodeKind,
    /// Outgoing event ids, in document order.
    pub events: Vec<String>,
    pub properties: NodeProperties,
    pub task: Option<TaskSpec>,
}

impl FlowNode {
    pub fn is_manual(&self) -> bool {
        self.kind == FlowNodeKind::State && self.properties.trigger_mode == TriggerMode::Manual
    }
}

/// Node entry of a graph document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    #[serde(rename = "type")]
    pub kind: FlowNodeKind,
    pub meta_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub task: Option<TaskSpec>,
}

impl GraphNode {
    pub fn new(kind: FlowNodeKind, meta_id: impl Into<String>) -> Self {
        Self {
            kind,
            meta_id: meta_id.into(),
            name: None,
            properties: Map::new(),
            task: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_task(mut self, jober_type: impl Into<String>, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.task = Some(TaskSpec {
            jober_type: jober_type.into(),
            config,
        });
        self
    }
}

/// Already-authored graph document, as produced by the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDocument {
    pub meta_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: DefinitionStatus,
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub events: Vec<FlowEvent>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl GraphDocument {
    pub fn new(meta_id: impl Into<String>) -> Self {
        Self {
            meta_id: meta_id.into(),
            version: default_version(),
            name: None,
            status: DefinitionStatus::Active,
            nodes: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn event(mut self, event: FlowEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Immutable, validated flow topology.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    pub meta_id: String,
    pub version: String,
    pub name: String,
    pub status: DefinitionStatus,
    pub start_node: String,
    nodes: BTreeMap<String, FlowNode>,
    events: BTreeMap<String, FlowEvent>,
}

impl FlowDefinition {
    pub fn from_json(json: &str) -> Result<Self, GraphValidationError> {
        let document: GraphDocument = serde_json::from_str(json)
            .map_err(|e| GraphValidationError::Malformed(e.to_string()))?;
        Self::from_document(document)
    }

    pub fn from_document(document: GraphDocument) -> Result<Self, GraphValidationError> {
        let mut nodes = BTreeMap::new();
        for node in document.nodes {
            if nodes.contains_key(&node.meta_id) {
                return Err(GraphValidationError::DuplicateId(node.meta_id));
            }
            let properties = NodeProperties::parse(&node.meta_id, node.properties)?;
            let flow_node = FlowNode {
                name: node.name.unwrap_or_else(|| node.meta_id.clone()),
                meta_id: node.meta_id.clone(),
                kind: node.kind,
                events: Vec::new(),
                properties,
                task: node.task,
            };
            nodes.insert(node.meta_id, flow_node);
        }

        let mut events = BTreeMap::new();
        for event in document.events {
            if events.contains_key(&event.meta_id) || nodes.contains_key(&event.meta_id) {
                return Err(GraphValidationError::DuplicateId(event.meta_id));
            }
            for endpoint in [&event.from, &event.to] {
                if !nodes.contains_key(endpoint) {
                    return Err(GraphValidationError::UnknownNode {
                        event: event.meta_id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
            if let Some(source) = nodes.get_mut(&event.from) {
                source.events.push(event.meta_id.clone());
            }
            events.insert(event.meta_id.clone(), event);
        }

        let starts: Vec<String> = nodes
            .values()
            .filter(|n| n.kind == FlowNodeKind::Start)
            .map(|n| n.meta_id.clone())
            .collect();
        let start_node = match starts.len() {
            0 => return Err(GraphValidationError::MissingStartNode),
            1 => starts[0].clone(),
            _ => return Err(GraphValidationError::MultipleStartNodes(starts)),
        };
        if !nodes.values().any(|n| n.kind == FlowNodeKind::End) {
            return Err(GraphValidationError::MissingEndNode);
        }

        let definition = Self {
            name: document.name.unwrap_or_else(|| document.meta_id.clone()),
            meta_id: document.meta_id,
            version: document.version,
            status: document.status,
            start_node,
            nodes,
            events,
        };
        definition.validate()?;
        Ok(definition)
    }

    fn validate(&self) -> Result<(), GraphValidationError> {
        for node in self.nodes.values() {
            let outgoing = node.events.len();
            let (expected, ok) = match node.kind {
                FlowNodeKind::Start | FlowNodeKind::State | FlowNodeKind::Join => ("1", outgoing == 1),
                FlowNodeKind::Condition | FlowNodeKind::Parallel => (">= 1", outgoing >= 1),
                FlowNodeKind::End => ("0", outgoing == 0),
            };
            if !ok {
                return Err(GraphValidationError::EventCardinality {
                    node: node.meta_id.clone(),
                    kind: node.kind.to_string(),
                    expected: expected.to_string(),
                    actual: outgoing,
                });
            }
            if node.kind == FlowNodeKind::Condition {
                for event in self.outgoing(&node.meta_id) {
                    if event.condition_rule.as_deref().map_or(true, |r| r.trim().is_empty()) {
                        return Err(GraphValidationError::MissingConditionRule(event.meta_id.clone()));
                    }
                }
            }
            if node.kind == FlowNodeKind::Join && self.incoming(&node.meta_id).next().is_none() {
                return Err(GraphValidationError::JoinWithoutInput(node.meta_id.clone()));
            }
        }

        for event in self.events.values() {
            if event.task_filter.is_some() {
                let target = &self.nodes[&event.to];
                if target.kind != FlowNodeKind::State {
                    return Err(GraphValidationError::InvalidProperty {
                        node: event.meta_id.clone(),
                        property: "taskFilter".to_string(),
                        message: format!("only allowed on events into state nodes, not {}", target.kind),
                    });
                }
            }
            if let Some(TaskFilter::MinimumSize { threshold: 0 }) = event.task_filter {
                return Err(GraphValidationError::InvalidProperty {
                    node: event.meta_id.clone(),
                    property: "taskFilter".to_string(),
                    message: "threshold must be positive".to_string(),
                });
            }
        }

        self.check_graph()
    }

    /// Cycles are only allowed when they pass through a condition node;
    /// every node must be reachable from the start node.
    fn check_graph(&self) -> Result<(), GraphValidationError> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for id in self.nodes.keys() {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }

        let mut guarded: DiGraph<&str, ()> = graph.clone();
        for event in self.events.values() {
            let (from, to) = (index[event.from.as_str()], index[event.to.as_str()]);
            graph.add_edge(from, to, ());
            if self.nodes[&event.from].kind != FlowNodeKind::Condition {
                guarded.add_edge(from, to, ());
            }
        }

        if let Err(cycle) = toposort(&guarded, None) {
            let node = guarded[cycle.node_id()].to_string();
            return Err(GraphValidationError::CyclicDependency(node));
        }

        let mut reached = HashSet::new();
        let mut dfs = Dfs::new(&graph, index[self.start_node.as_str()]);
        while let Some(idx) = dfs.next(&graph) {
            reached.insert(graph[idx]);
        }
        if let Some(unreached) = self.nodes.keys().find(|id| !reached.contains(id.as_str())) {
            return Err(GraphValidationError::Unreachable(unreached.clone()));
        }
        Ok(())
    }

    /// Identifier of this definition version, used to key traces and pipelines.
    pub fn stream_id(&self) -> String {
        format!("{}-{}", self.meta_id, self.version)
    }

    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn event(&self, id: &str) -> Option<&FlowEvent> {
        self.events.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &FlowEvent> {
        self.events.values()
    }

    pub fn start(&self) -> &FlowNode {
        &self.nodes[&self.start_node]
    }

    pub fn outgoing<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a FlowEvent> + 'a {
        let ids = self.nodes.get(node_id).map(|n| n.events.as_slice()).unwrap_or(&[]);
        ids.iter().filter_map(move |id| self.events.get(id))
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a FlowEvent> + 'a {
        self.events.values().filter(move |e| e.to == node_id)
    }

    /// Node that consumes contexts positioned on `event_id`.
    pub fn event_target(&self, event_id: &str) -> Option<&FlowNode> {
        self.events.get(event_id).and_then(|e| self.nodes.get(&e.to))
    }

    pub fn with_status(mut self, status: DefinitionStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> GraphDocument {
        GraphDocument::new("linear")
            .node(GraphNode::new(FlowNodeKind::Start, "start"))
            .node(GraphNode::new(FlowNodeKind::State, "state1").with_task("log", json!({})))
            .node(GraphNode::new(FlowNodeKind::End, "end"))
            .event(FlowEvent::new("e1", "start", "state1"))
            .event(FlowEvent::new("e2", "state1", "end"))
    }

    #[test]
    fn test_linear_definition_is_valid() {
        let def = FlowDefinition::from_document(linear()).unwrap();
        assert_eq!(def.stream_id(), "linear-1.0.0");
        assert_eq!(def.start_node, "start");
        assert_eq!(def.event_target("e1").map(|n| n.meta_id.as_str()), Some("state1"));
        assert_eq!(def.outgoing("state1").count(), 1);
        assert_eq!(def.incoming("end").count(), 1);
    }

    #[test]
    fn test_parse_from_json_document() {
        let json = r#"{
            "metaId": "doc",
            "nodes": [
                {"type": "start", "metaId": "s"},
                {"type": "state", "metaId": "a", "task": {"type": "log"},
                 "properties": {"triggerMode": "manual", "errorPolicy": "retry", "maxRetries": 2}},
                {"type": "end", "metaId": "e"}
            ],
            "events": [
                {"metaId": "s-a", "from": "s", "to": "a", "taskFilter": {"type": "minimumSize", "threshold": 2}},
                {"metaId": "a-e", "from": "a", "to": "e"}
            ]
        }"#;
        let def = FlowDefinition::from_json(json).unwrap();
        let node = def.node("a").unwrap();
        assert!(node.is_manual());
        assert_eq!(
            node.properties.error_policy,
            ErrorPolicy::Retry { max_retries: 2, retry_delay_ms: 1000 }
        );
        assert_eq!(
            def.event("s-a").unwrap().task_filter,
            Some(TaskFilter::MinimumSize { threshold: 2 })
        );
    }

    #[test]
    fn test_rejects_two_start_nodes() {
        let doc = linear().node(GraphNode::new(FlowNodeKind::Start, "start2"));
        assert!(matches!(
            FlowDefinition::from_document(doc),
            Err(GraphValidationError::MultipleStartNodes(_))
        ));
    }

    #[test]
    fn test_rejects_event_to_unknown_node() {
        let doc = linear().event(FlowEvent::new("e3", "state1", "ghost"));
        assert_eq!(
            FlowDefinition::from_document(doc).unwrap_err(),
            GraphValidationError::UnknownNode { event: "e3".into(), node: "ghost".into() }
        );
    }

    #[test]
    fn test_rejects_state_with_two_outgoing_events() {
        let doc = linear()
            .node(GraphNode::new(FlowNodeKind::End, "end2"))
            .event(FlowEvent::new("e3", "state1", "end2"));
        assert!(matches!(
            FlowDefinition::from_document(doc),
            Err(GraphValidationError::EventCardinality { actual: 2, .. })
        ));
    }

    #[test]
    fn test_condition_events_need_rules() {
        let doc = GraphDocument::new("cond")
            .node(GraphNode::new(FlowNodeKind::Start, "start"))
            .node(GraphNode::new(FlowNodeKind::Condition, "check"))
            .node(GraphNode::new(FlowNodeKind::End, "end"))
            .event(FlowEvent::new("e1", "start", "check"))
            .event(FlowEvent::new("e2", "check", "end"));
        assert_eq!(
            FlowDefinition::from_document(doc).unwrap_err(),
            GraphValidationError::MissingConditionRule("e2".into())
        );
    }

    #[test]
    fn test_cycle_needs_condition_guard() {
        let unguarded = GraphDocument::new("loop")
            .node(GraphNode::new(FlowNodeKind::Start, "start"))
            .node(GraphNode::new(FlowNodeKind::Parallel, "fork"))
            .node(GraphNode::new(FlowNodeKind::State, "work"))
            .node(GraphNode::new(FlowNodeKind::End, "end"))
            .event(FlowEvent::new("e1", "start", "fork"))
            .event(FlowEvent::new("e2", "fork", "work"))
            .event(FlowEvent::new("e3", "fork", "end"))
            .event(FlowEvent::new("e4", "work", "fork"));
        assert!(matches!(
            FlowDefinition::from_document(unguarded),
            Err(GraphValidationError::CyclicDependency(_))
        ));

        let guarded = GraphDocument::new("retry-loop")
            .node(GraphNode::new(FlowNodeKind::Start, "start"))
            .node(GraphNode::new(FlowNodeKind::State, "work"))
            .node(GraphNode::new(FlowNodeKind::Condition, "check"))
            .node(GraphNode::new(FlowNodeKind::End, "end"))
            .event(FlowEvent::new("e1", "start", "work"))
            .event(FlowEvent::new("e2", "work", "check"))
            .event(FlowEvent::new("e3", "check", "work").with_condition("done == false"))
            .event(FlowEvent::new("e4", "check", "end").with_condition("done == true"));
        assert!(FlowDefinition::from_document(guarded).is_ok());
    }

    #[test]
    fn test_rejects_unreachable_node() {
        let doc = linear()
            .node(GraphNode::new(FlowNodeKind::State, "orphan"))
            .event(FlowEvent::new("e3", "orphan", "end"));
        assert_eq!(
            FlowDefinition::from_document(doc).unwrap_err(),
            GraphValidationError::Unreachable("orphan".into())
        );
    }

    #[test]
    fn test_rejects_bad_property() {
        let doc = GraphDocument::new("bad")
            .node(GraphNode::new(FlowNodeKind::Start, "start"))
            .node(GraphNode::new(FlowNodeKind::State, "s").with_property("triggerMode", "sometimes"))
            .node(GraphNode::new(FlowNodeKind::End, "end"))
            .event(FlowEvent::new("e1", "start", "s"))
            .event(FlowEvent::new("e2", "s", "end"));
        assert!(matches!(
            FlowDefinition::from_document(doc),
            Err(GraphValidationError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn test_max_retries_must_fit() {
        let retrying = |max_retries: u64| {
            GraphDocument::new("retries")
                .node(GraphNode::new(FlowNodeKind::Start, "start"))
                .node(
                    GraphNode::new(FlowNodeKind::State, "s")
                        .with_property("errorPolicy", "retry")
                        .with_property("maxRetries", max_retries),
                )
                .node(GraphNode::new(FlowNodeKind::End, "end"))
                .event(FlowEvent::new("e1", "start", "s"))
                .event(FlowEvent::new("e2", "s", "end"))
        };

        let definition = FlowDefinition::from_document(retrying(u64::from(u32::MAX))).unwrap();
        assert_eq!(
            definition.node("s").unwrap().properties.error_policy,
            ErrorPolicy::Retry {
                max_retries: u32::MAX,
                retry_delay_ms: 1000
            }
        );

        match FlowDefinition::from_document(retrying(u64::from(u32::MAX) + 1)) {
            Err(GraphValidationError::InvalidProperty { node, property, .. }) => {
                assert_eq!(node, "s");
                assert_eq!(property, "maxRetries");
            }
            other => panic!("expected maxRetries to be rejected, got {:?}", other.map(|d| d.stream_id())),
        }
    }
}
