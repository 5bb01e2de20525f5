// crates/flowruntime/tests/pipeline_test.rs

mod common;

use common::*;
use flowcore::{
    ConditionEvaluationError, DefinitionStatus, ExecutionEvent, FlowData, FlowError, FlowEvent,
    FlowLockGuard, FlowLocks, FlowNodeKind, FlowNodeStatus, FlowTraceStatus, FnJober,
    GraphDocument, GraphNode, Jober, JoberContext, LocalFlowLocks, LockError, NodeError, TaskFilter,
};
use flowruntime::FlowRuntime;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn linear(meta_id: &str, state: GraphNode) -> GraphDocument {
    GraphDocument::new(meta_id)
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(state)
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("e1", "start", "s1"))
        .event(FlowEvent::new("e2", "s1", "end"))
}

fn increment_state() -> GraphNode {
    GraphNode::new(FlowNodeKind::State, "s1").with_task("increment", json!({}))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_linear_flow_archives_trace() {
    init_tracing();
    let runtime = runtime_with(vec![increment(1)]);
    let stream_id = register(&runtime, linear("linear", increment_state())).await;
    let mut events = runtime.subscribe_events();

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "alice", "app")
        .await
        .unwrap();

    let trace = wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;
    assert!(trace.end_time.is_some(), "archived trace should have an end time");

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert!(
        contexts.iter().all(|c| c.status == FlowNodeStatus::Archived),
        "every context should be archived: {:#?}",
        contexts
    );
    let finished = at(&contexts, "end", FlowNodeStatus::Archived);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].data.business, json!({"x": 2}));
    assert_eq!(finished[0].operator, "alice");
    for context in &contexts {
        assert!(trace.context_pool.contains(&context.id), "context pool should list {}", context.id);
    }
    assert!(!runtime.owner().is_own(&trace_id), "ownership should be released");

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ExecutionEvent::TraceCompleted { trace_id: id, status, .. }) = events.recv().await {
                if id == trace_id {
                    return status;
                }
            }
        }
    })
    .await
    .expect("TraceCompleted event");
    assert_eq!(completed, FlowTraceStatus::Archived);
}

fn branching(meta_id: &str, true_rule: &str, false_rule: Option<&str>) -> GraphDocument {
    let mut document = GraphDocument::new(meta_id)
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::Condition, "check"))
        .node(GraphNode::new(FlowNodeKind::End, "end_true"))
        .event(FlowEvent::new("e_in", "start", "check"))
        .event(FlowEvent::new("e_true", "check", "end_true").with_condition(true_rule));
    if let Some(rule) = false_rule {
        document = document
            .node(GraphNode::new(FlowNodeKind::End, "end_false"))
            .event(FlowEvent::new("e_false", "check", "end_false").with_condition(rule));
    }
    document
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_condition_routes_by_rule() {
    init_tracing();
    let runtime = runtime_with(vec![]);
    let stream_id = register(&runtime, branching("branch", "x > 0", Some("x <= 0"))).await;

    for (x, expected, other) in [(5, "end_true", "end_false"), (-1, "end_false", "end_true")] {
        let trace_id = runtime
            .start(&stream_id, vec![FlowData::new(json!({ "x": x }))], "op", "app")
            .await
            .unwrap();
        wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;

        let contexts = runtime.contexts(&trace_id).await.unwrap();
        assert_eq!(at(&contexts, expected, FlowNodeStatus::Archived).len(), 1, "x={} should reach {}", x, expected);
        assert!(contexts.iter().all(|c| c.position != other), "x={} must not reach {}", x, other);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_condition_without_match_completes_trace() {
    init_tracing();
    let runtime = runtime_with(vec![]);
    let stream_id = register(&runtime, branching("nomatch", "x > 10", None)).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert_eq!(at(&contexts, "check", FlowNodeStatus::Archived).len(), 1);
    assert!(at(&contexts, "end_true", FlowNodeStatus::Archived).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_condition_evaluation_error_fails_trace() {
    init_tracing();
    let runtime = runtime_with(vec![]);
    let stream_id = register(&runtime, branching("broken", "not a rule", None)).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let trace = wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Error).await;
    assert!(trace.error.unwrap().contains("not a rule"));

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    let failed = at(&contexts, "check", FlowNodeStatus::Error);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.is_some());
}

fn tag(name: &'static str) -> Arc<dyn flowcore::Jober> {
    Arc::new(FnJober::new(format!("tag_{}", name), move |data: Vec<FlowData>| {
        Ok(data
            .into_iter()
            .map(|d| d.with_business(json!({ name: true })))
            .collect())
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_join_merges_branches_once() {
    init_tracing();
    let runtime = runtime_with(vec![tag("a"), tag("b")]);
    let document = GraphDocument::new("fanout")
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::Parallel, "fork"))
        .node(GraphNode::new(FlowNodeKind::State, "a").with_task("tag_a", json!({})))
        .node(GraphNode::new(FlowNodeKind::State, "b").with_task("tag_b", json!({})))
        .node(GraphNode::new(FlowNodeKind::Join, "join"))
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("e0", "start", "fork"))
        .event(FlowEvent::new("ea", "fork", "a"))
        .event(FlowEvent::new("eb", "fork", "b"))
        .event(FlowEvent::new("ja", "a", "join"))
        .event(FlowEvent::new("jb", "b", "join"))
        .event(FlowEvent::new("e_end", "join", "end"));
    let stream_id = register(&runtime, document).await;

    let input = FlowData::new(json!({"x": 1})).with_pass_data("request", "r-1");
    let trace_id = runtime.start(&stream_id, vec![input], "op", "app").await.unwrap();
    wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    let fork_input = &at(&contexts, "fork", FlowNodeStatus::Archived)[0];
    let members = at(&contexts, "join", FlowNodeStatus::Archived);
    assert_eq!(members.len(), 2, "both branches reach the join");
    assert!(members.iter().all(|m| m.to_batch == fork_input.id), "branches share the fork batch");

    let finished = at(&contexts, "end", FlowNodeStatus::Archived);
    assert_eq!(finished.len(), 1, "join emits exactly once");
    assert_eq!(finished[0].data.business, json!({"a": true, "b": true}));
    assert_eq!(finished[0].data.pass_data.get("request"), Some(&json!("r-1")));
}

/// start -> fork -> {a, b, c} -> join -> end, with `c` waiting for manual completion
fn three_way() -> GraphDocument {
    GraphDocument::new("threeway")
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::Parallel, "fork"))
        .node(GraphNode::new(FlowNodeKind::State, "a").with_task("tag_a", json!({})))
        .node(GraphNode::new(FlowNodeKind::State, "b").with_task("tag_b", json!({})))
        .node(
            GraphNode::new(FlowNodeKind::State, "c")
                .with_task("tag_c", json!({}))
                .with_property("triggerMode", "manual"),
        )
        .node(GraphNode::new(FlowNodeKind::Join, "join"))
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("e0", "start", "fork"))
        .event(FlowEvent::new("ea", "fork", "a"))
        .event(FlowEvent::new("eb", "fork", "b"))
        .event(FlowEvent::new("ec", "fork", "c"))
        .event(FlowEvent::new("ja", "a", "join"))
        .event(FlowEvent::new("jb", "b", "join"))
        .event(FlowEvent::new("jc", "c", "join"))
        .event(FlowEvent::new("e_end", "join", "end"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_fires_only_after_last_branch() {
    init_tracing();
    let runtime = runtime_with(vec![tag("a"), tag("b"), tag("c")]);
    let stream_id = register(&runtime, three_way()).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let contexts = wait_for_contexts(&runtime, &trace_id, |cs| {
        at(cs, "join", FlowNodeStatus::Ready).len() == 2 && at(cs, "c", FlowNodeStatus::Ready).len() == 1
    })
    .await;
    let gated = at(&contexts, "c", FlowNodeStatus::Ready)[0].id.clone();
    let pipeline = runtime.pipeline(&stream_id).await.unwrap();
    let join = pipeline.node("join").unwrap().clone();
    wait_until("two members wait at the join", || join.buffered(&trace_id) == 2).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert_eq!(at(&contexts, "join", FlowNodeStatus::Ready).len(), 2, "join holds two of three");
    assert!(at(&contexts, "join", FlowNodeStatus::Archived).is_empty());
    assert!(
        contexts.iter().all(|c| c.position != "e_end" && c.position != "end"),
        "nothing passes the join before the third member"
    );
    assert_eq!(
        runtime.trace(&trace_id).await.unwrap().unwrap().status,
        FlowTraceStatus::Running
    );

    wait_until("c holds its context", || {
        pipeline.node("c").unwrap().held_context_ids() == vec![gated.clone()]
    })
    .await;
    assert_eq!(runtime.complete(&trace_id, "c", vec![gated], None).await.unwrap(), 1);
    wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert_eq!(at(&contexts, "join", FlowNodeStatus::Archived).len(), 3);
    let finished = at(&contexts, "end", FlowNodeStatus::Archived);
    assert_eq!(finished.len(), 1, "join emits exactly once");
    assert_eq!(finished[0].data.business, json!({"a": true, "b": true, "c": true}));
    assert_eq!(join.buffered(&trace_id), 0);
}

/// Local locks that refuse every join barrier key.
struct BrokenJoinLocks(LocalFlowLocks);

#[async_trait::async_trait]
impl FlowLocks for BrokenJoinLocks {
    async fn acquire(&self, key: &str) -> Result<FlowLockGuard, LockError> {
        if key.starts_with("join-") {
            return Err(LockError::Timeout(key.to_string()));
        }
        self.0.acquire(key).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_failure_marks_contexts_and_trace() {
    init_tracing();
    let mut builder = builder("worker-locks").locks(Arc::new(BrokenJoinLocks(LocalFlowLocks::new())));
    builder.registry_mut().register_jober(tag("a"));
    builder.registry_mut().register_jober(tag("b"));
    let runtime = Arc::new(builder.build());
    let document = GraphDocument::new("brokenjoin")
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::Parallel, "fork"))
        .node(GraphNode::new(FlowNodeKind::State, "a").with_task("tag_a", json!({})))
        .node(GraphNode::new(FlowNodeKind::State, "b").with_task("tag_b", json!({})))
        .node(GraphNode::new(FlowNodeKind::Join, "join"))
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("e0", "start", "fork"))
        .event(FlowEvent::new("ea", "fork", "a"))
        .event(FlowEvent::new("eb", "fork", "b"))
        .event(FlowEvent::new("ja", "a", "join"))
        .event(FlowEvent::new("jb", "b", "join"))
        .event(FlowEvent::new("e_end", "join", "end"));
    let stream_id = register(&runtime, document).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let trace = wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Error).await;
    assert!(trace.error.unwrap().contains("join-join"));
    assert!(!runtime.owner().is_own(&trace_id));

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert!(!at(&contexts, "join", FlowNodeStatus::Error).is_empty());
    assert!(at(&contexts, "join", FlowNodeStatus::Ready).is_empty(), "no claimed context is left behind");
    assert!(contexts.iter().all(|c| c.position != "end"));
}

/// Sleeps, then fails without a retry policy.
struct SlowFailure;

#[async_trait::async_trait]
impl Jober for SlowFailure {
    fn jober_type(&self) -> &str {
        "slow_failure"
    }

    async fn execute(&self, _ctx: &JoberContext, _data: Vec<FlowData>) -> Result<Vec<FlowData>, NodeError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(NodeError::ExecutionFailed("branch gave up".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_trace_leaves_no_join_arrivals_behind() {
    init_tracing();
    let mut fast = config("worker-sweep");
    fast.buffer_sweep_interval = Duration::from_millis(20);
    let mut builder = FlowRuntime::builder(fast).evaluator(test_evaluator());
    builder.registry_mut().register_jober(Arc::new(SlowFailure));
    builder.registry_mut().register_jober(tag("b"));
    let runtime = Arc::new(builder.build());
    let document = GraphDocument::new("halfjoin")
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::Parallel, "fork"))
        .node(GraphNode::new(FlowNodeKind::State, "a").with_task("slow_failure", json!({})))
        .node(GraphNode::new(FlowNodeKind::State, "b").with_task("tag_b", json!({})))
        .node(GraphNode::new(FlowNodeKind::Join, "join"))
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("e0", "start", "fork"))
        .event(FlowEvent::new("ea", "fork", "a"))
        .event(FlowEvent::new("eb", "fork", "b"))
        .event(FlowEvent::new("ja", "a", "join"))
        .event(FlowEvent::new("jb", "b", "join"))
        .event(FlowEvent::new("e_end", "join", "end"));
    let stream_id = register(&runtime, document).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let pipeline = runtime.pipeline(&stream_id).await.unwrap();
    let join = pipeline.node("join").unwrap().clone();
    wait_until("branch b waits at the join", || join.buffered(&trace_id) == 1).await;

    let trace = wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Error).await;
    assert!(trace.error.unwrap().contains("branch gave up"));
    wait_until("the join forgets the failed trace", || join.buffered(&trace_id) == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manual_state_holds_until_completed() {
    init_tracing();
    let runtime = runtime_with(vec![increment(1)]);
    let manual = increment_state().with_property("triggerMode", "manual");
    let stream_id = register(&runtime, linear("manual", manual)).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let contexts = wait_for_contexts(&runtime, &trace_id, |cs| {
        !at(cs, "s1", FlowNodeStatus::Ready).is_empty()
    })
    .await;
    let held = at(&contexts, "s1", FlowNodeStatus::Ready);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let trace = runtime.trace(&trace_id).await.unwrap().unwrap();
    assert_eq!(trace.status, FlowTraceStatus::Running, "manual node must not advance on its own");

    let pipeline = runtime.pipeline(&stream_id).await.unwrap();
    assert_eq!(pipeline.node("s1").unwrap().held_context_ids(), vec![held[0].id.clone()]);

    let released = runtime
        .complete(
            &trace_id,
            "s1",
            vec![held[0].id.clone()],
            Some(vec![FlowData::new(json!({"x": 41}))]),
        )
        .await
        .unwrap();
    assert_eq!(released, 1);

    wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;
    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert_eq!(at(&contexts, "end", FlowNodeStatus::Archived)[0].data.business, json!({"x": 42}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_complete_rejects_automatic_node() {
    init_tracing();
    let runtime = runtime_with(vec![increment(1)]);
    let stream_id = register(&runtime, linear("auto", increment_state())).await;
    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();

    let pipeline = runtime.pipeline(&stream_id).await.unwrap();
    let result = pipeline.node("s1").unwrap().complete(vec![], None).await;
    assert!(matches!(result, Err(FlowError::Configuration(_))));

    let missing = runtime.complete(&trace_id, "nope", vec![], None).await;
    assert!(matches!(
        missing,
        Err(FlowError::NodeNotFound(_)) | Err(FlowError::TraceTerminated { .. })
    ));
}

/// Reports how many payloads it saw, once per batch.
fn counter(calls: Arc<AtomicUsize>) -> Arc<dyn flowcore::Jober> {
    Arc::new(FnJober::new("count", move |data: Vec<FlowData>| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![FlowData::new(json!({ "count": data.len() }))])
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minimum_size_filter_releases_full_batches() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let runtime = runtime_with(vec![counter(calls.clone())]);
    let document = GraphDocument::new("batched")
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::State, "s1").with_task("count", json!({})))
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("e1", "start", "s1").with_filter(TaskFilter::MinimumSize { threshold: 2 }))
        .event(FlowEvent::new("e2", "s1", "end"));
    let stream_id = register(&runtime, document).await;

    let inputs = (0..4).map(|i| FlowData::new(json!({ "x": i }))).collect();
    let trace_id = runtime.start(&stream_id, inputs, "op", "app").await.unwrap();
    wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2, "four inputs make two batches of two");
    let contexts = runtime.contexts(&trace_id).await.unwrap();
    let finished = at(&contexts, "end", FlowNodeStatus::Archived);
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|c| c.data.business == json!({"count": 2})));

    // an incomplete batch stays pending on the event
    let lonely = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 9}))], "op", "app")
        .await
        .unwrap();
    let contexts = wait_for_contexts(&runtime, &lonely, |cs| {
        !at(cs, "e1", FlowNodeStatus::Pending).is_empty()
    })
    .await;
    assert_eq!(at(&contexts, "e1", FlowNodeStatus::Pending).len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pipeline = runtime.pipeline(&stream_id).await.unwrap();
    assert_eq!(pipeline.node("s1").unwrap().filtered_waiting(), 1);
    assert_eq!(
        runtime.trace(&lonely).await.unwrap().unwrap().status,
        FlowTraceStatus::Running
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_post_filter_and_fan_out() {
    init_tracing();
    let split: Arc<dyn flowcore::Jober> = Arc::new(FnJober::new("split", |data: Vec<FlowData>| {
        Ok(data
            .iter()
            .flat_map(|d| {
                let x = d.get("x").and_then(Value::as_i64).unwrap_or(0);
                vec![
                    FlowData::new(json!({ "x": x })),
                    FlowData::new(json!({ "x": x + 20 })),
                ]
            })
            .collect())
    }));
    let runtime = runtime_with(vec![split]);
    let state = GraphNode::new(FlowNodeKind::State, "s1")
        .with_task("split", json!({}))
        .with_property("postFilter", "x > 10");
    let stream_id = register(&runtime, linear("split", state)).await;

    let input = FlowData::new(json!({"x": 1})).with_pass_data("tenant", "t-9");
    let trace_id = runtime.start(&stream_id, vec![input], "op", "app").await.unwrap();
    wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Archived).await;

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    let start = &contexts.iter().find(|c| c.position == "start").unwrap();
    let finished = at(&contexts, "end", FlowNodeStatus::Archived);
    assert_eq!(finished.len(), 1, "post-filter drops the x=1 output");
    assert_eq!(finished[0].data.business, json!({"x": 21}));
    assert_eq!(finished[0].to_batch, start.to_batch, "outputs inherit the input batch");
    assert_eq!(finished[0].data.pass_data.get("tenant"), Some(&json!("t-9")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jober_failure_fails_trace() {
    init_tracing();
    let failing: Arc<dyn flowcore::Jober> = Arc::new(FnJober::new("boom", |_data: Vec<FlowData>| {
        Err(NodeError::ExecutionFailed("upstream unavailable".to_string()))
    }));
    let runtime = runtime_with(vec![failing]);
    let state = GraphNode::new(FlowNodeKind::State, "s1").with_task("boom", json!({}));
    let stream_id = register(&runtime, linear("boom", state)).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let trace = wait_for_trace_status(&runtime, &trace_id, FlowTraceStatus::Error).await;
    assert!(trace.error.unwrap().contains("upstream unavailable"));

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    assert_eq!(at(&contexts, "s1", FlowNodeStatus::Error).len(), 1);
    assert!(at(&contexts, "end", FlowNodeStatus::Archived).is_empty());

    // exclusive status is final
    assert!(matches!(
        runtime.terminate(&trace_id).await,
        Err(FlowError::TraceTerminated { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_stops_trace() {
    init_tracing();
    let runtime = runtime_with(vec![increment(1)]);
    let manual = increment_state().with_property("triggerMode", "manual");
    let stream_id = register(&runtime, linear("terminate", manual)).await;

    let trace_id = runtime
        .start(&stream_id, vec![FlowData::new(json!({"x": 1}))], "op", "app")
        .await
        .unwrap();
    let contexts = wait_for_contexts(&runtime, &trace_id, |cs| {
        !at(cs, "s1", FlowNodeStatus::Ready).is_empty()
    })
    .await;
    let held = at(&contexts, "s1", FlowNodeStatus::Ready)[0].id.clone();
    let pipeline = runtime.pipeline(&stream_id).await.unwrap();
    let node = pipeline.node("s1").unwrap().clone();
    wait_until("s1 holds the context", || node.held_context_ids() == vec![held.clone()]).await;

    runtime.terminate(&trace_id).await.unwrap();
    let trace = runtime.trace(&trace_id).await.unwrap().unwrap();
    assert_eq!(trace.status, FlowTraceStatus::Terminate);
    assert!(!runtime.owner().is_own(&trace_id));
    assert!(node.held_context_ids().is_empty(), "terminated contexts are no longer held");
    assert_eq!(node.buffered(&trace_id), 0);

    let result = runtime.complete(&trace_id, "s1", vec![held.clone()], None).await;
    assert!(matches!(result, Err(FlowError::TraceTerminated { .. })));

    let contexts = runtime.contexts(&trace_id).await.unwrap();
    let context = contexts.iter().find(|c| c.id == held).unwrap();
    assert_eq!(context.status, FlowNodeStatus::Ready, "terminated contexts keep their status");
}

#[tokio::test]
async fn test_unknown_and_inactive_definitions() {
    init_tracing();
    let runtime = runtime_with(vec![increment(1)]);
    let missing = runtime.start("nope-1.0.0", vec![FlowData::default()], "op", "app").await;
    assert!(matches!(missing, Err(FlowError::DefinitionNotFound(_))));

    let stream_id = register(&runtime, linear("inactive", increment_state())).await;
    runtime
        .set_definition_status(&stream_id, DefinitionStatus::Inactive)
        .await
        .unwrap();
    let inactive = runtime
        .start(&stream_id, vec![FlowData::default()], "op", "app")
        .await;
    assert!(matches!(inactive, Err(FlowError::DefinitionInactive(_))));
}

#[tokio::test]
async fn test_conditions_need_an_evaluator() {
    init_tracing();
    let runtime = FlowRuntime::builder(config("worker-bare")).build();
    let stream_id = register(&runtime, branching("bare", "x > 0", None)).await;
    let result = runtime.pipeline(&stream_id).await;
    assert!(matches!(
        result,
        Err(FlowError::Condition(ConditionEvaluationError::NoEvaluator(_)))
    ));
}

#[tokio::test]
async fn test_unknown_jober_type() {
    init_tracing();
    let runtime = runtime_with(vec![]);
    let stream_id = register(&runtime, linear("nojober", increment_state())).await;
    let result = runtime.pipeline(&stream_id).await;
    assert!(matches!(result, Err(FlowError::Node(NodeError::UnknownJober(t))) if t == "increment"));
}
