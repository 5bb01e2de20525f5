// crates/flowcli/src/main.rs

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    ExecutionEvent, FlowData, FlowDefinition, FlowEvent, FlowNodeKind, FlowNodeStatus,
    FlowTraceStatus, GraphDocument, GraphNode,
};
use flowruntime::{FlowRuntime, JoberRegistry, RuntimeConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow graph in memory until its trace completes
    Run {
        /// Path to the graph document
        #[arg(short, long)]
        file: PathBuf,

        /// Input as JSON; an array starts one context per element
        #[arg(short, long)]
        input: Option<String>,

        #[arg(long, default_value = "cli")]
        operator: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Validate a graph document
    Validate {
        /// Path to the graph document
        file: PathBuf,
    },

    /// List available jober types
    Jobers,

    /// Write an example graph document
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Run {
            file,
            input,
            operator,
            timeout_secs,
        } => run_flow(&file, input, &operator, Duration::from_secs(timeout_secs)).await,
        Commands::Validate { file } => validate_flow(&file),
        Commands::Jobers => {
            list_jobers();
            Ok(())
        }
        Commands::Init { output } => create_example_flow(&output),
    }
}

fn builtin_registry() -> JoberRegistry {
    let mut registry = JoberRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

fn parse_input(input: Option<String>) -> Result<Vec<FlowData>> {
    let value: Value = match input {
        Some(text) => serde_json::from_str(&text).context("input is not valid JSON")?,
        None => json!({}),
    };
    Ok(match value {
        Value::Array(items) => items.into_iter().map(FlowData::new).collect(),
        other => vec![FlowData::new(other)],
    })
}

async fn run_flow(file: &Path, input: Option<String>, operator: &str, timeout: Duration) -> Result<()> {
    let graph = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let data = parse_input(input)?;

    let runtime = Arc::new(flownodes::with_builtins(FlowRuntime::builder(RuntimeConfig::from_env()?)).build());
    let stream_id = runtime.register_graph_json(&graph).await?;
    println!("Loaded flow {}", stream_id);

    let mut events = runtime.subscribe_events();
    let trace_id = runtime.start(&stream_id, data, operator, "cli").await?;
    println!("Started trace {}", trace_id);

    let status = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if event.trace_id() != trace_id => {}
                Ok(ExecutionEvent::NodeProcessed {
                    node_id,
                    consumed,
                    emitted,
                    ..
                }) => println!("  {} consumed {} emitted {}", node_id, consumed, emitted),
                Ok(ExecutionEvent::ContextsHeld {
                    node_id, context_ids, ..
                }) => println!(
                    "  {} holds {} contexts for manual completion",
                    node_id,
                    context_ids.len()
                ),
                Ok(ExecutionEvent::ContextsFailed {
                    node_id, status, error, ..
                }) => println!("  {} failed ({}): {}", node_id, status, error),
                Ok(ExecutionEvent::TraceCompleted { status, .. }) => return Some(status),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => tracing::warn!("Missed {} execution events", missed),
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .map_err(|_| anyhow!("trace {} did not finish within {:?}", trace_id, timeout))?
    .ok_or_else(|| anyhow!("event bus closed before trace {} finished", trace_id))?;

    let trace = runtime.trace(&trace_id).await?;
    runtime.shutdown().await;

    println!();
    println!("Trace {} finished: {}", trace_id, status);
    if let Some(error) = trace.and_then(|t| t.error) {
        println!("  error: {}", error);
    }

    let ends = end_nodes(&graph)?;
    for context in runtime.contexts(&trace_id).await? {
        if context.status == FlowNodeStatus::Archived && ends.contains(&context.position) {
            println!("{}", serde_json::to_string_pretty(&context.data)?);
        }
    }

    if status != FlowTraceStatus::Archived {
        bail!("trace {} ended {}", trace_id, status);
    }
    Ok(())
}

fn end_nodes(graph: &str) -> Result<Vec<String>> {
    let definition = FlowDefinition::from_json(graph)?;
    Ok(definition
        .nodes()
        .filter(|n| n.kind == FlowNodeKind::End)
        .map(|n| n.meta_id.clone())
        .collect())
}

fn validate_flow(file: &Path) -> Result<()> {
    let graph = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let definition = FlowDefinition::from_json(&graph)?;

    let registry = builtin_registry();
    let unknown: Vec<String> = definition
        .nodes()
        .filter_map(|n| n.task.as_ref().map(|t| (n, t)))
        .filter(|(_, task)| !registry.contains(&task.jober_type))
        .map(|(node, task)| format!("{} ({})", node.meta_id, task.jober_type))
        .collect();
    if !unknown.is_empty() {
        bail!("unknown jober types on nodes: {}", unknown.join(", "));
    }

    println!("Flow {} is valid", definition.stream_id());
    println!("  Nodes: {}", definition.nodes().count());
    println!("  Events: {}", definition.events().count());
    if !definition.is_active() {
        println!("  Status: inactive, traces cannot be started");
    }
    Ok(())
}

fn list_jobers() {
    let registry = builtin_registry();
    println!("Available jober types:");
    for jober_type in registry.list_jober_types() {
        match registry.get_metadata(&jober_type) {
            Some(metadata) => {
                println!("  {} ({})", jober_type, metadata.category);
                println!("    {}", metadata.description);
                for key in metadata.config_keys {
                    let marker = if key.required { " (required)" } else { "" };
                    println!("      {}{}: {}", key.name, marker, key.description);
                }
            }
            None => println!("  {}", jober_type),
        }
    }
}

fn example_flow() -> GraphDocument {
    GraphDocument::new("example")
        .node(GraphNode::new(FlowNodeKind::Start, "start"))
        .node(GraphNode::new(FlowNodeKind::Condition, "check"))
        .node(
            GraphNode::new(FlowNodeKind::State, "large")
                .with_task("json.set", json!({"values": {"size": "large"}})),
        )
        .node(
            GraphNode::new(FlowNodeKind::State, "small")
                .with_task("json.set", json!({"values": {"size": "small"}})),
        )
        .node(GraphNode::new(FlowNodeKind::State, "log").with_task("log", json!({"message": "sized"})))
        .node(GraphNode::new(FlowNodeKind::End, "end"))
        .event(FlowEvent::new("to-check", "start", "check"))
        .event(FlowEvent::new("is-large", "check", "large").with_condition("amount > 100"))
        .event(FlowEvent::new("is-small", "check", "small").with_condition("!(amount > 100)"))
        .event(FlowEvent::new("large-log", "large", "log"))
        .event(FlowEvent::new("small-log", "small", "log"))
        .event(FlowEvent::new("to-end", "log", "end"))
}

fn create_example_flow(output: &Path) -> Result<()> {
    let document = example_flow();
    FlowDefinition::from_document(document.clone())?;
    std::fs::write(output, serde_json::to_string_pretty(&document)?)?;

    println!("Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {} --input '{{\"amount\": 250}}'", output.display());
    Ok(())
}
