use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use graphcore::{GraphNode, NodeSummary, PipelineEvent, EXECUTOR_PARAMETER, OUTPUT_PARAMETER, SELF_SLOT};
use graphnodes::{Mask, OutputNode};
use graphruntime::{GenerationRuntime, Graph, OperationRegistry, RunSummary, RuntimeConfig};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gen")]
#[command(about = "Generation graph CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the demo mask pipeline
    Run {
        /// Root seed
        #[arg(short, long, default_value_t = 0)]
        seed: u64,

        /// Worker pool size
        #[arg(short, long)]
        workers: Option<usize>,

        /// Mask edge length
        #[arg(long, default_value_t = 16)]
        size: usize,

        /// Skip undefined nodes instead of failing
        #[arg(long)]
        lenient: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available operations
    Ops,

    /// Print an operation descriptor as JSON
    Describe {
        /// Operation name, e.g. mask.erode
        operation: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            seed,
            workers,
            size,
            lenient,
            json,
        } => {
            let mut config = RuntimeConfig::default().with_seed(seed);
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if lenient {
                config = config.lenient();
            }
            run_pipeline(config, size, json).await?;
        }

        Commands::Ops => {
            list_operations()?;
        }

        Commands::Describe { operation } => {
            describe_operation(&operation)?;
        }
    }

    Ok(())
}

fn registry() -> Result<OperationRegistry> {
    let mut registry = OperationRegistry::new();
    graphnodes::register_all(&mut registry)?;
    Ok(registry)
}

/// Nodes of the demo pipeline the report refers to
struct Demo {
    graph: Graph,
    output: Arc<GraphNode>,
}

/// noise -> erode -> add(gradient) -> multiply -> threshold -> output
fn build_demo(runtime: &GenerationRuntime, size: usize) -> Result<Demo> {
    let registry = runtime.registry();
    let context = runtime.context();
    let mut graph = Graph::new();

    context.define("size", size as i64);
    context.define("level", 0.5);

    let noise = graph.add(registry.create_node("mask.noise")?)?;
    noise.set_parameter("size", "size")?;
    noise.set_parameter("seed", (context.next_seed() >> 1) as i64)?;

    let erode = graph.add(registry.create_node("mask.erode")?)?;
    erode.bind(EXECUTOR_PARAMETER, &noise, SELF_SLOT)?;
    erode.set_parameter("density", "0.35")?;

    let gradient = graph.add(registry.create_node("mask.gradient")?)?;
    gradient.set_parameter("size", "size")?;

    let add = graph.add(registry.create_node("mask.add")?)?;
    add.bind(EXECUTOR_PARAMETER, &erode, SELF_SLOT)?;
    add.bind("other", &gradient, SELF_SLOT)?;

    let scale = graph.add(registry.create_node("mask.multiply")?)?;
    scale.bind(EXECUTOR_PARAMETER, &add, SELF_SLOT)?;
    scale.set_parameter("scale", "0.5")?;

    let threshold = graph.add(registry.create_node("mask.threshold")?)?;
    threshold.bind(EXECUTOR_PARAMETER, &scale, SELF_SLOT)?;
    threshold.set_parameter("level", "level")?;

    let output = graph.add(registry.create_node("mask.output")?)?;
    output.bind(OUTPUT_PARAMETER, &threshold, "result")?;

    tracing::debug!("Demo graph built: {} nodes, {} edges", graph.len(), graph.edges().len());
    Ok(Demo { graph, output })
}

#[derive(Serialize)]
struct Report {
    run_id: String,
    seed: u64,
    entries: usize,
    computed: usize,
    skipped: usize,
    duration_ms: u64,
    coverage: Option<f32>,
    nodes: Vec<NodeSummary>,
    edges: Vec<String>,
}

impl Report {
    fn new(summary: &RunSummary, seed: u64, demo: &Demo) -> Self {
        Self {
            run_id: summary.run_id.to_string(),
            seed,
            entries: summary.entries,
            computed: summary.computed,
            skipped: summary.skipped,
            duration_ms: summary.duration_ms,
            coverage: OutputNode::<Mask>::collect(&demo.output).ok().map(|mask| mask.mean()),
            nodes: demo.graph.nodes().iter().map(|node| node.describe()).collect(),
            edges: demo.graph.edges().iter().map(|edge| edge.to_string()).collect(),
        }
    }
}

async fn run_pipeline(config: RuntimeConfig, size: usize, json: bool) -> Result<()> {
    let seed = config.seed;
    let runtime = GenerationRuntime::with_registry(Arc::new(registry()?), config)?;
    let demo = build_demo(&runtime, size)?;

    if !json {
        println!("🚀 Running demo pipeline (seed {}, {} nodes)", seed, demo.graph.len());
    }

    let event_task = tokio::spawn(print_events(runtime.subscribe_events(), json));

    let result = runtime.run(&demo.graph).await;
    // Closes the event channel so the listener drains and exits.
    drop(runtime);
    let _ = event_task.await;
    let summary = result.context("pipeline run failed")?;

    let report = Report::new(&summary, seed, &demo);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", report.run_id);
    println!("   Computed: {}/{} nodes", report.computed, report.entries);
    if let Some(coverage) = report.coverage {
        println!("   Threshold coverage: {:.1}%", coverage * 100.0);
    }
    println!();
    println!("🔗 Edges:");
    for edge in &report.edges {
        println!("   {}", edge);
    }

    Ok(())
}

/// Prints pipeline events until the channel closes. Returns how many were
/// received; a lagging receiver logs the gap and keeps listening.
async fn print_events(mut events: Receiver<PipelineEvent>, quiet: bool) -> usize {
    let mut received = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Event listener lagged, {} events dropped", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        received += 1;
        if quiet {
            continue;
        }
        match event {
            PipelineEvent::PipelineStarted { entries, .. } => {
                println!("▶️  Pipeline started ({} entries)", entries);
            }
            PipelineEvent::EntryCompleted { name, duration_ms, .. } => {
                println!("  ✅ {} completed in {}ms", name, duration_ms);
            }
            PipelineEvent::EntryFailed { name, error, .. } => {
                println!("  ❌ {} failed: {}", name, error);
            }
            PipelineEvent::NodeComputed { node, operation, .. } => {
                println!("  ⚡ {} computed ({})", node, operation);
            }
            PipelineEvent::NodeSkipped { node, parameter, .. } => {
                println!("  ⏭️  {} skipped: '{}' undefined", node, parameter);
            }
            PipelineEvent::PipelineDrained { completed, failed, duration_ms, .. } => {
                println!("✨ Pipeline drained: {} completed, {} failed in {}ms", completed, failed, duration_ms);
            }
            PipelineEvent::EntryStarted { .. } => {}
        }
    }
    received
}

fn list_operations() -> Result<()> {
    println!("📦 Available Operations:");
    println!();

    let registry = registry()?;
    for name in registry.list_operations() {
        let operation = registry.operation(&name)?;
        match registry.metadata(&name) {
            Some(metadata) => {
                println!("  • {} ({}) [{}]", name, operation.executable_name(), metadata.category);
                println!("    {}", metadata.description);
            }
            None => println!("  • {} ({})", name, operation.executable_name()),
        }
    }

    Ok(())
}

fn describe_operation(name: &str) -> Result<()> {
    let registry = registry()?;
    let descriptor = registry.descriptor(name)?;
    println!("{}", serde_json::to_string_pretty(descriptor)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use graphcore::{EventBus, RunId};

    fn drained(completed: usize) -> PipelineEvent {
        PipelineEvent::PipelineDrained {
            run_id: RunId::nil(),
            completed,
            failed: 0,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_listener_survives_lag() {
        let bus = EventBus::new(2);
        let events = bus.subscribe();
        for i in 0..5 {
            bus.emit(drained(i));
        }
        drop(bus);

        // Three events were overwritten; the last two are still delivered.
        assert_eq!(print_events(events, true).await, 2);
    }

    #[test]
    fn test_demo_graph_builds() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let generation = GenerationRuntime::with_registry(Arc::new(registry().unwrap()), RuntimeConfig::default()).unwrap();
        let demo = build_demo(&generation, 4).unwrap();
        assert_eq!(demo.graph.len(), 7);
        assert!(demo.graph.validate().is_ok());
    }
}
