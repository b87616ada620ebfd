//! CLI binary for validating, inspecting, and dry-running Switchyard flowcharts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use switchyard_engine::{
    validate, EdgeDraft, EngineConfig, ExecutionRequest, ExecutorError, FlowchartService,
    NodeDraft, NodeExecutor, NodeOutcome, NodeType, RunBudgets, RunStatus,
    UncertainDispatchPolicy,
};
use switchyard_types::RunId;

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Flowchart orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flowchart file against the dry-run executor
    Run {
        /// Path to the flowchart .json file
        flowchart: PathBuf,

        /// Route key a decision node returns, as NODE=KEY (NODE is a title or id)
        #[arg(long = "route", value_parser = parse_route)]
        routes: Vec<(String, String)>,

        /// Seconds to wait for the run to finish
        #[arg(long, default_value = "60")]
        timeout: u64,

        /// Save a snapshot of the engine state here when done
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Complete unreachable-executor nodes as degraded instead of failing them
        #[arg(long)]
        degrade: bool,
    },

    /// Validate a flowchart .json file
    Validate {
        /// Path to the flowchart .json file
        flowchart: PathBuf,
    },

    /// Show information about a flowchart
    Info {
        /// Path to the flowchart .json file
        flowchart: PathBuf,
    },

    /// Resume unfinished runs from a snapshot directory
    Recover {
        /// Directory holding switchyard.json
        snapshot: PathBuf,

        #[arg(long = "route", value_parser = parse_route)]
        routes: Vec<(String, String)>,

        #[arg(long, default_value = "60")]
        timeout: u64,
    },
}

/// On-disk flowchart definition.
#[derive(Debug, Deserialize)]
struct FlowchartFile {
    name: String,
    #[serde(default)]
    budgets: RunBudgets,
    #[serde(default)]
    nodes: Vec<NodeDraft>,
    #[serde(default)]
    edges: Vec<EdgeDraft>,
}

fn parse_route(s: &str) -> Result<(String, String), String> {
    let (node, key) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NODE=KEY, got '{s}'"))?;
    Ok((node.trim().to_string(), key.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run {
            flowchart,
            routes,
            timeout,
            snapshot,
            degrade,
        } => {
            cmd_run(&flowchart, routes, timeout, snapshot.as_deref(), degrade).await?;
        }
        Commands::Validate { flowchart } => {
            cmd_validate(&flowchart)?;
        }
        Commands::Info { flowchart } => {
            cmd_info(&flowchart)?;
        }
        Commands::Recover {
            snapshot,
            routes,
            timeout,
        } => {
            cmd_recover(&snapshot, routes, timeout).await?;
        }
    }

    Ok(())
}

fn load_flowchart(path: &Path) -> anyhow::Result<FlowchartFile> {
    let source = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&source)?)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let file = load_flowchart(path)?;
    let diagnostics = validate(&file.nodes, &file.edges);

    if diagnostics.is_empty() {
        println!("Flowchart is valid");
        return Ok(());
    }
    for diag in &diagnostics {
        println!("{diag}");
    }
    std::process::exit(1);
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let file = load_flowchart(path)?;

    println!("Flowchart: {}", file.name);
    println!("Nodes: {}", file.nodes.len());
    println!("Edges: {}", file.edges.len());
    let budgets = &file.budgets;
    let limit = |v: Option<u64>| v.map_or("unlimited".to_string(), |v| v.to_string());
    println!(
        "Budgets: executions={} runtime_minutes={} parallel={}",
        limit(budgets.max_node_executions),
        limit(budgets.max_runtime_minutes),
        limit(budgets.max_parallel_nodes.map(u64::from)),
    );

    println!("\nNodes:");
    for (i, node) in file.nodes.iter().enumerate() {
        let title = node.title.as_deref().unwrap_or("");
        let reference = node.ref_id.map(|r| format!(" ref={r}")).unwrap_or_default();
        println!("  {} [{}] {}{}", node.label(i), node.node_type, title, reference);
    }

    println!("\nEdges:");
    for edge in &file.edges {
        let key = edge
            .condition_key
            .as_deref()
            .map(|k| format!(" ({k})"))
            .unwrap_or_default();
        println!("  {} -> {} [{}]{}", edge.source, edge.target, edge.edge_mode, key);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Dry-run execution
// ---------------------------------------------------------------------------

/// Completes every node immediately. Decision nodes return the route key
/// given for them on the command line, or none at all.
struct DryRunExecutor {
    routes: HashMap<String, String>,
}

impl DryRunExecutor {
    fn new(routes: Vec<(String, String)>) -> Self {
        Self {
            routes: routes.into_iter().collect(),
        }
    }

    fn route_for(&self, request: &ExecutionRequest) -> Option<&String> {
        let node = &request.node;
        node.title
            .as_ref()
            .and_then(|t| self.routes.get(t))
            .or_else(|| self.routes.get(&node.id.to_string()))
    }
}

#[async_trait]
impl NodeExecutor for DryRunExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<NodeOutcome, ExecutorError> {
        let node = &request.node;
        tracing::debug!(node_id = node.id, node_type = %node.node_type, "Dry-run execution");
        let output = serde_json::json!({
            "dry_run": true,
            "node_type": node.node_type.as_str(),
            "prompt": node.config.task_prompt(),
            "pulled": request.input_context.pulled_dotted_sources.len(),
        });

        if node.node_type == NodeType::Decision {
            let mut outcome = NodeOutcome::output(output);
            outcome.routing_state.route_key = self.route_for(request).cloned();
            return Ok(outcome);
        }
        Ok(NodeOutcome::output(output.clone()).with_artifact("dry_run", output))
    }
}

fn engine_config(degrade: bool) -> EngineConfig {
    let config = EngineConfig::from_env();
    if degrade {
        config.with_uncertain_dispatch(UncertainDispatchPolicy::Degrade)
    } else {
        config
    }
}

async fn cmd_run(
    path: &Path,
    routes: Vec<(String, String)>,
    timeout: u64,
    snapshot: Option<&Path>,
    degrade: bool,
) -> anyhow::Result<()> {
    let file = load_flowchart(path)?;
    let service = FlowchartService::builder(Arc::new(DryRunExecutor::new(routes)))
        .config(engine_config(degrade))
        .retention_sweeper(true)
        .build();

    println!("Running flowchart: {}", file.name);
    let flowchart = service.create_flowchart(&file.name, file.budgets)?;
    let report = service.replace_graph(flowchart.id, file.nodes, file.edges)?;
    if !report.is_valid() {
        for diag in report.validation.iter().flatten() {
            println!("{diag}");
        }
        anyhow::bail!("flowchart '{}' is not valid", file.name);
    }

    let run = service.start_run(flowchart.id).await?;
    let status = wait_and_report(&service, run.id, timeout).await?;

    if let Some(dir) = snapshot {
        let saved = service.save_snapshot(dir).await?;
        println!("Snapshot: {}", saved.display());
    }
    if status != RunStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_recover(dir: &Path, routes: Vec<(String, String)>, timeout: u64) -> anyhow::Result<()> {
    let service = FlowchartService::builder(Arc::new(DryRunExecutor::new(routes)))
        .config(engine_config(false))
        .restore_from(dir)
        .await?
        .build();

    let resumed = service.recover()?;
    println!("Recovered {resumed} run(s)");
    let active: Vec<RunId> = service
        .list_runs(None)?
        .into_iter()
        .filter(|r| !r.status.is_terminal())
        .map(|r| r.id)
        .collect();
    for run_id in active {
        wait_and_report(&service, run_id, timeout).await?;
    }
    service.save_snapshot(dir).await?;
    Ok(())
}

async fn wait_and_report(
    service: &FlowchartService,
    run_id: RunId,
    timeout: u64,
) -> anyhow::Result<RunStatus> {
    let run = service
        .wait_for_run(run_id, Duration::from_secs(timeout))
        .await?;
    let report = service.get_run(run_id, true)?;

    println!("\nRun {} {}", run.id, run.status);
    if let Some(error) = &run.error {
        println!("Error: {error}");
    }
    for node_run in report.node_runs.unwrap_or_default() {
        let mut flags = Vec::new();
        if node_run.degraded {
            flags.push("degraded");
        }
        if node_run.routing_state.fallback_applied {
            flags.push("fallback");
        }
        let route = node_run
            .routing_state
            .route_key
            .as_deref()
            .map(|k| format!(" route={k}"))
            .unwrap_or_default();
        println!(
            "  #{} node {} {}{}{}",
            node_run.execution_index,
            node_run.flowchart_node_id,
            node_run.status,
            route,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            }
        );
    }
    Ok(run.status)
}
