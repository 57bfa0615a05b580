//! acaprov: provision a private Container App deployment.
//!
//! Subcommands:
//! - `validate` checks the config and the resource graph
//! - `order` prints the reconciliation order
//! - `simulate` reconciles the graph against the in-memory control plane

use std::path::PathBuf;

use acaprov::config::DeployConfig;
use acaprov::reconciler::RunContext;
use acaprov::simulator::SimulatedControlPlane;
use acaprov::topology::build_graph;
use acaprov::{Postcondition, Reconciler, Reporter, ResourceGraph, Session, TableReporter};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Idempotent provisioner for a Container App with private storage
#[derive(Parser, Debug)]
#[command(name = "acaprov", version, about)]
struct Cli {
    /// Deployment config file
    #[arg(short, long, env = "ACAPROV_CONFIG", default_value = "acaprov.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the config and the resource graph
    Validate,

    /// Print nodes in reconciliation order
    Order,

    /// Reconcile against a simulated control plane
    Simulate {
        /// Number of consecutive runs
        #[arg(long, default_value = "2")]
        runs: u32,

        /// Degrade the target of this node after the first run
        #[arg(long)]
        degrade: Option<String>,
    },
}

#[derive(Tabled)]
struct OrderRow {
    #[tabled(rename = "#")]
    step: usize,
    #[tabled(rename = "NODE")]
    id: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "DEPENDS ON")]
    depends_on: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acaprov=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = DeployConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let graph = build_graph(&config).context("building resource graph")?;

    match cli.command {
        Command::Validate => {
            graph.topological_order()?;
            println!(
                "{}: {} nodes, deployment '{}' in {}",
                cli.config.display(),
                graph.len(),
                config.names.app,
                config.location
            );
        }
        Command::Order => print_order(&graph)?,
        Command::Simulate { runs, degrade } => simulate(&graph, runs, degrade.as_deref()).await?,
    }

    Ok(())
}

fn print_order(graph: &ResourceGraph) -> Result<()> {
    let rows: Vec<OrderRow> = graph
        .topological_order()?
        .into_iter()
        .enumerate()
        .map(|(i, node)| OrderRow {
            step: i + 1,
            id: node.id().to_string(),
            kind: node.reconciler().kind().to_string(),
            depends_on: node.dependencies().join(", "),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

async fn simulate(graph: &ResourceGraph, runs: u32, degrade: Option<&str>) -> Result<()> {
    let cp = SimulatedControlPlane::new();

    let principal = cp.whoami().await.context("control plane login check")?;
    info!(principal = %principal.name, subscription = %principal.subscription, "Authenticated");

    let reconciler = Reconciler::new();
    let reporter = TableReporter;

    for run in 1..=runs {
        if run > 1
            && let Some(id) = degrade
        {
            degrade_node(graph, &cp, id)?;
        }

        println!("Run {}/{}", run, runs);
        let result = reconciler.run(graph, &cp).await?;
        println!("{}", reporter.render(&result));

        if !result.is_success() {
            bail!("run {} failed", run);
        }
    }

    let calls = cp.calls();
    let journal_ms = match (calls.first(), calls.last()) {
        (Some(first), Some(last)) => (last.at - first.at).num_milliseconds(),
        _ => 0,
    };
    info!(
        resources = cp.resource_count(),
        calls = calls.len(),
        journal_ms,
        "Simulation finished"
    );
    Ok(())
}

/// Break the state a node checks, so the next run has to heal it.
fn degrade_node(graph: &ResourceGraph, cp: &SimulatedControlPlane, id: &str) -> Result<()> {
    let node = graph
        .get(id)
        .with_context(|| format!("unknown node '{}'", id))?;
    let reconciler = node.reconciler();
    let target = reconciler
        .target(&RunContext::new())
        .with_context(|| format!("node '{}' has no fixed target", id))?;

    match degradation(&reconciler.postcondition()) {
        Some((path, value)) => {
            if !cp.degrade(&target, &path, value) {
                bail!("{} does not exist", target);
            }
            warn!(node = id, resource = %target, path = %path, "Degraded");
        }
        None => {
            if !cp.remove(&target) {
                bail!("{} does not exist", target);
            }
            warn!(node = id, resource = %target, "Removed");
        }
    }
    Ok(())
}

/// Property to overwrite, and with what, to violate `postcondition`.
fn degradation(postcondition: &Postcondition) -> Option<(String, Value)> {
    match postcondition {
        Postcondition::Exists => None,
        Postcondition::Equals { path, .. } | Postcondition::Present { path } => {
            Some((path.clone(), Value::Null))
        }
        Postcondition::Includes { document } => {
            first_array(document, String::new()).map(|path| (path, Value::Array(Vec::new())))
        }
        Postcondition::All(clauses) => clauses.iter().find_map(degradation),
    }
}

/// Dotted path of the first array inside a document.
fn first_array(value: &Value, prefix: String) -> Option<String> {
    let obj = value.as_object()?;
    obj.iter().find_map(|(key, child)| {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        if child.is_array() {
            Some(path)
        } else {
            first_array(child, path)
        }
    })
}
