//! Per-node outcomes, aggregate counts and summary rendering.

use std::fmt;

use serde::Serialize;
use tabled::{Table, Tabled};

use crate::error::ReconcileError;

/// What the reconciler did with one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Created,
    /// Existing resource patched in place.
    Updated,
    /// Degraded resource deleted and created again.
    Recreated { reason: String },
    /// Already satisfied.
    Skipped,
    Failed { cause: String },
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Created => f.write_str("created"),
            NodeOutcome::Updated => f.write_str("updated"),
            NodeOutcome::Recreated { .. } => f.write_str("recreated"),
            NodeOutcome::Skipped => f.write_str("skipped"),
            NodeOutcome::Failed { .. } => f.write_str("failed"),
        }
    }
}

/// Aggregate counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub created: usize,
    pub updated: usize,
    pub recreated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunCounts {
    /// Nodes whose resource was changed by this run.
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.recreated
    }
}

/// The node that aborted a run.
#[derive(Debug)]
pub struct FailedNode {
    pub id: String,
    /// Position in topological order, zero-based.
    pub position: usize,
    pub cause: ReconcileError,
}

/// Outcome of one reconciliation run.
#[derive(Debug)]
pub struct RunResult {
    total: usize,
    outcomes: Vec<(String, NodeOutcome)>,
    counts: RunCounts,
    failure: Option<FailedNode>,
}

impl RunResult {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            outcomes: Vec::with_capacity(total),
            counts: RunCounts::default(),
            failure: None,
        }
    }

    pub fn record(&mut self, id: &str, outcome: NodeOutcome) {
        match &outcome {
            NodeOutcome::Created => self.counts.created += 1,
            NodeOutcome::Updated => self.counts.updated += 1,
            NodeOutcome::Recreated { .. } => self.counts.recreated += 1,
            NodeOutcome::Skipped => self.counts.skipped += 1,
            NodeOutcome::Failed { .. } => self.counts.failed += 1,
        }
        self.outcomes.push((id.to_string(), outcome));
    }

    pub fn fail(&mut self, id: &str, position: usize, cause: ReconcileError) {
        self.record(
            id,
            NodeOutcome::Failed {
                cause: cause.to_string(),
            },
        );
        self.failure = Some(FailedNode {
            id: id.to_string(),
            position,
            cause,
        });
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn counts(&self) -> RunCounts {
        self.counts
    }

    pub fn failure(&self) -> Option<&FailedNode> {
        self.failure.as_ref()
    }

    /// Number of nodes in the graph, visited or not.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Outcomes in visit order.
    pub fn outcomes(&self) -> &[(String, NodeOutcome)] {
        &self.outcomes
    }

    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes
            .iter()
            .find(|(node, _)| node == id)
            .map(|(_, outcome)| outcome)
    }
}

/// Renders a finished run for humans.
pub trait Reporter {
    fn render(&self, result: &RunResult) -> String;
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "#")]
    step: usize,
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "OUTCOME")]
    outcome: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

/// Table of per-node outcomes followed by the aggregate counts.
#[derive(Debug, Default)]
pub struct TableReporter;

impl Reporter for TableReporter {
    fn render(&self, result: &RunResult) -> String {
        let rows: Vec<OutcomeRow> = result
            .outcomes()
            .iter()
            .enumerate()
            .map(|(i, (node, outcome))| OutcomeRow {
                step: i + 1,
                node: node.clone(),
                outcome: outcome.to_string(),
                detail: match outcome {
                    NodeOutcome::Recreated { reason } => reason.clone(),
                    NodeOutcome::Failed { cause } => cause.clone(),
                    _ => String::new(),
                },
            })
            .collect();

        let counts = result.counts();
        let mut out = Table::new(rows).to_string();
        out.push_str(&format!(
            "\ncreated={} updated={} recreated={} skipped={} failed={} ({} of {} nodes visited)\n",
            counts.created,
            counts.updated,
            counts.recreated,
            counts.skipped,
            counts.failed,
            result.outcomes().len(),
            result.total(),
        ));

        if let Some(failure) = result.failure() {
            out.push_str(&format!(
                "Run aborted at '{}' (step {}): {}\n",
                failure.id,
                failure.position + 1,
                failure.cause
            ));
            if failure.cause.is_auth() {
                out.push_str("Log in again or grant the missing permission, then re-run.\n");
            } else {
                out.push_str("Resources created so far are kept; fix the cause and re-run.\n");
            }
        }

        out
    }
}
