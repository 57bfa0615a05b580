//! Error types for graph construction and reconciliation.

use std::time::Duration;

use thiserror::Error;

use crate::client::ControlPlaneError;

/// Errors raised while building or ordering the resource graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Errors that abort a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// Something this node needs was not produced by an earlier node.
    #[error("dependency not ready: {0}")]
    DependencyUnready(String),

    /// A polled dependency did not become ready before the deadline.
    #[error("timed out after {waited:?} waiting for {what}")]
    DependencyTimeout { what: String, waited: Duration },

    /// The state after create/heal still fails the node's postcondition.
    #[error("{reference} does not satisfy '{expected}' after reconciliation")]
    PostconditionUnmet { reference: String, expected: String },
}

impl ReconcileError {
    /// Whether the operator should log in again or fix permissions.
    pub fn is_auth(&self) -> bool {
        matches!(self, ReconcileError::ControlPlane(ControlPlaneError::Auth(_)))
    }
}
