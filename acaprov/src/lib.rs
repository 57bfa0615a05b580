//! acaprov - idempotent provisioning of a private Container App deployment.
//!
//! A deployment is declared as a [`graph::ResourceGraph`] of nodes, each
//! carrying its own reconciliation logic. [`reconciler::Reconciler`] walks
//! the graph in dependency order against a [`client::ControlPlane`],
//! creating what is missing, healing what is degraded and skipping what
//! already converged.

pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod graph;
pub mod outcome;
pub mod reconciler;
pub mod resource;
pub mod simulator;
pub mod topology;
pub mod wait;

pub use client::{ControlPlane, ControlPlaneError, Principal, Session};
pub use config::DeployConfig;
pub use error::{GraphError, ReconcileError};
pub use graph::{ResourceGraph, ResourceNode};
pub use outcome::{NodeOutcome, Reporter, RunCounts, RunResult, TableReporter};
pub use reconciler::{Reconcile, Reconciler};
pub use resource::{Postcondition, ResourceKind, ResourceRef, ResourceSpec, ResourceState};
