//! Reconcilers for the resource graph.
//!
//! Each node carries a [`Reconcile`] implementation that knows how to probe,
//! create and heal one resource. [`Reconciler`] walks the graph in
//! dependency order and drives those implementations against the control
//! plane.

pub mod ensure;
pub mod identity;
pub mod patch;
pub mod provider;
pub mod role;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::client::{ControlPlane, ControlPlaneError};
use crate::error::{GraphError, ReconcileError};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::outcome::{NodeOutcome, RunResult};
use crate::resource::{Postcondition, ResourceKind, ResourceRef, ResourceState};

/// Outputs published by converged nodes during one run.
///
/// Built fresh per run; the control plane stays the source of truth.
#[derive(Debug, Default)]
pub struct RunContext {
    principals: HashMap<ResourceRef, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the identity principal of `resource`.
    pub fn publish_principal(&mut self, resource: &ResourceRef, principal: impl Into<String>) {
        self.principals.insert(resource.clone(), principal.into());
    }

    pub fn principal(&self, resource: &ResourceRef) -> Option<&str> {
        self.principals.get(resource).map(String::as_str)
    }
}

/// Result of healing a degraded resource.
#[derive(Debug)]
pub enum Healed {
    /// Patched in place.
    Updated(ResourceState),
    /// Deleted and created again.
    Recreated(ResourceState),
}

/// Per-node reconciliation contract.
#[async_trait]
pub trait Reconcile: Send + Sync + fmt::Debug {
    /// Kind of the probed resource.
    fn kind(&self) -> ResourceKind;

    /// Resource whose observed state decides the action.
    fn target(&self, ctx: &RunContext) -> Result<ResourceRef, ReconcileError>;

    /// Predicate an existing resource must satisfy to be left alone.
    fn postcondition(&self) -> Postcondition {
        Postcondition::Exists
    }

    /// Bring an absent target into existence.
    async fn create(
        &self,
        client: &dyn ControlPlane,
        ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError>;

    /// Repair a target that exists but fails its postcondition.
    ///
    /// Defaults to deleting and recreating this single resource.
    async fn heal(
        &self,
        client: &dyn ControlPlane,
        ctx: &RunContext,
        current: &ResourceState,
    ) -> Result<Healed, ReconcileError> {
        client.delete(&current.reference).await?;
        let state = self.create(client, ctx).await?;
        Ok(Healed::Recreated(state))
    }

    /// Publish outputs once the target is converged.
    fn observe(&self, _state: &ResourceState, _ctx: &mut RunContext) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Walks a resource graph and converges every node, fail-fast.
#[derive(Debug, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// Reconcile every node of `graph` in topological order.
    ///
    /// Nodes are visited one at a time. The first failure stops the run;
    /// nodes already converged are left in place and the result carries
    /// the counts accumulated so far.
    pub async fn run(
        &self,
        graph: &ResourceGraph,
        client: &dyn ControlPlane,
    ) -> Result<RunResult, GraphError> {
        let order = graph.topological_order()?;
        let total = order.len();
        let mut ctx = RunContext::new();
        let mut result = RunResult::new(total);

        info!(nodes = total, "Starting reconciliation");

        for (position, node) in order.into_iter().enumerate() {
            let span = info_span!(
                "node",
                id = node.id(),
                kind = %node.reconciler().kind(),
                step = position + 1,
                of = total
            );

            match self.visit(node, client, &mut ctx).instrument(span).await {
                Ok(outcome) => {
                    info!(node = node.id(), outcome = %outcome, "Reconciled");
                    result.record(node.id(), outcome);
                }
                Err(cause) => {
                    error!(node = node.id(), position, error = %cause, "Reconciliation failed, aborting run");
                    result.fail(node.id(), position, cause);
                    break;
                }
            }
        }

        let counts = result.counts();
        info!(
            created = counts.created,
            updated = counts.updated,
            recreated = counts.recreated,
            skipped = counts.skipped,
            failed = counts.failed,
            "Reconciliation finished"
        );

        Ok(result)
    }

    async fn visit(
        &self,
        node: &ResourceNode,
        client: &dyn ControlPlane,
        ctx: &mut RunContext,
    ) -> Result<NodeOutcome, ReconcileError> {
        let reconciler = node.reconciler();
        let target = reconciler.target(ctx)?;
        let postcondition = reconciler.postcondition();

        let (outcome, state) = match client.get(&target).await? {
            None => {
                info!(resource = %target, "Absent, creating");
                match reconciler.create(client, ctx).await {
                    Ok(state) => (NodeOutcome::Created, state),
                    Err(ReconcileError::ControlPlane(ControlPlaneError::Conflict(message))) => {
                        self.resolve_conflict(reconciler, client, ctx, &target, &postcondition, message)
                            .await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(current) if !postcondition.holds(&current) => {
                self.heal(reconciler, client, ctx, &current, &postcondition)
                    .await?
            }
            Some(current) => {
                debug!(resource = %target, "Already satisfied");
                (NodeOutcome::Skipped, current)
            }
        };

        if !postcondition.holds(&state) {
            return Err(ReconcileError::PostconditionUnmet {
                reference: target.to_string(),
                expected: postcondition.to_string(),
            });
        }

        reconciler.observe(&state, ctx)?;
        Ok(outcome)
    }

    async fn heal(
        &self,
        reconciler: &dyn Reconcile,
        client: &dyn ControlPlane,
        ctx: &RunContext,
        current: &ResourceState,
        postcondition: &Postcondition,
    ) -> Result<(NodeOutcome, ResourceState), ReconcileError> {
        let reason = postcondition
            .first_violation(current)
            .map(|clause| format!("{} not satisfied", clause))
            .unwrap_or_else(|| "postcondition not satisfied".to_string());
        warn!(resource = %current.reference, reason = %reason, "Resource degraded, healing");

        match reconciler.heal(client, ctx, current).await? {
            Healed::Updated(state) => Ok((NodeOutcome::Updated, state)),
            Healed::Recreated(state) => Ok((NodeOutcome::Recreated { reason }, state)),
        }
    }

    /// A create raced with someone else: look again before giving up.
    async fn resolve_conflict(
        &self,
        reconciler: &dyn Reconcile,
        client: &dyn ControlPlane,
        ctx: &RunContext,
        target: &ResourceRef,
        postcondition: &Postcondition,
        message: String,
    ) -> Result<(NodeOutcome, ResourceState), ReconcileError> {
        warn!(resource = %target, conflict = %message, "Create conflicted, probing again");

        match client.get(target).await? {
            Some(current) if postcondition.holds(&current) => Ok((NodeOutcome::Skipped, current)),
            Some(current) if !postcondition.is_trivial() => {
                self.heal(reconciler, client, ctx, &current, postcondition)
                    .await
            }
            _ => Err(ControlPlaneError::Conflict(message).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceNode;
    use crate::reconciler::ensure::EnsureResource;
    use crate::resource::ResourceSpec;
    use crate::simulator::{Call, Fault, Operation, SimulatedControlPlane};

    fn group() -> ResourceRef {
        ResourceRef::new(ResourceKind::ResourceGroup, "rg-demo")
    }

    fn subnet_spec(delegation: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceRef::child(ResourceKind::Subnet, "snet-aca", &group()))
            .with("addressPrefix", "10.10.0.0/23")
            .with("delegation", delegation)
    }

    fn graph() -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph
            .add_node(ResourceNode::new(
                "resource-group",
                EnsureResource::new(ResourceSpec::new(group()).with("location", "westeurope")),
            ))
            .unwrap();
        graph
            .add_node(
                ResourceNode::new(
                    "ca-subnet",
                    EnsureResource::new(subnet_spec("Microsoft.App/environments")).with_postcondition(
                        Postcondition::equals("delegation", "Microsoft.App/environments"),
                    ),
                )
                .depends_on(["resource-group"]),
            )
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn test_run_creates_then_skips() {
        let cp = SimulatedControlPlane::new();
        let reconciler = Reconciler::new();

        let first = reconciler.run(&graph(), &cp).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.counts().created, 2);

        let second = reconciler.run(&graph(), &cp).await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.counts().created, 0);
        assert_eq!(second.counts().skipped, 2);
    }

    #[tokio::test]
    async fn test_conflict_on_create_with_satisfied_state_is_skipped() {
        let cp = SimulatedControlPlane::new();
        let subnet = subnet_spec("Microsoft.App/environments");
        // Someone else creates the subnet between probe and create.
        cp.inject(
            Fault::new(Operation::Create, subnet.reference.clone())
                .conflicting_with(ResourceState::from(subnet.clone())),
        );

        let result = Reconciler::new().run(&graph(), &cp).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.outcome("ca-subnet"), Some(&NodeOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_conflict_on_create_with_degraded_state_is_healed() {
        let cp = SimulatedControlPlane::new();
        let wrong = subnet_spec("Microsoft.Web/serverFarms");
        cp.inject(
            Fault::new(Operation::Create, wrong.reference.clone())
                .conflicting_with(ResourceState::from(wrong.clone())),
        );

        let result = Reconciler::new().run(&graph(), &cp).await.unwrap();
        assert!(result.is_success());
        assert!(matches!(
            result.outcome("ca-subnet"),
            Some(NodeOutcome::Recreated { .. })
        ));
        assert_eq!(cp.calls_for(&wrong.reference, Operation::Delete).len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_without_postcondition_is_fatal() {
        let cp = SimulatedControlPlane::new();
        // Conflict reported, but nothing visible on the second probe.
        cp.inject(
            Fault::new(Operation::Create, group())
                .fails_with(ControlPlaneError::Conflict("concurrent create".to_string())),
        );

        let result = Reconciler::new().run(&graph(), &cp).await.unwrap();
        assert!(!result.is_success());
        let failure = result.failure().unwrap();
        assert_eq!(failure.id, "resource-group");
        assert!(matches!(
            failure.cause,
            ReconcileError::ControlPlane(ControlPlaneError::Conflict(_))
        ));
        assert!(cp
            .calls()
            .iter()
            .all(|c: &Call| c.reference.kind == ResourceKind::ResourceGroup));
    }
}
