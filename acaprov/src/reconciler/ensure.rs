//! Ensure reconciler - creates a resource when missing, recreates it when degraded.

use async_trait::async_trait;
use tracing::info;

use super::{Reconcile, RunContext};
use crate::client::ControlPlane;
use crate::error::ReconcileError;
use crate::resource::{Postcondition, ResourceKind, ResourceRef, ResourceSpec, ResourceState};

/// Declarative create-if-missing node.
#[derive(Debug, Clone)]
pub struct EnsureResource {
    spec: ResourceSpec,
    postcondition: Postcondition,
}

impl EnsureResource {
    pub fn new(spec: ResourceSpec) -> Self {
        Self {
            spec,
            postcondition: Postcondition::Exists,
        }
    }

    /// Require more than existence; a resource failing it is recreated.
    pub fn with_postcondition(mut self, postcondition: Postcondition) -> Self {
        self.postcondition = postcondition;
        self
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }
}

#[async_trait]
impl Reconcile for EnsureResource {
    fn kind(&self) -> ResourceKind {
        self.spec.reference.kind
    }

    fn target(&self, _ctx: &RunContext) -> Result<ResourceRef, ReconcileError> {
        Ok(self.spec.reference.clone())
    }

    fn postcondition(&self) -> Postcondition {
        self.postcondition.clone()
    }

    async fn create(
        &self,
        client: &dyn ControlPlane,
        _ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError> {
        let state = client.create(&self.spec).await?;
        info!(resource = %self.spec.reference, "Created");
        Ok(state)
    }
}
