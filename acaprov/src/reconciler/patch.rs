//! Patch reconcilers - converge properties of a resource created by an
//! earlier node, either by flat field updates or by merging a document.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{Healed, Reconcile, RunContext};
use crate::client::ControlPlane;
use crate::error::ReconcileError;
use crate::resource::{FlatPatch, Postcondition, ResourceKind, ResourceRef, ResourceState};

fn missing_target(target: &ResourceRef) -> ReconcileError {
    ReconcileError::DependencyUnready(format!("{} must exist before it can be patched", target))
}

/// Sets scalar properties when they differ from the desired values.
#[derive(Debug, Clone)]
pub struct FieldPatch {
    target: ResourceRef,
    patch: FlatPatch,
}

impl FieldPatch {
    pub fn new(target: ResourceRef) -> Self {
        Self {
            target,
            patch: FlatPatch::new(),
        }
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.patch.insert(path.into(), value.into());
        self
    }
}

#[async_trait]
impl Reconcile for FieldPatch {
    fn kind(&self) -> ResourceKind {
        self.target.kind
    }

    fn target(&self, _ctx: &RunContext) -> Result<ResourceRef, ReconcileError> {
        Ok(self.target.clone())
    }

    fn postcondition(&self) -> Postcondition {
        Postcondition::All(
            self.patch
                .iter()
                .map(|(path, value)| Postcondition::equals(path.clone(), value.clone()))
                .collect(),
        )
    }

    async fn create(
        &self,
        _client: &dyn ControlPlane,
        _ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError> {
        Err(missing_target(&self.target))
    }

    async fn heal(
        &self,
        client: &dyn ControlPlane,
        _ctx: &RunContext,
        _current: &ResourceState,
    ) -> Result<Healed, ReconcileError> {
        let fields: Vec<&str> = self.patch.keys().map(String::as_str).collect();
        info!(resource = %self.target, fields = ?fields, "Updating fields");
        let state = client.update(&self.target, &self.patch).await?;
        Ok(Healed::Updated(state))
    }
}

/// Merges a nested document fragment (volumes, mounts) into a resource.
#[derive(Debug, Clone)]
pub struct DocumentPatch {
    target: ResourceRef,
    fragment: Value,
}

impl DocumentPatch {
    pub fn new(target: ResourceRef, fragment: Value) -> Self {
        Self { target, fragment }
    }

    pub fn fragment(&self) -> &Value {
        &self.fragment
    }
}

#[async_trait]
impl Reconcile for DocumentPatch {
    fn kind(&self) -> ResourceKind {
        self.target.kind
    }

    fn target(&self, _ctx: &RunContext) -> Result<ResourceRef, ReconcileError> {
        Ok(self.target.clone())
    }

    fn postcondition(&self) -> Postcondition {
        Postcondition::Includes {
            document: self.fragment.clone(),
        }
    }

    async fn create(
        &self,
        _client: &dyn ControlPlane,
        _ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError> {
        Err(missing_target(&self.target))
    }

    async fn heal(
        &self,
        client: &dyn ControlPlane,
        _ctx: &RunContext,
        _current: &ResourceState,
    ) -> Result<Healed, ReconcileError> {
        info!(resource = %self.target, "Applying structured patch");
        let state = client
            .apply_structured_patch(&self.target, &self.fragment)
            .await?;
        Ok(Healed::Updated(state))
    }
}
