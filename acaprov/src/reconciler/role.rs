//! Role reconciler - grants a role to an identity principal published by an
//! earlier node.

use async_trait::async_trait;
use tracing::info;

use super::{Reconcile, RunContext};
use crate::client::ControlPlane;
use crate::error::ReconcileError;
use crate::resource::{ResourceKind, ResourceRef, ResourceState};

pub const ACR_PULL: &str = "AcrPull";
pub const STORAGE_FILE_SMB_CONTRIBUTOR: &str = "Storage File Data SMB Share Contributor";

#[derive(Debug, Clone)]
pub struct RoleGrant {
    /// Resource whose identity receives the role.
    assignee: ResourceRef,
    role: String,
    scope: ResourceRef,
}

impl RoleGrant {
    pub fn new(assignee: ResourceRef, role: impl Into<String>, scope: ResourceRef) -> Self {
        Self {
            assignee,
            role: role.into(),
            scope,
        }
    }

    fn principal<'a>(&self, ctx: &'a RunContext) -> Result<&'a str, ReconcileError> {
        ctx.principal(&self.assignee).ok_or_else(|| {
            ReconcileError::DependencyUnready(format!(
                "no identity principal published for {}",
                self.assignee
            ))
        })
    }
}

#[async_trait]
impl Reconcile for RoleGrant {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RoleAssignment
    }

    fn target(&self, ctx: &RunContext) -> Result<ResourceRef, ReconcileError> {
        let principal = self.principal(ctx)?;
        Ok(ResourceRef::role_assignment(principal, &self.role, &self.scope.id()))
    }

    async fn create(
        &self,
        client: &dyn ControlPlane,
        ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError> {
        let principal = self.principal(ctx)?;
        let scope = self.scope.id();
        info!(principal, role = %self.role, scope = %scope, "Granting role");
        client.assign_role(principal, &self.role, &scope).await?;

        let reference = ResourceRef::role_assignment(principal, &self.role, &scope);
        client
            .get(&reference)
            .await?
            .ok_or_else(|| ReconcileError::PostconditionUnmet {
                reference: reference.to_string(),
                expected: "exists".to_string(),
            })
    }
}
