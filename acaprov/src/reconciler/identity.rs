//! Identity reconciler - assigns a system identity to an application and
//! waits for its principal to propagate.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{Healed, Reconcile, RunContext};
use crate::client::ControlPlane;
use crate::error::ReconcileError;
use crate::resource::{FlatPatch, Postcondition, ResourceKind, ResourceRef, ResourceState};
use crate::wait::{Backoff, poll_until};

pub const IDENTITY_TYPE: &str = "identity.type";
pub const PRINCIPAL_ID: &str = "identity.principalId";
pub const SYSTEM_ASSIGNED: &str = "SystemAssigned";

#[derive(Debug, Clone)]
pub struct SystemIdentity {
    app: ResourceRef,
    backoff: Backoff,
}

impl SystemIdentity {
    pub fn new(app: ResourceRef, backoff: Backoff) -> Self {
        Self { app, backoff }
    }
}

#[async_trait]
impl Reconcile for SystemIdentity {
    fn kind(&self) -> ResourceKind {
        self.app.kind
    }

    fn target(&self, _ctx: &RunContext) -> Result<ResourceRef, ReconcileError> {
        Ok(self.app.clone())
    }

    fn postcondition(&self) -> Postcondition {
        Postcondition::All(vec![
            Postcondition::equals(IDENTITY_TYPE, SYSTEM_ASSIGNED),
            Postcondition::present(PRINCIPAL_ID),
        ])
    }

    async fn create(
        &self,
        _client: &dyn ControlPlane,
        _ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError> {
        Err(ReconcileError::DependencyUnready(format!(
            "{} must exist before an identity can be assigned",
            self.app
        )))
    }

    /// Assign the identity if needed, then poll until the principal shows up.
    async fn heal(
        &self,
        client: &dyn ControlPlane,
        _ctx: &RunContext,
        current: &ResourceState,
    ) -> Result<Healed, ReconcileError> {
        if current.property_str(IDENTITY_TYPE) != Some(SYSTEM_ASSIGNED) {
            info!(app = %self.app, "Assigning system identity");
            let patch = FlatPatch::from([(IDENTITY_TYPE.to_string(), json!(SYSTEM_ASSIGNED))]);
            let state = client.update(&self.app, &patch).await?;
            if self.postcondition().holds(&state) {
                return Ok(Healed::Updated(state));
            }
        }

        let app = &self.app;
        let postcondition = self.postcondition();
        let condition = &postcondition;
        let what = format!("identity principal of {}", app);
        let state = poll_until(&what, self.backoff, move || async move {
            let state = client.get(app).await?;
            Ok::<_, ReconcileError>(state.filter(|s| condition.holds(s)))
        })
        .await?;
        Ok(Healed::Updated(state))
    }

    fn observe(&self, state: &ResourceState, ctx: &mut RunContext) -> Result<(), ReconcileError> {
        let principal = state.property_str(PRINCIPAL_ID).ok_or_else(|| {
            ReconcileError::DependencyUnready(format!("{} has no identity principal", self.app))
        })?;
        info!(app = %self.app, principal, "Identity principal available");
        ctx.publish_principal(&self.app, principal);
        Ok(())
    }
}
