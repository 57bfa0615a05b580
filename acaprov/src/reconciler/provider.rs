//! Provider reconciler - registers a resource provider namespace and waits
//! until the registration has completed.

use async_trait::async_trait;
use tracing::info;

use super::{Healed, Reconcile, RunContext};
use crate::client::ControlPlane;
use crate::error::ReconcileError;
use crate::resource::{Postcondition, ResourceKind, ResourceRef, ResourceSpec, ResourceState};
use crate::wait::{Backoff, poll_until};

pub const REGISTERED: &str = "Registered";

#[derive(Debug, Clone)]
pub struct ProviderRegistration {
    reference: ResourceRef,
    backoff: Backoff,
}

impl ProviderRegistration {
    pub fn new(namespace: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            reference: ResourceRef::new(ResourceKind::Provider, namespace),
            backoff,
        }
    }

    /// Request registration (idempotent) and block until it is reported done.
    async fn register(&self, client: &dyn ControlPlane) -> Result<ResourceState, ReconcileError> {
        let requested = client.create(&ResourceSpec::new(self.reference.clone())).await?;
        if requested.property_str("registrationState") == Some(REGISTERED) {
            return Ok(requested);
        }

        info!(provider = %self.reference.name, "Waiting for provider registration");
        let reference = &self.reference;
        let what = format!("registration of {}", reference.name);
        poll_until(&what, self.backoff, move || async move {
            let state = client.get(reference).await?;
            Ok::<_, ReconcileError>(
                state.filter(|s| s.property_str("registrationState") == Some(REGISTERED)),
            )
        })
        .await
    }
}

#[async_trait]
impl Reconcile for ProviderRegistration {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Provider
    }

    fn target(&self, _ctx: &RunContext) -> Result<ResourceRef, ReconcileError> {
        Ok(self.reference.clone())
    }

    fn postcondition(&self) -> Postcondition {
        Postcondition::equals("registrationState", REGISTERED)
    }

    async fn create(
        &self,
        client: &dyn ControlPlane,
        _ctx: &RunContext,
    ) -> Result<ResourceState, ReconcileError> {
        self.register(client).await
    }

    /// Unregistered or still registering: register again instead of deleting.
    async fn heal(
        &self,
        client: &dyn ControlPlane,
        _ctx: &RunContext,
        _current: &ResourceState,
    ) -> Result<Healed, ReconcileError> {
        self.register(client).await.map(Healed::Updated)
    }
}
