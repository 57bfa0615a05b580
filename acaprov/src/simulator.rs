//! In-memory control plane.
//!
//! Behaves like the cloud as far as the reconciler can observe: it keeps
//! resources keyed by reference, requires parents to exist, registers
//! providers and propagates identity principals asynchronously, and
//! records every call in a journal. Faults can be injected per operation
//! and reference. Backs the `simulate` command and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::client::{ControlPlane, ControlPlaneError, Principal, Result, Session};
use crate::document;
use crate::reconciler::identity::{IDENTITY_TYPE, PRINCIPAL_ID, SYSTEM_ASSIGNED};
use crate::reconciler::provider::REGISTERED;
use crate::resource::{
    FlatPatch, Properties, ResourceKind, ResourceRef, ResourceSpec, ResourceState,
};

/// Control-plane operations, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Create,
    Update,
    StructuredPatch,
    Delete,
    AssignRole,
}

/// One journal entry.
#[derive(Debug, Clone)]
pub struct Call {
    pub at: DateTime<Utc>,
    pub operation: Operation,
    pub reference: ResourceRef,
}

/// One-shot failure for the next matching call.
#[derive(Debug, Clone)]
pub struct Fault {
    operation: Operation,
    reference: ResourceRef,
    error: ControlPlaneError,
    /// Stored before the error is returned, to mimic a concurrent writer.
    conflicting: Option<ResourceState>,
}

impl Fault {
    pub fn new(operation: Operation, reference: ResourceRef) -> Self {
        Self {
            operation,
            reference,
            error: ControlPlaneError::Unavailable("injected failure".to_string()),
            conflicting: None,
        }
    }

    pub fn fails_with(mut self, error: ControlPlaneError) -> Self {
        self.error = error;
        self
    }

    /// Someone else creates `state` just before this call, which then conflicts.
    pub fn conflicting_with(mut self, state: ResourceState) -> Self {
        self.error = ControlPlaneError::Conflict(format!("{} was created concurrently", state.reference));
        self.conflicting = Some(state);
        self
    }
}

#[derive(Debug)]
struct Inner {
    resources: BTreeMap<ResourceRef, Properties>,
    journal: Vec<Call>,
    faults: Vec<Fault>,
    /// Remaining `get`s until a pending registration or principal shows up.
    pending: HashMap<ResourceRef, u32>,
}

/// Simulated cloud subscription.
#[derive(Debug)]
pub struct SimulatedControlPlane {
    inner: Mutex<Inner>,
    /// `get`s until a provider registration completes.
    provider_polls: u32,
    /// `get`s until an assigned identity gets a principal; `None` never.
    principal_polls: Option<u32>,
    principal: Option<Principal>,
}

impl Default for SimulatedControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedControlPlane {
    /// Empty subscription with a logged-in operator and instant propagation.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                resources: BTreeMap::new(),
                journal: Vec::new(),
                faults: Vec::new(),
                pending: HashMap::new(),
            }),
            provider_polls: 0,
            principal_polls: Some(0),
            principal: Some(Principal {
                name: "operator@example.com".to_string(),
                subscription: "00000000-0000-0000-0000-000000000000".to_string(),
            }),
        }
    }

    pub fn with_provider_polls(mut self, polls: u32) -> Self {
        self.provider_polls = polls;
        self
    }

    pub fn with_principal_polls(mut self, polls: Option<u32>) -> Self {
        self.principal_polls = polls;
        self
    }

    pub fn logged_out(mut self) -> Self {
        self.principal = None;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Store a resource directly, bypassing the journal.
    pub fn seed(&self, state: ResourceState) {
        self.lock().resources.insert(state.reference, state.properties);
    }

    /// Overwrite one property of an existing resource, bypassing the journal.
    ///
    /// Returns false when the resource is missing or the path cannot be written.
    pub fn degrade(&self, reference: &ResourceRef, path: &str, value: Value) -> bool {
        let mut inner = self.lock();
        inner
            .resources
            .get_mut(reference)
            .is_some_and(|properties| document::set_path(properties, path, value).is_ok())
    }

    /// Remove a resource, bypassing the journal.
    pub fn remove(&self, reference: &ResourceRef) -> bool {
        self.lock().resources.remove(reference).is_some()
    }

    /// Current state without journaling or propagation.
    pub fn state(&self, reference: &ResourceRef) -> Option<ResourceState> {
        self.lock()
            .resources
            .get(reference)
            .map(|p| ResourceState::new(reference.clone(), p.clone()))
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn calls_for(&self, reference: &ResourceRef, operation: Operation) -> Vec<Call> {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.operation == operation && &c.reference == reference)
            .cloned()
            .collect()
    }

    /// Calls that changed state (everything but `get`).
    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.operation != Operation::Get)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().journal.clear();
    }
}

impl Inner {
    /// Journal the call and fire a matching fault, if any.
    fn enter(&mut self, operation: Operation, reference: &ResourceRef) -> Result<()> {
        debug!(?operation, reference = %reference, "Simulated call");
        self.journal.push(Call {
            at: Utc::now(),
            operation,
            reference: reference.clone(),
        });

        let Some(pos) = self
            .faults
            .iter()
            .position(|f| f.operation == operation && &f.reference == reference)
        else {
            return Ok(());
        };
        let fault = self.faults.remove(pos);
        if let Some(state) = fault.conflicting {
            self.resources.insert(state.reference, state.properties);
        }
        Err(fault.error)
    }

    fn state(&self, reference: &ResourceRef) -> Option<ResourceState> {
        self.resources
            .get(reference)
            .map(|p| ResourceState::new(reference.clone(), p.clone()))
    }

    fn require(&self, reference: &ResourceRef) -> Result<()> {
        if self.resources.contains_key(reference) {
            Ok(())
        } else {
            Err(ControlPlaneError::NotFound(reference.to_string()))
        }
    }

    fn scope_exists(&self, scope: &str) -> bool {
        self.resources.keys().any(|r| r.id() == scope)
    }

    /// Advance asynchronous work on `reference` by one observation.
    fn propagate(&mut self, reference: &ResourceRef) {
        let Some(remaining) = self.pending.get_mut(reference) else {
            return;
        };
        if *remaining > 0 {
            *remaining -= 1;
            return;
        }
        self.pending.remove(reference);
        let Some(properties) = self.resources.get_mut(reference) else {
            return;
        };
        match reference.kind {
            ResourceKind::Provider => {
                properties.insert("registrationState".to_string(), json!(REGISTERED));
            }
            _ => {
                if let Err(e) =
                    document::set_path(properties, PRINCIPAL_ID, json!(Uuid::new_v4().to_string()))
                {
                    debug!(reference = %reference, error = %e, "Principal not propagated");
                }
            }
        }
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ResourceState>> {
        let mut inner = self.lock();
        inner.enter(Operation::Get, reference)?;
        inner.propagate(reference);
        Ok(inner.state(reference))
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceState> {
        let reference = &spec.reference;
        let mut inner = self.lock();
        inner.enter(Operation::Create, reference)?;

        if let Some(scope) = &reference.scope
            && !inner.scope_exists(scope)
        {
            return Err(ControlPlaneError::Validation(format!(
                "parent {} of {} does not exist",
                scope, reference
            )));
        }

        let exists = inner.resources.contains_key(reference);
        if exists && reference.kind != ResourceKind::Provider {
            return Err(ControlPlaneError::Conflict(format!("{} already exists", reference)));
        }

        let mut properties = spec.properties.clone();
        if reference.kind == ResourceKind::Provider {
            // Registration is idempotent and completes asynchronously.
            if self.provider_polls == 0 {
                properties.insert("registrationState".to_string(), json!(REGISTERED));
            } else {
                properties.insert("registrationState".to_string(), json!("Registering"));
                inner.pending.insert(reference.clone(), self.provider_polls - 1);
            }
        }
        inner.resources.insert(reference.clone(), properties.clone());
        Ok(ResourceState::new(reference.clone(), properties))
    }

    async fn update(&self, reference: &ResourceRef, patch: &FlatPatch) -> Result<ResourceState> {
        let mut inner = self.lock();
        inner.enter(Operation::Update, reference)?;
        inner.require(reference)?;

        let assigns_identity = patch.get(IDENTITY_TYPE) == Some(&json!(SYSTEM_ASSIGNED));
        let principal_polls = self.principal_polls;
        let mut schedule = false;
        if let Some(properties) = inner.resources.get_mut(reference) {
            // All fields or none.
            let mut patched = properties.clone();
            for (path, value) in patch {
                document::set_path(&mut patched, path, value.clone()).map_err(|e| {
                    ControlPlaneError::Validation(format!("{}: {}", reference, e))
                })?;
            }
            if assigns_identity && document::lookup(&patched, PRINCIPAL_ID).is_none() {
                match principal_polls {
                    Some(0) => document::set_path(
                        &mut patched,
                        PRINCIPAL_ID,
                        json!(Uuid::new_v4().to_string()),
                    )
                    .map_err(|e| ControlPlaneError::Validation(format!("{}: {}", reference, e)))?,
                    Some(_) => schedule = true,
                    None => {}
                }
            }
            *properties = patched;
        }
        if schedule
            && let Some(polls) = principal_polls
        {
            inner.pending.insert(reference.clone(), polls - 1);
        }

        inner
            .state(reference)
            .ok_or_else(|| ControlPlaneError::NotFound(reference.to_string()))
    }

    async fn apply_structured_patch(
        &self,
        reference: &ResourceRef,
        fragment: &Value,
    ) -> Result<ResourceState> {
        let mut inner = self.lock();
        inner.enter(Operation::StructuredPatch, reference)?;
        inner.require(reference)?;

        let Value::Object(fragment) = fragment else {
            return Err(ControlPlaneError::Validation(
                "structured patch must be a JSON object".to_string(),
            ));
        };
        if let Some(properties) = inner.resources.get_mut(reference) {
            document::merge_object(properties, fragment);
        }
        inner
            .state(reference)
            .ok_or_else(|| ControlPlaneError::NotFound(reference.to_string()))
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(Operation::Delete, reference)?;
        inner.require(reference)?;
        inner.resources.remove(reference);
        inner.pending.remove(reference);
        Ok(())
    }

    async fn assign_role(&self, principal: &str, role: &str, scope: &str) -> Result<()> {
        let reference = ResourceRef::role_assignment(principal, role, scope);
        let mut inner = self.lock();
        inner.enter(Operation::AssignRole, &reference)?;

        if !inner.scope_exists(scope) {
            return Err(ControlPlaneError::NotFound(format!("scope {}", scope)));
        }
        inner.resources.entry(reference).or_insert_with(|| {
            let mut properties = Properties::new();
            properties.insert("principalId".to_string(), json!(principal));
            properties.insert("roleDefinitionName".to_string(), json!(role));
            properties.insert("scope".to_string(), json!(scope));
            properties
        });
        Ok(())
    }
}

#[async_trait]
impl Session for SimulatedControlPlane {
    async fn whoami(&self) -> Result<Principal> {
        self.principal
            .clone()
            .ok_or_else(|| ControlPlaneError::Auth("not logged in".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> ResourceRef {
        ResourceRef::new(ResourceKind::ResourceGroup, "rg-demo")
    }

    fn app() -> ResourceRef {
        ResourceRef::child(ResourceKind::ContainerApp, "ca-demo", &group())
    }

    async fn with_app(cp: &SimulatedControlPlane) {
        cp.create(&ResourceSpec::new(group())).await.unwrap();
        cp.create(&ResourceSpec::new(app()).with("image", "nginx"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let cp = SimulatedControlPlane::new();
        let result = cp.create(&ResourceSpec::new(app())).await;
        assert!(matches!(result, Err(ControlPlaneError::Validation(_))));
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let cp = SimulatedControlPlane::new();
        cp.create(&ResourceSpec::new(group())).await.unwrap();
        let again = cp.create(&ResourceSpec::new(group())).await;
        assert!(matches!(again, Err(ControlPlaneError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_assign_role_is_idempotent() {
        let cp = SimulatedControlPlane::new();
        cp.create(&ResourceSpec::new(group())).await.unwrap();
        let scope = group().id();

        cp.assign_role("p-1", "AcrPull", &scope).await.unwrap();
        cp.assign_role("p-1", "AcrPull", &scope).await.unwrap();

        assert_eq!(cp.resource_count(), 2);
        let assignment = ResourceRef::role_assignment("p-1", "AcrPull", &scope);
        assert!(cp.state(&assignment).is_some());
    }

    #[tokio::test]
    async fn test_principal_propagates_after_polls() {
        let cp = SimulatedControlPlane::new().with_principal_polls(Some(2));
        with_app(&cp).await;

        let patch = FlatPatch::from([(IDENTITY_TYPE.to_string(), json!(SYSTEM_ASSIGNED))]);
        let state = cp.update(&app(), &patch).await.unwrap();
        assert!(state.property(PRINCIPAL_ID).is_none());

        let first = cp.get(&app()).await.unwrap().unwrap();
        assert!(first.property(PRINCIPAL_ID).is_none());
        let second = cp.get(&app()).await.unwrap().unwrap();
        assert!(second.property_str(PRINCIPAL_ID).is_some());
    }

    #[tokio::test]
    async fn test_provider_registration_completes_after_polls() {
        let cp = SimulatedControlPlane::new().with_provider_polls(2);
        let provider = ResourceRef::new(ResourceKind::Provider, "Microsoft.App");

        let state = cp.create(&ResourceSpec::new(provider.clone())).await.unwrap();
        assert_eq!(state.property_str("registrationState"), Some("Registering"));

        let first = cp.get(&provider).await.unwrap().unwrap();
        assert_eq!(first.property_str("registrationState"), Some("Registering"));
        let second = cp.get(&provider).await.unwrap().unwrap();
        assert_eq!(second.property_str("registrationState"), Some(REGISTERED));
    }

    #[tokio::test]
    async fn test_update_rejects_index_past_array_end() {
        let cp = SimulatedControlPlane::new();
        with_app(&cp).await;
        assert!(cp.degrade(&app(), "template.containers", json!([])));

        let patch = FlatPatch::from([
            ("configuration.registry.server".to_string(), json!("acr.azurecr.io")),
            ("template.containers.0.image".to_string(), json!("acr.azurecr.io/app:v1")),
        ]);
        let result = cp.update(&app(), &patch).await;
        assert!(matches!(result, Err(ControlPlaneError::Validation(_))));

        let state = cp.state(&app()).unwrap();
        assert_eq!(state.property("template.containers"), Some(&json!([])));
        assert!(state.property("configuration.registry").is_none());
    }

    #[tokio::test]
    async fn test_structured_patch_rejects_non_object() {
        let cp = SimulatedControlPlane::new();
        with_app(&cp).await;
        let result = cp.apply_structured_patch(&app(), &json!(["volumes"])).await;
        assert!(matches!(result, Err(ControlPlaneError::Validation(_))));
    }

    #[tokio::test]
    async fn test_fault_fires_once() {
        let cp = SimulatedControlPlane::new();
        cp.inject(Fault::new(Operation::Create, group()));

        assert!(matches!(
            cp.create(&ResourceSpec::new(group())).await,
            Err(ControlPlaneError::Unavailable(_))
        ));
        assert!(cp.create(&ResourceSpec::new(group())).await.is_ok());
        assert_eq!(cp.calls_for(&group(), Operation::Create).len(), 2);
    }

    #[tokio::test]
    async fn test_whoami_when_logged_out() {
        let cp = SimulatedControlPlane::new().logged_out();
        assert!(matches!(cp.whoami().await, Err(ControlPlaneError::Auth(_))));
    }
}
