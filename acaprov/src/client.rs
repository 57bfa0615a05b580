//! Control-plane client contract.
//!
//! The reconciler never talks to the cloud directly; everything goes
//! through [`ControlPlane`]. Implementations are expected to block (await)
//! until the cloud operation completed or failed.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::resource::{FlatPatch, ResourceRef, ResourceSpec, ResourceState};

/// Errors reported by the control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlPlaneError {
    /// Resource does not exist (for update/delete; `get` returns `None` instead).
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource exists with an incompatible configuration or was created concurrently.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Spec or patch is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller is not logged in or lacks permission.
    #[error("not authorized: {0} (log in again or grant the missing permission)")]
    Auth(String),

    /// Transport or service failure.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
}

/// Result type for control-plane calls.
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub subscription: String,
}

/// Management API surface used by the reconciler.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Read current state, `None` if the resource does not exist.
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ResourceState>>;

    /// Create a resource from a declarative spec.
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceState>;

    /// Apply a flat field patch.
    async fn update(&self, reference: &ResourceRef, patch: &FlatPatch) -> Result<ResourceState>;

    /// Merge a nested document fragment into the resource.
    async fn apply_structured_patch(
        &self,
        reference: &ResourceRef,
        fragment: &Value,
    ) -> Result<ResourceState>;

    /// Delete a resource. Only used to recreate degraded resources.
    async fn delete(&self, reference: &ResourceRef) -> Result<()>;

    /// Grant `role` at `scope` to `principal`. Re-granting is a no-op.
    async fn assign_role(&self, principal: &str, role: &str, scope: &str) -> Result<()>;
}

/// Login check, run before a deployment.
#[async_trait]
pub trait Session: Send + Sync {
    /// The logged-in principal; `Auth` when not logged in.
    async fn whoami(&self) -> Result<Principal>;
}
