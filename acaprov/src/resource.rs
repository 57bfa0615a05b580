//! Resource identities, declarative specs, observed state and postconditions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::document;

/// JSON object holding a resource's properties.
pub type Properties = Map<String, Value>;

/// Flat field patch: dotted property path to new value.
pub type FlatPatch = BTreeMap<String, Value>;

/// Kinds of cloud state the reconciler manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Provider,
    CliExtension,
    ResourceGroup,
    ContainerRegistry,
    RegistryImage,
    StorageAccount,
    FileShare,
    VirtualNetwork,
    Subnet,
    PrivateEndpoint,
    PrivateDnsZone,
    PrivateDnsLink,
    DnsZoneGroup,
    ContainerEnvironment,
    EnvironmentStorage,
    ContainerApp,
    RoleAssignment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Provider => "provider",
            ResourceKind::CliExtension => "cli-extension",
            ResourceKind::ResourceGroup => "resource-group",
            ResourceKind::ContainerRegistry => "container-registry",
            ResourceKind::RegistryImage => "registry-image",
            ResourceKind::StorageAccount => "storage-account",
            ResourceKind::FileShare => "file-share",
            ResourceKind::VirtualNetwork => "virtual-network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::PrivateEndpoint => "private-endpoint",
            ResourceKind::PrivateDnsZone => "private-dns-zone",
            ResourceKind::PrivateDnsLink => "private-dns-link",
            ResourceKind::DnsZoneGroup => "dns-zone-group",
            ResourceKind::ContainerEnvironment => "container-environment",
            ResourceKind::EnvironmentStorage => "environment-storage",
            ResourceKind::ContainerApp => "container-app",
            ResourceKind::RoleAssignment => "role-assignment",
        }
    }

    /// Path segment placed between the parent id and the resource name.
    fn id_segment(&self) -> &'static str {
        match self {
            ResourceKind::Provider => "providers",
            ResourceKind::CliExtension => "extensions",
            ResourceKind::ResourceGroup => "resourceGroups",
            ResourceKind::ContainerRegistry => "providers/Microsoft.ContainerRegistry/registries",
            ResourceKind::RegistryImage => "repositories",
            ResourceKind::StorageAccount => "providers/Microsoft.Storage/storageAccounts",
            ResourceKind::FileShare => "fileServices/default/shares",
            ResourceKind::VirtualNetwork => "providers/Microsoft.Network/virtualNetworks",
            ResourceKind::Subnet => "subnets",
            ResourceKind::PrivateEndpoint => "providers/Microsoft.Network/privateEndpoints",
            ResourceKind::PrivateDnsZone => "providers/Microsoft.Network/privateDnsZones",
            ResourceKind::PrivateDnsLink => "virtualNetworkLinks",
            ResourceKind::DnsZoneGroup => "privateDnsZoneGroups",
            ResourceKind::ContainerEnvironment => "providers/Microsoft.App/managedEnvironments",
            ResourceKind::EnvironmentStorage => "storages",
            ResourceKind::ContainerApp => "providers/Microsoft.App/containerApps",
            ResourceKind::RoleAssignment => "providers/Microsoft.Authorization/roleAssignments",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource: its kind, name and parent.
///
/// `scope` holds the parent's id (see [`ResourceRef::id`]), so a reference
/// fully determines where the resource lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub scope: Option<String>,
}

impl ResourceRef {
    /// A top-level reference (providers, extensions, resource groups).
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            scope: None,
        }
    }

    /// A reference nested under `parent`.
    pub fn child(kind: ResourceKind, name: impl Into<String>, parent: &ResourceRef) -> Self {
        Self {
            kind,
            name: name.into(),
            scope: Some(parent.id()),
        }
    }

    /// The role assignment of `role` to `principal` at `scope`.
    pub fn role_assignment(principal: &str, role: &str, scope: &str) -> Self {
        Self {
            kind: ResourceKind::RoleAssignment,
            name: format!("{}:{}", principal, role),
            scope: Some(scope.to_string()),
        }
    }

    /// ARM-style resource id, e.g.
    /// `/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/st`.
    pub fn id(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{}/{}/{}", scope, self.kind.id_segment(), self.name),
            None => format!("/{}/{}", self.kind.id_segment(), self.name),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// Declarative target configuration of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub reference: ResourceRef,
    pub properties: Properties,
}

impl ResourceSpec {
    pub fn new(reference: ResourceRef) -> Self {
        Self {
            reference,
            properties: Properties::new(),
        }
    }

    /// Set a (dotted) property.
    ///
    /// Paths indexing past the end of an array are dropped with a warning.
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        if let Err(e) = document::set_path(&mut self.properties, path, value.into()) {
            warn!(resource = %self.reference, path, error = %e, "Ignoring property");
        }
        self
    }
}

/// Observed state of a resource as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub reference: ResourceRef,
    pub properties: Properties,
}

impl ResourceState {
    pub fn new(reference: ResourceRef, properties: Properties) -> Self {
        Self {
            reference,
            properties,
        }
    }

    /// Dotted-path property lookup.
    pub fn property(&self, path: &str) -> Option<&Value> {
        document::lookup(&self.properties, path)
    }

    /// Dotted-path lookup of a string property.
    pub fn property_str(&self, path: &str) -> Option<&str> {
        self.property(path).and_then(Value::as_str)
    }
}

impl From<ResourceSpec> for ResourceState {
    fn from(spec: ResourceSpec) -> Self {
        Self {
            reference: spec.reference,
            properties: spec.properties,
        }
    }
}

/// Predicate the observed state must satisfy to be accepted as converged.
#[derive(Debug, Clone, PartialEq)]
pub enum Postcondition {
    /// Presence is enough.
    Exists,
    /// The property at `path` equals `value`.
    Equals { path: String, value: Value },
    /// The property at `path` holds a non-null value.
    Present { path: String },
    /// The observed properties already contain this document fragment.
    Includes { document: Value },
    All(Vec<Postcondition>),
}

impl Postcondition {
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Postcondition::Equals {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn present(path: impl Into<String>) -> Self {
        Postcondition::Present { path: path.into() }
    }

    pub fn holds(&self, state: &ResourceState) -> bool {
        match self {
            Postcondition::Exists => true,
            Postcondition::Equals { path, value } => state.property(path) == Some(value),
            Postcondition::Present { path } => state.property(path).is_some_and(|v| !v.is_null()),
            Postcondition::Includes { document } => match document {
                Value::Object(fragment) => document::includes_object(&state.properties, fragment),
                _ => false,
            },
            Postcondition::All(conditions) => conditions.iter().all(|c| c.holds(state)),
        }
    }

    /// Whether this postcondition checks more than existence.
    pub fn is_trivial(&self) -> bool {
        match self {
            Postcondition::Exists => true,
            Postcondition::All(conditions) => conditions.iter().all(Postcondition::is_trivial),
            _ => false,
        }
    }

    /// First unmet clause, for logging why a resource is degraded.
    pub fn first_violation(&self, state: &ResourceState) -> Option<&Postcondition> {
        match self {
            Postcondition::All(conditions) => {
                conditions.iter().find_map(|c| c.first_violation(state))
            }
            other if !other.holds(state) => Some(other),
            _ => None,
        }
    }
}

impl fmt::Display for Postcondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Postcondition::Exists => f.write_str("exists"),
            Postcondition::Equals { path, value } => write!(f, "{} == {}", path, value),
            Postcondition::Present { path } => write!(f, "{} is set", path),
            Postcondition::Includes { .. } => f.write_str("includes document fragment"),
            Postcondition::All(conditions) => {
                let parts: Vec<String> = conditions.iter().map(|c| c.to_string()).collect();
                f.write_str(&parts.join(" && "))
            }
        }
    }
}
