//! The private Container App deployment as a resource graph.
//!
//! Nodes are declared in a reference order that already satisfies every
//! dependency, so the topological order equals declaration order.

use serde_json::json;

use crate::config::DeployConfig;
use crate::error::GraphError;
use crate::graph::{ResourceGraph, ResourceNode};
use crate::reconciler::ensure::EnsureResource;
use crate::reconciler::identity::SystemIdentity;
use crate::reconciler::patch::{DocumentPatch, FieldPatch};
use crate::reconciler::provider::ProviderRegistration;
use crate::reconciler::role::{ACR_PULL, RoleGrant, STORAGE_FILE_SMB_CONTRIBUTOR};
use crate::resource::{Postcondition, ResourceKind, ResourceRef, ResourceSpec};
use crate::wait::Backoff;

pub const PRIVATE_DNS_ZONE: &str = "privatelink.file.core.windows.net";
pub const APP_DELEGATION: &str = "Microsoft.App/environments";

/// Image path patched by the promotion step.
pub const APP_IMAGE: &str = "template.containers.0.image";
pub const PUBLIC_NETWORK_ACCESS: &str = "publicNetworkAccess";

/// References of every resource in the deployment.
#[derive(Debug, Clone)]
pub struct DeploymentRefs {
    pub group: ResourceRef,
    pub registry: ResourceRef,
    pub image: ResourceRef,
    pub storage_account: ResourceRef,
    pub file_share: ResourceRef,
    pub vnet: ResourceRef,
    pub ca_subnet: ResourceRef,
    pub pe_subnet: ResourceRef,
    pub private_endpoint: ResourceRef,
    pub dns_zone: ResourceRef,
    pub dns_link: ResourceRef,
    pub zone_group: ResourceRef,
    pub environment: ResourceRef,
    pub environment_storage: ResourceRef,
    pub app: ResourceRef,
}

impl DeploymentRefs {
    pub fn new(config: &DeployConfig) -> Self {
        let names = &config.names;
        let group = ResourceRef::new(ResourceKind::ResourceGroup, &names.resource_group);
        let registry = ResourceRef::child(ResourceKind::ContainerRegistry, &names.registry, &group);
        let image = ResourceRef::child(ResourceKind::RegistryImage, &config.images.target, &registry);
        let storage_account =
            ResourceRef::child(ResourceKind::StorageAccount, &names.storage_account, &group);
        let file_share = ResourceRef::child(ResourceKind::FileShare, &names.file_share, &storage_account);
        let vnet = ResourceRef::child(ResourceKind::VirtualNetwork, &names.vnet, &group);
        let ca_subnet = ResourceRef::child(ResourceKind::Subnet, &names.ca_subnet, &vnet);
        let pe_subnet = ResourceRef::child(ResourceKind::Subnet, &names.pe_subnet, &vnet);
        let private_endpoint =
            ResourceRef::child(ResourceKind::PrivateEndpoint, names.private_endpoint(), &group);
        let dns_zone = ResourceRef::child(ResourceKind::PrivateDnsZone, PRIVATE_DNS_ZONE, &group);
        let dns_link =
            ResourceRef::child(ResourceKind::PrivateDnsLink, format!("link-{}", names.vnet), &dns_zone);
        let zone_group = ResourceRef::child(ResourceKind::DnsZoneGroup, "default", &private_endpoint);
        let environment = ResourceRef::child(ResourceKind::ContainerEnvironment, &names.environment, &group);
        let environment_storage = ResourceRef::child(
            ResourceKind::EnvironmentStorage,
            &names.environment_storage,
            &environment,
        );
        let app = ResourceRef::child(ResourceKind::ContainerApp, &names.app, &group);

        Self {
            group,
            registry,
            image,
            storage_account,
            file_share,
            vnet,
            ca_subnet,
            pe_subnet,
            private_endpoint,
            dns_zone,
            dns_link,
            zone_group,
            environment,
            environment_storage,
            app,
        }
    }
}

/// Node id of a provider registration.
pub fn provider_node_id(namespace: &str) -> String {
    format!("provider-{}", namespace.to_lowercase().replace('.', "-"))
}

/// Build the full deployment graph for `config`.
pub fn build_graph(config: &DeployConfig) -> Result<ResourceGraph, GraphError> {
    let refs = DeploymentRefs::new(config);
    let mut graph = ResourceGraph::new();

    // Prerequisites

    let provider_backoff = Backoff::with_deadline(config.timeouts.provider());
    let mut prerequisites = Vec::new();
    for namespace in &config.providers {
        let id = provider_node_id(namespace);
        graph.add_node(ResourceNode::new(
            id.as_str(),
            ProviderRegistration::new(namespace, provider_backoff),
        ))?;
        prerequisites.push(id);
    }
    if let Some(extension) = &config.cli_extension {
        graph.add_node(ResourceNode::new(
            "cli-extension",
            EnsureResource::new(
                ResourceSpec::new(ResourceRef::new(ResourceKind::CliExtension, extension))
                    .with("upgrade", true),
            ),
        ))?;
        prerequisites.push("cli-extension".to_string());
    }

    graph.add_node(
        ResourceNode::new(
            "resource-group",
            EnsureResource::new(
                ResourceSpec::new(refs.group.clone()).with("location", config.location.as_str()),
            ),
        )
        .depends_on(prerequisites),
    )?;

    // Registry and storage

    graph.add_node(
        ResourceNode::new(
            "acr",
            EnsureResource::new(
                ResourceSpec::new(refs.registry.clone())
                    .with("location", config.location.as_str())
                    .with("sku", "Basic")
                    .with("adminUserEnabled", false)
                    .with("loginServer", config.registry_server()),
            ),
        )
        .depends_on(["resource-group"]),
    )?;

    let mut image_deps = vec!["registry-binding"];
    if let Some(source) = &config.images.import_source {
        graph.add_node(
            ResourceNode::new(
                "acr-image",
                EnsureResource::new(ResourceSpec::new(refs.image.clone()).with("source", source.as_str())),
            )
            .depends_on(["acr"]),
        )?;
        image_deps.push("acr-image");
    }

    graph.add_node(
        ResourceNode::new(
            "storage-account",
            EnsureResource::new(
                ResourceSpec::new(refs.storage_account.clone())
                    .with("location", config.location.as_str())
                    .with("kind", "StorageV2")
                    .with("sku", config.storage.sku.as_str())
                    .with("minimumTlsVersion", "TLS1_2")
                    .with(PUBLIC_NETWORK_ACCESS, "Enabled"),
            ),
        )
        .depends_on(["resource-group"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "file-share",
            EnsureResource::new(
                ResourceSpec::new(refs.file_share.clone()).with("quota", config.storage.share_quota_gb),
            ),
        )
        .depends_on(["storage-account"]),
    )?;

    // Network

    graph.add_node(
        ResourceNode::new(
            "vnet",
            EnsureResource::new(
                ResourceSpec::new(refs.vnet.clone())
                    .with("location", config.location.as_str())
                    .with("addressPrefixes", json!([config.network.vnet_prefix])),
            ),
        )
        .depends_on(["resource-group"]),
    )?;

    // A subnet without the delegation cannot host the environment and
    // delegation cannot be changed while in use, so it is recreated.
    graph.add_node(
        ResourceNode::new(
            "ca-subnet",
            EnsureResource::new(
                ResourceSpec::new(refs.ca_subnet.clone())
                    .with("addressPrefix", config.network.ca_subnet_prefix.as_str())
                    .with("delegation", APP_DELEGATION),
            )
            .with_postcondition(Postcondition::All(vec![
                Postcondition::equals("delegation", APP_DELEGATION),
                Postcondition::equals("addressPrefix", config.network.ca_subnet_prefix.as_str()),
            ])),
        )
        .depends_on(["vnet"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "pe-storage-subnet",
            EnsureResource::new(
                ResourceSpec::new(refs.pe_subnet.clone())
                    .with("addressPrefix", config.network.pe_subnet_prefix.as_str())
                    .with("privateEndpointNetworkPolicies", "Disabled"),
            )
            .with_postcondition(Postcondition::equals(
                "addressPrefix",
                config.network.pe_subnet_prefix.as_str(),
            )),
        )
        .depends_on(["vnet"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "private-endpoint",
            EnsureResource::new(
                ResourceSpec::new(refs.private_endpoint.clone())
                    .with("location", config.location.as_str())
                    .with("subnetId", refs.pe_subnet.id())
                    .with("privateLinkServiceId", refs.storage_account.id())
                    .with("groupIds", json!(["file"])),
            ),
        )
        .depends_on(["pe-storage-subnet", "storage-account"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "dns-zone",
            EnsureResource::new(ResourceSpec::new(refs.dns_zone.clone()).with("location", "global")),
        )
        .depends_on(["resource-group"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "dns-link",
            EnsureResource::new(
                ResourceSpec::new(refs.dns_link.clone())
                    .with("virtualNetworkId", refs.vnet.id())
                    .with("registrationEnabled", false),
            ),
        )
        .depends_on(["dns-zone", "vnet"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "dns-zone-group",
            EnsureResource::new(
                ResourceSpec::new(refs.zone_group.clone()).with("privateDnsZoneId", refs.dns_zone.id()),
            ),
        )
        .depends_on(["private-endpoint", "dns-zone"]),
    )?;

    // Container Apps environment

    graph.add_node(
        ResourceNode::new(
            "container-env",
            EnsureResource::new(
                ResourceSpec::new(refs.environment.clone())
                    .with("location", config.location.as_str())
                    .with("infrastructureSubnetId", refs.ca_subnet.id()),
            )
            .with_postcondition(Postcondition::equals(
                "infrastructureSubnetId",
                refs.ca_subnet.id(),
            )),
        )
        .depends_on(["ca-subnet", "dns-link"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "env-storage",
            EnsureResource::new(
                ResourceSpec::new(refs.environment_storage.clone())
                    .with("azureFile.accountName", config.names.storage_account.as_str())
                    .with("azureFile.shareName", config.names.file_share.as_str())
                    .with("azureFile.accessMode", "ReadWrite"),
            ),
        )
        .depends_on(["container-env", "file-share"]),
    )?;

    // Application: bootstrap with a public image, then promote

    let app = &config.app;
    graph.add_node(
        ResourceNode::new(
            "container-app",
            EnsureResource::new(
                ResourceSpec::new(refs.app.clone())
                    .with("location", config.location.as_str())
                    .with("environmentId", refs.environment.id())
                    .with("configuration.ingress.external", true)
                    .with("configuration.ingress.targetPort", app.target_port)
                    .with(
                        "template.containers",
                        json!([{
                            "name": config.names.app,
                            "image": config.images.bootstrap,
                            "resources": { "cpu": app.cpu, "memory": app.memory },
                        }]),
                    )
                    .with("template.scale.minReplicas", app.min_replicas)
                    .with("template.scale.maxReplicas", app.max_replicas),
            ),
        )
        .depends_on(["container-env"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "app-identity",
            SystemIdentity::new(refs.app.clone(), Backoff::with_deadline(config.timeouts.identity())),
        )
        .depends_on(["container-app"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "role-acrpull",
            RoleGrant::new(refs.app.clone(), ACR_PULL, refs.registry.clone()),
        )
        .depends_on(["app-identity", "acr"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "role-storage-smb",
            RoleGrant::new(
                refs.app.clone(),
                STORAGE_FILE_SMB_CONTRIBUTOR,
                refs.storage_account.clone(),
            ),
        )
        .depends_on(["app-identity", "storage-account"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "registry-binding",
            FieldPatch::new(refs.app.clone())
                .set("configuration.registry.server", config.registry_server())
                .set("configuration.registry.identity", "system"),
        )
        .depends_on(["role-acrpull"]),
    )?;

    graph.add_node(
        ResourceNode::new(
            "app-image",
            FieldPatch::new(refs.app.clone()).set(APP_IMAGE, config.target_image()),
        )
        .depends_on(image_deps),
    )?;

    graph.add_node(
        ResourceNode::new(
            "volume-mount-patch",
            DocumentPatch::new(
                refs.app.clone(),
                json!({
                    "template": {
                        "volumes": [{
                            "name": app.volume_name,
                            "storageType": "AzureFile",
                            "storageName": config.names.environment_storage,
                        }],
                        "containers": [{
                            "name": config.names.app,
                            "volumeMounts": [{
                                "volumeName": app.volume_name,
                                "mountPath": app.mount_path,
                            }],
                        }],
                    }
                }),
            ),
        )
        .depends_on(["app-image", "env-storage", "role-storage-smb"]),
    )?;

    let mut hardening_deps = vec!["private-endpoint", "dns-zone-group", "env-storage", "volume-mount-patch"];
    if !config.env.is_empty() {
        let vars: Vec<_> = config
            .env
            .iter()
            .map(|(name, path)| json!({ "name": name, "value": config.env_value(path) }))
            .collect();
        graph.add_node(
            ResourceNode::new(
                "env-vars",
                DocumentPatch::new(
                    refs.app.clone(),
                    json!({
                        "template": {
                            "containers": [{ "name": config.names.app, "env": vars }],
                        }
                    }),
                ),
            )
            .depends_on(["volume-mount-patch"]),
        )?;
        hardening_deps.push("env-vars");
    }

    // Only lock storage down once the private path is fully wired.
    graph.add_node(
        ResourceNode::new(
            "storage-hardening",
            FieldPatch::new(refs.storage_account.clone()).set(PUBLIC_NETWORK_ACCESS, "Disabled"),
        )
        .depends_on(hardening_deps),
    )?;

    graph.validate()?;
    Ok(graph)
}
