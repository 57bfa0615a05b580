//! Shared fixtures for acaprov integration tests.

#![allow(dead_code)]

use acaprov::config::DeployConfig;
use acaprov::graph::{ResourceGraph, ResourceNode};
use acaprov::reconciler::ensure::EnsureResource;
use acaprov::simulator::{Call, Operation};
use acaprov::topology::{DeploymentRefs, build_graph};
use acaprov::{ResourceKind, ResourceRef, ResourceSpec};

pub const CONFIG: &str = r#"
location = "westeurope"

[names]
resource_group = "rg-demo"
registry = "acrdemo01"
storage_account = "stdemo01"
vnet = "vnet-demo"
environment = "cae-demo"
app = "ca-demo"

[images]
target = "demo/app:v1"
import_source = "docker.io/library/nginx:1.27"

[app]
volume_name = "data"
mount_path = "/mnt/data"

[env]
DATA_DIR = "files"
UPLOAD_DIR = "uploads"
"#;

pub fn config() -> DeployConfig {
    CONFIG.parse().expect("fixture config is valid")
}

pub fn deployment() -> (DeployConfig, ResourceGraph, DeploymentRefs) {
    let config = config();
    let graph = build_graph(&config).expect("deployment graph is valid");
    let refs = DeploymentRefs::new(&config);
    (config, graph, refs)
}

/// A resource group with `count - 1` virtual networks inside it.
pub fn flat_graph(count: usize) -> ResourceGraph {
    let group = ResourceRef::new(ResourceKind::ResourceGroup, "rg-flat");
    let mut graph = ResourceGraph::new();
    graph
        .add_node(ResourceNode::new(
            "resource-group",
            EnsureResource::new(ResourceSpec::new(group.clone()).with("location", "westeurope")),
        ))
        .unwrap();
    for i in 1..count {
        let vnet = ResourceRef::child(ResourceKind::VirtualNetwork, format!("vnet-{:02}", i), &group);
        graph
            .add_node(
                ResourceNode::new(
                    format!("vnet-{:02}", i),
                    EnsureResource::new(
                        ResourceSpec::new(vnet).with("addressPrefixes", serde_json::json!([format!("10.{}.0.0/16", i)])),
                    ),
                )
                .depends_on(["resource-group"]),
            )
            .unwrap();
    }
    graph
}

/// Journal positions of `operation` on `reference`.
pub fn positions(calls: &[Call], reference: &ResourceRef, operation: Operation) -> Vec<usize> {
    calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.operation == operation && &c.reference == reference)
        .map(|(i, _)| i)
        .collect()
}
