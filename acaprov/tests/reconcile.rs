//! End-to-end reconciliation of the deployment graph against the
//! simulated control plane.

mod common;

use std::collections::{HashMap, HashSet};

use acaprov::reconciler::RunContext;
use acaprov::reconciler::identity::PRINCIPAL_ID;
use acaprov::reconciler::role::ACR_PULL;
use acaprov::simulator::{Fault, Operation, SimulatedControlPlane};
use acaprov::topology::{APP_IMAGE, PUBLIC_NETWORK_ACCESS};
use acaprov::{
    ControlPlane, ControlPlaneError, NodeOutcome, Postcondition, ReconcileError, Reconciler, Reporter,
    ResourceKind, ResourceRef, TableReporter,
};
use serde_json::json;

use common::{deployment, flat_graph, positions};

#[tokio::test]
async fn test_second_run_is_all_skipped() {
    let (_, graph, _) = deployment();
    let cp = SimulatedControlPlane::new();
    let reconciler = Reconciler::new();

    let first = reconciler.run(&graph, &cp).await.unwrap();
    assert!(first.is_success(), "{}", TableReporter.render(&first));
    let counts = first.counts();
    assert_eq!(counts.created + counts.updated, graph.len());
    assert_eq!(counts.failed, 0);

    cp.clear_calls();
    let second = reconciler.run(&graph, &cp).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.counts().skipped, graph.len());
    assert_eq!(second.counts().changed(), 0);
    assert!(cp.mutations().is_empty(), "unexpected mutations: {:?}", cp.mutations());
}

#[tokio::test]
async fn test_parents_exist_before_children() {
    let (_, graph, _) = deployment();
    let cp = SimulatedControlPlane::new();
    Reconciler::new().run(&graph, &cp).await.unwrap();

    let mut created = HashSet::new();
    for call in cp.mutations() {
        match call.operation {
            Operation::Create => {
                if let Some(scope) = &call.reference.scope {
                    assert!(created.contains(scope), "{} created before its parent", call.reference);
                }
                created.insert(call.reference.id());
            }
            Operation::AssignRole => {
                let scope = call.reference.scope.clone().unwrap();
                assert!(created.contains(&scope), "role granted before {} existed", scope);
            }
            _ => assert!(
                created.contains(&call.reference.id()),
                "{:?} on {} before it was created",
                call.operation,
                call.reference
            ),
        }
    }
}

#[tokio::test]
async fn test_dependencies_finish_before_dependents_start() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    Reconciler::new().run(&graph, &cp).await.unwrap();

    let principal = cp
        .state(&refs.app)
        .unwrap()
        .property_str(PRINCIPAL_ID)
        .unwrap()
        .to_string();
    let mut ctx = RunContext::new();
    ctx.publish_principal(&refs.app, principal);

    let calls = cp.calls();
    assert!(calls.windows(2).all(|w| w[0].at <= w[1].at));

    // Every visit opens with a Get on its target.
    let order = graph.topological_order().unwrap();
    let mut starts = Vec::new();
    let mut cursor = 0;
    for node in &order {
        let target = node.reconciler().target(&ctx).unwrap();
        let start = (cursor..calls.len())
            .find(|&i| calls[i].operation == Operation::Get && calls[i].reference == target)
            .unwrap_or_else(|| panic!("no Get for node '{}'", node.id()));
        starts.push((node.id(), target, start));
        cursor = start + 1;
    }

    let mut windows: HashMap<&str, (usize, usize)> = HashMap::new();
    for (i, (id, target, start)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(calls.len(), |next| next.2);
        for call in &calls[*start..end] {
            assert_eq!(&call.reference, target, "node '{}' touched {}", id, call.reference);
        }
        windows.insert(*id, (*start, end));
    }

    for node in &order {
        let (start, _) = windows[node.id()];
        for dep in node.dependencies() {
            let (_, dep_end) = windows[dep.as_str()];
            assert!(
                dep_end <= start,
                "'{}' started before its dependency '{}' finished",
                node.id(),
                dep
            );
        }
    }
}

#[tokio::test]
async fn test_emptied_containers_fail_instead_of_corrupting() {
    let (config, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    let reconciler = Reconciler::new();
    reconciler.run(&graph, &cp).await.unwrap();

    assert!(cp.degrade(&refs.app, "template.containers", json!([])));

    let result = reconciler.run(&graph, &cp).await.unwrap();
    assert!(!result.is_success(), "{}", TableReporter.render(&result));
    let failure = result.failure().unwrap();
    assert_eq!(failure.id, "app-image");
    assert!(matches!(
        failure.cause,
        ReconcileError::ControlPlane(ControlPlaneError::Validation(_))
    ));
    assert!(result.outcome("volume-mount-patch").is_none());

    let app = cp.state(&refs.app).unwrap();
    assert_eq!(app.property("template.containers"), Some(&json!([])));

    // Once the container is back, a single run converges.
    assert!(cp.degrade(
        &refs.app,
        "template.containers",
        json!([{ "name": config.names.app, "image": config.images.bootstrap }]),
    ));
    let healed = reconciler.run(&graph, &cp).await.unwrap();
    assert!(healed.is_success());
    let settled = reconciler.run(&graph, &cp).await.unwrap();
    assert_eq!(settled.counts().skipped, graph.len());
}

#[tokio::test]
async fn test_degraded_subnet_is_recreated_alone() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    let reconciler = Reconciler::new();
    reconciler.run(&graph, &cp).await.unwrap();

    assert!(cp.degrade(&refs.ca_subnet, "delegation", json!(null)));
    cp.clear_calls();

    let result = reconciler.run(&graph, &cp).await.unwrap();
    assert!(result.is_success());
    assert!(matches!(
        result.outcome("ca-subnet"),
        Some(NodeOutcome::Recreated { reason }) if reason.contains("delegation")
    ));
    assert_eq!(result.counts().recreated, 1);
    assert_eq!(result.counts().skipped, graph.len() - 1);

    let mutations: Vec<_> = cp
        .mutations()
        .into_iter()
        .map(|c| (c.operation, c.reference))
        .collect();
    assert_eq!(
        mutations,
        vec![
            (Operation::Delete, refs.ca_subnet.clone()),
            (Operation::Create, refs.ca_subnet.clone()),
        ]
    );
    assert_eq!(
        cp.state(&refs.ca_subnet).unwrap().property_str("delegation"),
        Some("Microsoft.App/environments")
    );
}

#[tokio::test]
async fn test_app_bootstraps_before_promotion() {
    let (config, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    Reconciler::new().run(&graph, &cp).await.unwrap();

    let calls = cp.calls();
    let create = positions(&calls, &refs.app, Operation::Create);
    let updates = positions(&calls, &refs.app, Operation::Update);
    let grants: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.operation == Operation::AssignRole)
        .map(|(i, _)| i)
        .collect();

    // identity, registry binding, image
    assert_eq!(create.len(), 1);
    assert_eq!(updates.len(), 3);
    assert_eq!(grants.len(), 2);
    assert!(create[0] < updates[0]);
    assert!(grants.iter().all(|&g| updates[0] < g && g < updates[1]));

    let app = cp.state(&refs.app).unwrap();
    assert_eq!(app.property_str(APP_IMAGE), Some(config.target_image().as_str()));
    assert_eq!(
        app.property_str("configuration.registry.server"),
        Some("acrdemo01.azurecr.io")
    );

    let principal = app.property_str(PRINCIPAL_ID).unwrap();
    let grant = ResourceRef::role_assignment(principal, ACR_PULL, &refs.registry.id());
    assert!(cp.state(&grant).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_missing_principal_times_out_before_grants() {
    let (config, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new().with_principal_polls(None);

    let result = Reconciler::new().run(&graph, &cp).await.unwrap();
    assert!(!result.is_success());

    let failure = result.failure().unwrap();
    assert_eq!(failure.id, "app-identity");
    assert!(matches!(failure.cause, ReconcileError::DependencyTimeout { .. }));
    assert_eq!(result.outcome("container-app"), Some(&NodeOutcome::Created));
    assert!(result.outcome("role-acrpull").is_none());

    let calls = cp.calls();
    assert!(calls.iter().all(|c| c.operation != Operation::AssignRole));
    // Only the identity assignment touched the app.
    assert_eq!(positions(&calls, &refs.app, Operation::Update).len(), 1);

    let app = cp.state(&refs.app).unwrap();
    assert_eq!(app.property_str(APP_IMAGE), Some(config.images.bootstrap.as_str()));
    assert!(app.property("configuration.registry").is_none());
    assert_eq!(
        cp.state(&refs.storage_account)
            .unwrap()
            .property_str(PUBLIC_NETWORK_ACCESS),
        Some("Enabled")
    );
}

#[tokio::test]
async fn test_volume_patch_does_not_duplicate() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    let reconciler = Reconciler::new();
    reconciler.run(&graph, &cp).await.unwrap();
    reconciler.run(&graph, &cp).await.unwrap();

    let app = cp.state(&refs.app).unwrap();
    let volumes = app.property("template.volumes").unwrap().as_array().unwrap();
    assert_eq!(volumes.len(), 1);
    let containers = app.property("template.containers").unwrap().as_array().unwrap();
    assert_eq!(containers.len(), 1);
    let mounts = app
        .property("template.containers.0.volumeMounts")
        .unwrap()
        .as_array()
        .unwrap();
    assert_eq!(mounts.len(), 1);
    let env = app.property("template.containers.0.env").unwrap().as_array().unwrap();
    assert_eq!(env.len(), 2);
    assert!(env.contains(&json!({ "name": "DATA_DIR", "value": "/mnt/data/files" })));
}

#[tokio::test]
async fn test_structured_patch_applied_twice_is_unchanged() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    Reconciler::new().run(&graph, &cp).await.unwrap();

    let Postcondition::Includes { document } = graph
        .get("volume-mount-patch")
        .unwrap()
        .reconciler()
        .postcondition()
    else {
        panic!("volume-mount-patch checks a document fragment");
    };

    let before = cp.state(&refs.app).unwrap();
    let once = cp.apply_structured_patch(&refs.app, &document).await.unwrap();
    let twice = cp.apply_structured_patch(&refs.app, &document).await.unwrap();
    assert_eq!(once, before);
    assert_eq!(twice, once);
    assert_eq!(cp.calls_for(&refs.app, Operation::StructuredPatch).len(), 4);
}

#[tokio::test]
async fn test_changed_mount_path_is_patched_in_place() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    let reconciler = Reconciler::new();
    reconciler.run(&graph, &cp).await.unwrap();

    assert!(cp.degrade(
        &refs.app,
        "template.containers.0.volumeMounts.0.mountPath",
        json!("/srv/other"),
    ));
    cp.clear_calls();

    let result = reconciler.run(&graph, &cp).await.unwrap();
    assert_eq!(result.outcome("volume-mount-patch"), Some(&NodeOutcome::Updated));
    assert_eq!(result.counts().updated, 1);
    assert_eq!(positions(&cp.calls(), &refs.app, Operation::Delete).len(), 0);

    let app = cp.state(&refs.app).unwrap();
    let mounts = app
        .property("template.containers.0.volumeMounts")
        .unwrap()
        .as_array()
        .unwrap();
    assert_eq!(mounts, &vec![json!({ "volumeName": "data", "mountPath": "/mnt/data" })]);
}

#[tokio::test]
async fn test_hardening_runs_last() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    Reconciler::new().run(&graph, &cp).await.unwrap();

    let calls = cp.mutations();
    let last = calls.last().unwrap();
    assert_eq!(last.operation, Operation::Update);
    assert_eq!(last.reference, refs.storage_account);
    assert_eq!(
        cp.state(&refs.storage_account)
            .unwrap()
            .property_str(PUBLIC_NETWORK_ACCESS),
        Some("Disabled")
    );
}

#[tokio::test]
async fn test_failure_aborts_and_rerun_resumes() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    cp.inject(
        Fault::new(Operation::Create, refs.vnet.clone())
            .fails_with(ControlPlaneError::Unavailable("throttled".to_string())),
    );
    let reconciler = Reconciler::new();

    let failed = reconciler.run(&graph, &cp).await.unwrap();
    assert!(!failed.is_success());
    let failure = failed.failure().unwrap();
    assert_eq!(failure.id, "vnet");
    assert!(matches!(
        failure.cause,
        ReconcileError::ControlPlane(ControlPlaneError::Unavailable(_))
    ));
    assert_eq!(failed.outcome("file-share"), Some(&NodeOutcome::Created));
    assert!(failed.outcome("ca-subnet").is_none());
    assert_eq!(failed.counts().failed, 1);
    assert_eq!(failed.outcomes().len(), failure.position + 1);
    assert!(cp.calls_for(&refs.ca_subnet, Operation::Get).is_empty());

    let report = TableReporter.render(&failed);
    assert!(report.contains("Run aborted at 'vnet'"));

    let resumed = reconciler.run(&graph, &cp).await.unwrap();
    assert!(resumed.is_success());
    assert_eq!(resumed.outcome("file-share"), Some(&NodeOutcome::Skipped));
    assert_eq!(resumed.outcome("vnet"), Some(&NodeOutcome::Created));
    assert_eq!(resumed.counts().skipped, failure.position);
}

#[tokio::test]
async fn test_auth_failure_is_reported() {
    let (_, graph, refs) = deployment();
    let cp = SimulatedControlPlane::new();
    cp.inject(
        Fault::new(Operation::Create, refs.group.clone())
            .fails_with(ControlPlaneError::Auth("token expired".to_string())),
    );

    let result = Reconciler::new().run(&graph, &cp).await.unwrap();
    let failure = result.failure().unwrap();
    assert_eq!(failure.id, "resource-group");
    assert!(failure.cause.is_auth());
    assert!(TableReporter.render(&result).contains("Log in again"));
}

#[tokio::test]
async fn test_twenty_nodes_create_then_skip() {
    let graph = flat_graph(20);
    let cp = SimulatedControlPlane::new();
    let reconciler = Reconciler::new();

    let first = reconciler.run(&graph, &cp).await.unwrap();
    assert_eq!(first.counts().created, 20);
    assert_eq!(cp.resource_count(), 20);

    let second = reconciler.run(&graph, &cp).await.unwrap();
    assert_eq!(second.counts().skipped, 20);
    assert_eq!(second.counts().created, 0);
}

#[tokio::test(start_paused = true)]
async fn test_provider_registration_is_polled() {
    let (_, graph, _) = deployment();
    let cp = SimulatedControlPlane::new().with_provider_polls(3);

    let result = Reconciler::new().run(&graph, &cp).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.outcome("provider-microsoft-app"), Some(&NodeOutcome::Created));

    let provider = ResourceRef::new(ResourceKind::Provider, "Microsoft.App");
    // initial probe plus three polls
    assert_eq!(cp.calls_for(&provider, Operation::Get).len(), 4);
    assert_eq!(
        cp.state(&provider).unwrap().property_str("registrationState"),
        Some("Registered")
    );
}

#[tokio::test]
async fn test_simulator_requires_login() {
    use acaprov::Session;

    let cp = SimulatedControlPlane::new().logged_out();
    assert!(matches!(cp.whoami().await, Err(ControlPlaneError::Auth(_))));
}
