mod common;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use common::{gpu_pod, instance_type, nodepool, pending_pod, ZONES};
use karpenter::apis::nodeclaim::NodeClaimStatus;
use karpenter::apis::NodeClaim;
use karpenter::scheduling::labels;
use karpenter::scheduling::scheduler::{Scheduler, SchedulerOptions, SchedulingError};
use karpenter::state::ClusterState;

fn schedule(
    state: &ClusterState,
    pools: Vec<(karpenter::apis::NodePool, Vec<karpenter::cloudprovider::types::InstanceType>)>,
    pods: Vec<k8s_openapi::api::core::v1::Pod>,
) -> karpenter::scheduling::scheduler::SchedulingResults {
    let snapshot = state.snapshot();
    Scheduler::new(&snapshot, pools, SchedulerOptions::default()).schedule(pods)
}

#[test]
fn single_cpu_pod_yields_one_flexible_claim() {
    let state = ClusterState::new();
    let catalog = vec![
        instance_type("small", 2, 4096, 0.02),
        instance_type("large", 8, 16384, 0.08),
    ];
    let results = schedule(
        &state,
        vec![(nodepool("general", None), catalog)],
        vec![pending_pod("web", "500m", "512Mi")],
    );

    assert!(results.errors.is_empty(), "{:?}", results.errors);
    assert_eq!(results.new_node_claims.len(), 1);
    let draft = &results.new_node_claims[0];

    // Full zonal and purchase flexibility survives into the claim.
    for zone in ZONES {
        assert!(draft.requirements.has(labels::ZONE_LABEL, zone));
    }
    assert!(draft
        .requirements
        .has(labels::CAPACITY_TYPE_LABEL, labels::CAPACITY_TYPE_SPOT));
    assert!(draft
        .requirements
        .has(labels::CAPACITY_TYPE_LABEL, labels::CAPACITY_TYPE_ON_DEMAND));

    // Cheapest-first ordering: the small shape leads.
    assert_eq!(draft.instance_types[0].name, "small");

    // Every remaining instance type can hold the claim's total requests.
    for it in &draft.instance_types {
        assert!(
            draft.requests.fits(&it.allocatable()),
            "claim does not fit {}",
            it.name
        );
    }
}

#[test]
fn gpu_pod_with_no_gpu_offering_fails_with_reason() {
    let state = ClusterState::new();
    let results = schedule(
        &state,
        vec![(
            nodepool("general", None),
            vec![instance_type("small", 2, 4096, 0.02)],
        )],
        vec![gpu_pod("trainer", 1)],
    );

    assert!(results.new_node_claims.is_empty());
    assert_eq!(results.errors.len(), 1);
    let error = results.errors.values().next().unwrap();
    assert!(
        matches!(error, SchedulingError::NoCompatibleInstanceTypes(_)),
        "unexpected reason: {error:?}"
    );
}

#[test]
fn pods_land_on_existing_registered_nodes_first() {
    let state = ClusterState::new();
    let node = Node {
        metadata: ObjectMeta {
            name: Some("node-a".into()),
            labels: Some(BTreeMap::from([
                (labels::HOSTNAME_LABEL.to_string(), "node-a".to_string()),
                (labels::ZONE_LABEL.to_string(), "z1".to_string()),
                (labels::REGISTERED_LABEL.to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some("fake://i-1".into()),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("4".into())),
                ("memory".to_string(), Quantity("8Gi".into())),
                ("pods".to_string(), Quantity("110".into())),
            ])),
            ..Default::default()
        }),
    };
    state.update_node(node);

    let results = schedule(
        &state,
        vec![(
            nodepool("general", None),
            vec![instance_type("small", 2, 4096, 0.02)],
        )],
        vec![pending_pod("web", "500m", "512Mi")],
    );

    assert!(results.errors.is_empty());
    assert!(results.new_node_claims.is_empty());
    assert_eq!(results.bindings.len(), 1);
    assert_eq!(results.bindings[0].1, "node-a");
}

#[test]
fn in_flight_claims_absorb_pods_instead_of_duplicating() {
    let state = ClusterState::new();

    // A claim created by the previous pass, reflected with projected
    // capacity but no node yet.
    let small = instance_type("small", 2, 4096, 0.02);
    let mut claim = NodeClaim::new(
        "general-abc",
        karpenter::apis::nodeclaim::NodeClaimSpec {
            node_pool: "general".into(),
            requirements: vec![],
            resources: BTreeMap::new(),
            taints: None,
            startup_taints: None,
            termination_grace_period_seconds: None,
            expire_after_seconds: None,
        },
    );
    claim.status = Some(NodeClaimStatus {
        allocatable: small.allocatable().to_list(),
        capacity: small.capacity.to_list(),
        ..Default::default()
    });
    state.update_node_claim(claim);

    let results = schedule(
        &state,
        vec![(nodepool("general", None), vec![small])],
        vec![pending_pod("web", "500m", "512Mi")],
    );

    assert!(results.errors.is_empty());
    assert!(
        results.new_node_claims.is_empty(),
        "should not duplicate in-flight capacity"
    );
    assert_eq!(results.nominations.len(), 1);
    assert_eq!(results.nominations[0].1, "general-abc");
}

#[test]
fn heavier_pools_are_tried_first() {
    let state = ClusterState::new();
    let results = schedule(
        &state,
        vec![
            (
                nodepool("backup", Some(1)),
                vec![instance_type("small", 2, 4096, 0.01)],
            ),
            (
                nodepool("preferred", Some(10)),
                vec![instance_type("small", 2, 4096, 0.02)],
            ),
        ],
        vec![pending_pod("web", "500m", "512Mi")],
    );

    assert_eq!(results.new_node_claims.len(), 1);
    assert_eq!(results.new_node_claims[0].pool, "preferred");
}

#[test]
fn instance_type_list_is_truncated_with_zone_coverage() {
    let state = ClusterState::new();
    let catalog: Vec<_> = (0..80)
        .map(|i| instance_type(&format!("type-{i:02}"), 4, 8192, 0.01 + i as f64 * 0.001))
        .collect();
    let results = schedule(
        &state,
        vec![(nodepool("general", None), catalog)],
        vec![pending_pod("web", "500m", "512Mi")],
    );

    assert_eq!(results.new_node_claims.len(), 1);
    let draft = &results.new_node_claims[0];
    assert!(draft.instance_types.len() <= 60);
    // The cheapest type always survives truncation.
    assert!(draft.instance_types.iter().any(|t| t.name == "type-00"));
    // Zones remain covered.
    for zone in ZONES {
        assert!(draft.requirements.has(labels::ZONE_LABEL, zone));
    }
}

#[test]
fn forty_small_pods_pack_into_bounded_claims() {
    let state = ClusterState::new();
    let pods: Vec<_> = (0..40)
        .map(|i| pending_pod(&format!("pod-{i}"), "1", "512Mi"))
        .collect();
    let results = schedule(
        &state,
        vec![(
            nodepool("general", None),
            vec![
                instance_type("small-2cpu", 2, 4096, 0.01),
                instance_type("medium-4cpu", 4, 8192, 0.018),
            ],
        )],
        pods,
    );

    assert!(results.errors.is_empty(), "{:?}", results.errors);
    let placed: usize = results
        .new_node_claims
        .iter()
        .map(|draft| draft.pods.len())
        .sum();
    assert_eq!(placed + results.bindings.len(), 40);

    let created = results.new_node_claims.len();
    assert!(
        (1..=20).contains(&created),
        "expected between 1 and 20 claims, got {created}"
    );

    // Feasibility on every claim (the packing invariant).
    for draft in &results.new_node_claims {
        assert!(!draft.instance_types.is_empty());
        for it in &draft.instance_types {
            assert!(draft.requests.fits(&it.allocatable()));
        }
    }
}

#[test]
fn restricted_label_selectors_fail_scheduling() {
    let state = ClusterState::new();
    let mut pod = pending_pod("web", "500m", "512Mi");
    pod.spec.as_mut().unwrap().node_selector = Some(BTreeMap::from([(
        "karpenter.sh/private-key".to_string(),
        "oops".to_string(),
    )]));
    let results = schedule(
        &state,
        vec![(
            nodepool("general", None),
            vec![instance_type("small", 2, 4096, 0.02)],
        )],
        vec![pod],
    );
    let error = results.errors.values().next().unwrap();
    assert!(matches!(error, SchedulingError::UnknownLabel(_)));
}
