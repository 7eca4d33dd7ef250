//! Helpers for poking a live cluster during development. Compiled only with
//! the `testing` feature; the `test_pod` and `nuke` binaries front them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::apis::{NodeClaim, NodePool};

pub const TEST_LABEL: &str = "app.kubernetes.io/managed-by";
pub const TEST_LABEL_VALUE: &str = "karpenter-test";

/// Create a pod with the given resource requests. It will sit
/// Pending/Unschedulable until a node can satisfy it.
pub async fn create_test_pod(
    client: Client,
    name: &str,
    cpu: &str,
    memory: &str,
    gpu: Option<u32>,
) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::default_namespaced(client);

    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.into())),
        ("memory".to_string(), Quantity(memory.into())),
    ]);
    if let Some(n) = gpu {
        requests.insert("nvidia.com/gpu".to_string(), Quantity(n.to_string()));
    }

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(
                TEST_LABEL.to_string(),
                TEST_LABEL_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                command: Some(vec!["sleep".into(), "infinity".into()]),
                resources: Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };

    pods.create(&PostParams::default(), &pod).await?;
    info!(pod = name, cpu, memory, gpu = ?gpu, "created test pod");
    Ok(())
}

pub async fn delete_test_pod(client: Client, name: &str) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::default_namespaced(client);
    pods.delete(name, &DeleteParams::default()).await?;
    info!(pod = name, "deleted test pod");
    Ok(())
}

/// Remove every test pod, node claim and pool-owned node this controller
/// created. Leaves everything else alone.
pub async fn nuke(client: Client) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::default_namespaced(client.clone());
    let lp = ListParams::default().labels(&format!("{TEST_LABEL}={TEST_LABEL_VALUE}"));
    for pod in pods.list(&lp).await? {
        let name = pod.name_any();
        let _ = pods.delete(&name, &DeleteParams::default()).await;
        info!(pod = %name, "deleted");
    }

    let claims: Api<NodeClaim> = Api::all(client.clone());
    for claim in claims.list(&ListParams::default()).await? {
        let name = claim.name_any();
        let _ = claims.delete(&name, &DeleteParams::default()).await;
        info!(claim = %name, "deleted");
    }

    let pools: Api<NodePool> = Api::all(client);
    for pool in pools.list(&ListParams::default()).await? {
        info!(pool = %pool.name_any(), "left in place (delete pools manually)");
    }
    Ok(())
}
