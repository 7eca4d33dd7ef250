//! Kubernetes WithOut Kubelet provider.
//!
//! Backs node claims with kwok-managed Node objects: the kwok controller
//! plays the kubelet for any node carrying its annotation, so launched
//! "instances" register instantly and cost nothing. The catalog is a static
//! price table shaped like a small general-purpose cloud.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus, Taint};
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::{debug, info};

use crate::apis::{NodeClaim, NodePool};
use crate::cloudprovider::types::{
    CreatedInstance, InstanceType, Offering, Overhead, ProviderId,
};
use crate::cloudprovider::CloudProviderError;
use crate::scheduling::labels;
use crate::scheduling::resources::{Resources, CPU, EPHEMERAL_STORAGE, MEMORY, PODS};

const KWOK_NODE_ANNOTATION: &str = "kwok.x-k8s.io/node";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "karpenter";
const PROVIDER_PREFIX: &str = "kwok://";

const ZONES: [&str; 3] = ["z1", "z2", "z3"];
/// Spot discount applied uniformly across the synthetic catalog.
const SPOT_DISCOUNT: f64 = 0.3;

fn resources(cpu_millis: i128, memory_mib: i128, disk_gib: i128, gpus: i128) -> Resources {
    let mut out = Resources::new();
    out.set(CPU, cpu_millis * 1000);
    out.set(MEMORY, memory_mib * 1024 * 1024 * 1000);
    out.set(EPHEMERAL_STORAGE, disk_gib * 1024 * 1024 * 1024 * 1000);
    out.set(PODS, 110 * 1000);
    if gpus > 0 {
        out.set("nvidia.com/gpu", gpus * 1000);
    }
    out
}

fn overhead() -> Overhead {
    let mut kube_reserved = Resources::new();
    kube_reserved.set(CPU, 100);
    kube_reserved.set(MEMORY, 128 * 1024 * 1024 * 1000);
    let mut eviction_threshold = Resources::new();
    eviction_threshold.set(MEMORY, 100 * 1024 * 1024 * 1000);
    Overhead {
        kube_reserved,
        system_reserved: Resources::new(),
        eviction_threshold,
    }
}

fn offerings(on_demand_price: f64) -> Vec<Offering> {
    let mut out = Vec::new();
    for zone in ZONES {
        out.push(Offering {
            zone: zone.to_string(),
            capacity_type: labels::CAPACITY_TYPE_ON_DEMAND.to_string(),
            price_per_hour: on_demand_price,
            available: true,
        });
        out.push(Offering {
            zone: zone.to_string(),
            capacity_type: labels::CAPACITY_TYPE_SPOT.to_string(),
            price_per_hour: on_demand_price * SPOT_DISCOUNT,
            available: true,
        });
    }
    out
}

fn instance(name: &str, arch: &str, cpu: i128, memory_mib: i128, disk_gib: i128, price: f64) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        architecture: arch.to_string(),
        os: "linux".to_string(),
        offerings: offerings(price),
        capacity: resources(cpu, memory_mib, disk_gib, 0),
        overhead: overhead(),
    }
}

fn gpu_instance(name: &str, cpu: i128, memory_mib: i128, disk_gib: i128, gpus: i128, price: f64) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        offerings: offerings(price),
        capacity: resources(cpu, memory_mib, disk_gib, gpus),
        overhead: overhead(),
    }
}

/// The static catalog.                                    $/hr on-demand
pub fn catalog() -> Vec<InstanceType> {
    vec![
        // c – shared x86
        instance("c-2x", "amd64", 2, 4_096, 40, 0.0066),
        instance("c-4x", "amd64", 4, 8_192, 80, 0.0106),
        instance("c-8x", "amd64", 8, 16_384, 160, 0.0170),
        instance("c-16x", "amd64", 16, 32_768, 320, 0.0314),
        // a – ARM (Ampere)
        instance("a-2x", "arm64", 2, 4_096, 40, 0.0074),
        instance("a-4x", "arm64", 4, 8_192, 80, 0.0122),
        instance("a-8x", "arm64", 8, 16_384, 160, 0.0226),
        instance("a-16x", "arm64", 16, 32_768, 320, 0.0443),
        // d – dedicated x86
        instance("d-2x", "amd64", 2, 8_192, 80, 0.0386),
        instance("d-4x", "amd64", 4, 16_384, 160, 0.0475),
        instance("d-8x", "amd64", 8, 32_768, 240, 0.0900),
        instance("d-16x", "amd64", 16, 65_536, 360, 0.1789),
        instance("d-32x", "amd64", 32, 131_072, 600, 0.3568),
        // g – GPU
        gpu_instance("g-1x-a100", 12, 131_072, 200, 1, 2.21),
        gpu_instance("g-4x-a100", 48, 524_288, 800, 4, 8.84),
    ]
}

pub struct KwokProvider {
    client: Client,
}

impl KwokProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn resolve(
        &self,
        claim: &NodeClaim,
    ) -> Result<(InstanceType, String, String), CloudProviderError> {
        let reqs = claim
            .requirements()
            .map_err(|e| CloudProviderError::CreationFailed {
                message: e.to_string(),
            })?;
        let mut best: Option<(InstanceType, String, String, f64)> = None;
        for it in catalog() {
            if !reqs.is_compatible(&it.requirements()) {
                continue;
            }
            for o in it.available_offerings() {
                if !reqs.has(labels::ZONE_LABEL, &o.zone)
                    || !reqs.has(labels::CAPACITY_TYPE_LABEL, &o.capacity_type)
                {
                    continue;
                }
                if best.as_ref().is_none_or(|(_, _, _, p)| o.price_per_hour < *p) {
                    best = Some((
                        it.clone(),
                        o.zone.clone(),
                        o.capacity_type.clone(),
                        o.price_per_hour,
                    ));
                }
            }
        }
        best.map(|(it, zone, ct, _)| (it, zone, ct)).ok_or_else(|| {
            CloudProviderError::CreationFailed {
                message: "no admissible instance type in catalog".to_string(),
            }
        })
    }

    pub async fn create(&self, claim: &NodeClaim) -> Result<CreatedInstance, CloudProviderError> {
        fail::fail_point!("kwok::create", |_| {
            Err(CloudProviderError::CreationFailed {
                message: "failpoint kwok::create".to_string(),
            })
        });

        let (it, zone, capacity_type) = self.resolve(claim)?;
        let name = format!("karpenter-kwok-{}", uuid::Uuid::new_v4());
        let provider_id = ProviderId(format!("{PROVIDER_PREFIX}{name}"));

        let mut node_labels: BTreeMap<String, String> = claim
            .requirements()
            .map(|r| r.labels())
            .unwrap_or_default();
        node_labels.insert(labels::INSTANCE_TYPE_LABEL.into(), it.name.clone());
        node_labels.insert(labels::ARCH_LABEL.into(), it.architecture.clone());
        node_labels.insert(labels::OS_LABEL.into(), it.os.clone());
        node_labels.insert(labels::ZONE_LABEL.into(), zone.clone());
        node_labels.insert(labels::CAPACITY_TYPE_LABEL.into(), capacity_type.clone());
        node_labels.insert(labels::NODE_POOL_LABEL.into(), claim.spec.node_pool.clone());
        node_labels.insert(labels::HOSTNAME_LABEL.into(), name.clone());
        node_labels.insert(MANAGED_BY_LABEL.into(), MANAGED_BY.into());

        let mut taints: Vec<Taint> = vec![labels::unregistered_taint()];
        taints.extend(claim.spec.taints.clone().unwrap_or_default());
        taints.extend(claim.spec.startup_taints.clone().unwrap_or_default());

        let capacity = it.capacity.to_list();
        let allocatable = it.allocatable().to_list();
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(node_labels.clone()),
                annotations: Some(BTreeMap::from([(
                    KWOK_NODE_ANNOTATION.to_string(),
                    "fake".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.0.clone()),
                taints: Some(taints),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: Some(capacity.clone()),
                allocatable: Some(allocatable.clone()),
                ..Default::default()
            }),
        };

        self.nodes()
            .create(&PostParams::default(), &node)
            .await
            .map_err(|e| CloudProviderError::CreationFailed {
                message: e.to_string(),
            })?;
        info!(node = %name, instance_type = %it.name, zone = %zone, capacity_type = %capacity_type, "launched kwok instance");

        Ok(CreatedInstance {
            provider_id,
            instance_type: it.name,
            zone,
            capacity_type,
            image_id: "kwok".to_string(),
            labels: node_labels,
            capacity,
            allocatable,
            created_at: Utc::now(),
        })
    }

    fn node_name(provider_id: &ProviderId) -> Result<&str, CloudProviderError> {
        provider_id
            .0
            .strip_prefix(PROVIDER_PREFIX)
            .ok_or_else(|| CloudProviderError::NotFound(provider_id.clone()))
    }

    fn instance_from_node(node: &Node) -> Option<CreatedInstance> {
        let provider_id = node.spec.as_ref()?.provider_id.clone()?;
        let node_labels = node.metadata.labels.clone().unwrap_or_default();
        let status = node.status.clone().unwrap_or_default();
        Some(CreatedInstance {
            provider_id: ProviderId(provider_id),
            instance_type: node_labels
                .get(labels::INSTANCE_TYPE_LABEL)
                .cloned()
                .unwrap_or_default(),
            zone: node_labels.get(labels::ZONE_LABEL).cloned().unwrap_or_default(),
            capacity_type: node_labels
                .get(labels::CAPACITY_TYPE_LABEL)
                .cloned()
                .unwrap_or_default(),
            image_id: "kwok".to_string(),
            labels: node_labels,
            capacity: status.capacity.unwrap_or_default(),
            allocatable: status.allocatable.unwrap_or_default(),
            created_at: node
                .metadata
                .creation_timestamp
                .as_ref()
                .map(crate::apis::time_to_chrono)
                .unwrap_or_else(Utc::now),
        })
    }

    pub async fn get(
        &self,
        provider_id: &ProviderId,
    ) -> Result<CreatedInstance, CloudProviderError> {
        let name = Self::node_name(provider_id)?;
        match self.nodes().get_opt(name).await {
            Ok(Some(node)) => Self::instance_from_node(&node)
                .ok_or_else(|| CloudProviderError::NotFound(provider_id.clone())),
            Ok(None) => Err(CloudProviderError::NotFound(provider_id.clone())),
            Err(e) => Err(CloudProviderError::Internal(e.into())),
        }
    }

    pub async fn list(&self) -> Result<Vec<CreatedInstance>, CloudProviderError> {
        let lp = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY}"));
        let nodes = self
            .nodes()
            .list(&lp)
            .await
            .map_err(|e| CloudProviderError::Internal(e.into()))?;
        Ok(nodes.iter().filter_map(Self::instance_from_node).collect())
    }

    pub async fn delete(&self, provider_id: &ProviderId) -> Result<(), CloudProviderError> {
        fail::fail_point!("kwok::delete", |_| {
            Err(CloudProviderError::CreationFailed {
                message: "failpoint kwok::delete".to_string(),
            })
        });

        let name = Self::node_name(provider_id)?.to_string();
        match self.nodes().delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(node = %name, "deleted kwok instance");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(CloudProviderError::NotFound(provider_id.clone()))
            }
            Err(e) => Err(CloudProviderError::Internal(e.into())),
        }
    }

    /// Kwok nodes are exactly what was asked for, so drift only comes from
    /// requirement changes on the claim itself, which the drift detector
    /// handles cluster-side.
    pub async fn is_drifted(
        &self,
        _claim: &NodeClaim,
    ) -> Result<Option<String>, CloudProviderError> {
        Ok(None)
    }

    pub async fn instance_types(
        &self,
        _pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        Ok(catalog())
    }
}
