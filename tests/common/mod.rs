#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, Pod, PodCondition, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use karpenter::apis::nodepool::{Disruption, NodeClaimTemplate, NodePoolSpec};
use karpenter::apis::NodePool;
use karpenter::cloudprovider::types::{InstanceType, Offering, Overhead};
use karpenter::scheduling::labels;
use karpenter::scheduling::resources::{Resources, CPU, MEMORY, PODS};

pub const ZONES: [&str; 3] = ["z1", "z2", "z3"];

pub fn pending_pod(name: &str, cpu: &str, memory: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity(cpu.into())),
                        ("memory".to_string(), Quantity(memory.into())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".into()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".into(),
                status: "False".into(),
                reason: Some("Unschedulable".into()),
                message: Some("insufficient resources".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn gpu_pod(name: &str, gpus: u32) -> Pod {
    let mut pod = pending_pod(name, "1", "1Gi");
    pod.spec.as_mut().unwrap().containers[0]
        .resources
        .as_mut()
        .unwrap()
        .requests
        .as_mut()
        .unwrap()
        .insert("nvidia.com/gpu".to_string(), Quantity(gpus.to_string()));
    pod
}

fn capacity(cpu_millis: i128, memory_mib: i128) -> Resources {
    let mut out = Resources::new();
    out.set(CPU, cpu_millis * 1000);
    out.set(MEMORY, memory_mib * 1024 * 1024 * 1000);
    out.set(PODS, 110 * 1000);
    out
}

/// An instance type offered on-demand and spot in every test zone. Spot is
/// priced at 30% of on-demand, matching the synthetic catalog.
pub fn instance_type(name: &str, cpu: i128, memory_mib: i128, price: f64) -> InstanceType {
    let mut offerings = Vec::new();
    for zone in ZONES {
        offerings.push(Offering {
            zone: zone.to_string(),
            capacity_type: labels::CAPACITY_TYPE_ON_DEMAND.to_string(),
            price_per_hour: price,
            available: true,
        });
        offerings.push(Offering {
            zone: zone.to_string(),
            capacity_type: labels::CAPACITY_TYPE_SPOT.to_string(),
            price_per_hour: price * 0.3,
            available: true,
        });
    }
    let mut kube_reserved = Resources::new();
    kube_reserved.set(CPU, 100);
    kube_reserved.set(MEMORY, 128 * 1024 * 1024 * 1000);
    InstanceType {
        name: name.to_string(),
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        offerings,
        capacity: capacity(cpu, memory_mib),
        overhead: Overhead {
            kube_reserved,
            ..Default::default()
        },
    }
}

pub fn gpu_instance_type(name: &str, cpu: i128, memory_mib: i128, gpus: i128, price: f64) -> InstanceType {
    let mut it = instance_type(name, cpu, memory_mib, price);
    it.capacity.set("nvidia.com/gpu", gpus * 1000);
    it
}

pub fn nodepool(name: &str, weight: Option<i32>) -> NodePool {
    NodePool::new(
        name,
        NodePoolSpec {
            weight,
            limits: None,
            template: NodeClaimTemplate::default(),
            disruption: Disruption::default(),
        },
    )
}
