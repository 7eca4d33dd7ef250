//! StateNode: the cache's view of one machine.
//!
//! A StateNode pairs a Node with its NodeClaim by provider ID. Either side
//! may be absent transiently: a freshly launched claim has no node yet, and
//! a node adopted from a previous process run may precede its claim in the
//! watch stream. A StateNode exists iff at least one side is known.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::core::v1::{Node, Pod, Taint};

use crate::apis::NodeClaim;
use crate::scheduling::labels;
use crate::scheduling::pod::PodKey;
use crate::scheduling::requirements::Requirements;
use crate::scheduling::resources::Resources;

const UNSPECIFIED_IP: &str = "0.0.0.0";

/// One reserved (ip, port, protocol) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub ip: String,
    pub port: i32,
    pub protocol: String,
}

impl HostPort {
    /// Two host ports collide when port and protocol match and either IP is
    /// the unspecified address or they are equal. Symmetric by
    /// construction.
    pub fn conflicts(&self, other: &HostPort) -> bool {
        self.port == other.port
            && self.protocol == other.protocol
            && (self.ip == UNSPECIFIED_IP || other.ip == UNSPECIFIED_IP || self.ip == other.ip)
    }
}

/// Host ports a pod reserves across all of its containers.
pub fn pod_host_ports(pod: &Pod) -> Vec<HostPort> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for container in spec
        .containers
        .iter()
        .chain(spec.init_containers.as_deref().unwrap_or_default())
    {
        for port in container.ports.as_deref().unwrap_or_default() {
            if let Some(host_port) = port.host_port {
                out.push(HostPort {
                    ip: port
                        .host_ip
                        .clone()
                        .unwrap_or_else(|| UNSPECIFIED_IP.to_string()),
                    port: host_port,
                    protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                });
            }
        }
    }
    out
}

/// `namespace/name` keys of the PVCs a pod mounts.
pub fn pod_volume_claims(pod: &Pod) -> BTreeSet<String> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|pvc| format!("{namespace}/{}", pvc.claim_name))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct StateNode {
    pub node: Option<Node>,
    pub node_claim: Option<NodeClaim>,
    pod_requests: HashMap<PodKey, Resources>,
    pod_limits: HashMap<PodKey, Resources>,
    daemon_requests: Resources,
    daemon_limits: Resources,
    host_ports: HashMap<PodKey, Vec<HostPort>>,
    volumes: HashMap<PodKey, BTreeSet<String>>,
}

impl StateNode {
    pub fn from_node(node: Node) -> Self {
        Self {
            node: Some(node),
            ..Default::default()
        }
    }

    pub fn from_claim(claim: NodeClaim) -> Self {
        Self {
            node_claim: Some(claim),
            ..Default::default()
        }
    }

    pub fn provider_id(&self) -> Option<&str> {
        if let Some(node) = &self.node
            && let Some(id) = node.spec.as_ref().and_then(|s| s.provider_id.as_deref())
        {
            return Some(id);
        }
        self.node_claim.as_ref().and_then(|c| c.provider_id())
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node.as_ref().and_then(|n| n.metadata.name.as_deref())
    }

    pub fn claim_name(&self) -> Option<&str> {
        self.node_claim
            .as_ref()
            .and_then(|c| c.metadata.name.as_deref())
    }

    /// Resolved labels. The node wins once registered; before that, the
    /// labels the launch wrote onto the claim stand in.
    pub fn labels(&self) -> BTreeMap<String, String> {
        if let Some(node) = &self.node {
            return node.metadata.labels.clone().unwrap_or_default();
        }
        self.node_claim
            .as_ref()
            .and_then(|c| c.metadata.labels.clone())
            .unwrap_or_default()
    }

    pub fn requirements(&self) -> Requirements {
        Requirements::from_labels(&self.labels())
    }

    pub fn taints(&self) -> Vec<Taint> {
        if let Some(node) = &self.node {
            return node
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default();
        }
        let Some(claim) = &self.node_claim else {
            return Vec::new();
        };
        let mut out = vec![labels::unregistered_taint()];
        out.extend(claim.spec.taints.clone().unwrap_or_default());
        out.extend(claim.spec.startup_taints.clone().unwrap_or_default());
        out
    }

    /// Taints that pods being simulated onto this node must tolerate. The
    /// startup taint is the controller's own and is lifted at registration,
    /// so placement looks through it.
    pub fn scheduling_taints(&self) -> Vec<Taint> {
        self.taints()
            .into_iter()
            .filter(|t| t.key != labels::UNREGISTERED_TAINT_KEY)
            .collect()
    }

    pub fn allocatable(&self) -> Resources {
        let list = if let Some(node) = &self.node {
            node.status.as_ref().and_then(|s| s.allocatable.clone())
        } else {
            self.node_claim
                .as_ref()
                .and_then(|c| c.status.as_ref())
                .map(|s| s.allocatable.clone())
        };
        list.map(|l| Resources::from_list(&l).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Capacity still open for new pods.
    pub fn available(&self) -> Resources {
        let mut out = self.allocatable();
        out.sub_saturating(&self.daemon_requests);
        for requests in self.pod_requests.values() {
            out.sub_saturating(requests);
        }
        out
    }

    pub fn pod_request_total(&self) -> Resources {
        let mut out = Resources::new();
        for requests in self.pod_requests.values() {
            out.add(requests);
        }
        out
    }

    pub fn pod_limit_total(&self) -> Resources {
        let mut out = Resources::new();
        for limits in self.pod_limits.values() {
            out.add(limits);
        }
        out
    }

    pub fn daemon_requests(&self) -> &Resources {
        &self.daemon_requests
    }

    pub fn daemon_limits(&self) -> &Resources {
        &self.daemon_limits
    }

    pub fn set_daemon_overhead(&mut self, requests: Resources, limits: Resources) {
        self.daemon_requests = requests;
        self.daemon_limits = limits;
    }

    pub fn pod_keys(&self) -> impl Iterator<Item = &PodKey> {
        self.pod_requests.keys()
    }

    pub fn pod_count(&self) -> usize {
        self.pod_requests.len()
    }

    /// Track a bound pod. Re-adding the same pod replaces its previous
    /// contribution, so informer re-deliveries don't double count.
    pub fn add_pod(
        &mut self,
        key: PodKey,
        requests: Resources,
        limits: Resources,
        host_ports: Vec<HostPort>,
        volumes: BTreeSet<String>,
    ) {
        self.remove_pod(&key);
        self.pod_requests.insert(key.clone(), requests);
        self.pod_limits.insert(key.clone(), limits);
        if !host_ports.is_empty() {
            self.host_ports.insert(key.clone(), host_ports);
        }
        if !volumes.is_empty() {
            self.volumes.insert(key, volumes);
        }
    }

    /// Idempotent: removing an unknown pod is a no-op.
    pub fn remove_pod(&mut self, key: &PodKey) {
        self.pod_requests.remove(key);
        self.pod_limits.remove(key);
        self.host_ports.remove(key);
        self.volumes.remove(key);
    }

    pub fn has_host_port_conflict(&self, candidate: &[HostPort]) -> bool {
        self.host_ports
            .values()
            .flatten()
            .any(|reserved| candidate.iter().any(|c| reserved.conflicts(c)))
    }

    /// A PVC can be mounted by one node at a time for exclusive volumes; the
    /// scheduler treats any reuse across nodes as a conflict.
    pub fn has_volume(&self, claim_key: &str) -> bool {
        self.volumes.values().any(|set| set.contains(claim_key))
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.values().map(BTreeSet::len).sum()
    }

    /// All PVC keys currently mounted by pods on this node.
    pub fn volume_claims(&self) -> BTreeSet<String> {
        self.volumes.values().flatten().cloned().collect()
    }

    /// Excluded from new placements: already deleting, or tainted for
    /// disruption. Pods stay tracked until they actually terminate.
    pub fn marked_for_deletion(&self) -> bool {
        let node_deleting = self
            .node
            .as_ref()
            .is_some_and(|n| n.metadata.deletion_timestamp.is_some());
        let claim_deleting = self
            .node_claim
            .as_ref()
            .is_some_and(|c| c.metadata.deletion_timestamp.is_some());
        node_deleting || claim_deleting || labels::has_disrupted_taint(&self.taints())
    }

    pub fn is_registered(&self) -> bool {
        self.labels().get(labels::REGISTERED_LABEL).map(String::as_str) == Some("true")
            || self
                .node_claim
                .as_ref()
                .is_some_and(|c| c.is_registered())
    }

    pub fn is_initialized(&self) -> bool {
        self.labels()
            .get(labels::INITIALIZED_LABEL)
            .map(String::as_str)
            == Some("true")
            || self
                .node_claim
                .as_ref()
                .is_some_and(|c| c.is_initialized())
    }
}
