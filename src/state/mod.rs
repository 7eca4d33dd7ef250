//! The cluster state cache.
//!
//! An in-memory, eventually-consistent projection of cluster reality that
//! feeds the scheduler and every other control loop. Three writer families
//! feed it (node, node-claim and pod watch events, plus the secondary
//! object caches); readers take deep-copy snapshots under the same lock.
//! Nothing here persists: the cache is rebuilt from the initial watch lists
//! on process restart, and `synced()` gates scheduling until that has
//! happened.

pub mod node;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::storage::v1::{StorageClass, VolumeAttachment};
use tracing::{debug, warn};

use crate::apis::NodeClaim;
use crate::scheduling::pod::{self, PodKey};
use crate::scheduling::requirements::Requirements;
use crate::scheduling::resources::{self, Resources};
use crate::scheduling::taints;
use crate::state::node::{pod_host_ports, pod_volume_claims, StateNode};

/// Watch sources that must deliver their initial list before scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchSource {
    Nodes,
    NodeClaims,
    Pods,
    DaemonSets,
    PersistentVolumeClaims,
    PersistentVolumes,
    StorageClasses,
    PodDisruptionBudgets,
    VolumeAttachments,
}

pub const REQUIRED_SOURCES: [WatchSource; 9] = [
    WatchSource::Nodes,
    WatchSource::NodeClaims,
    WatchSource::Pods,
    WatchSource::DaemonSets,
    WatchSource::PersistentVolumeClaims,
    WatchSource::PersistentVolumes,
    WatchSource::StorageClasses,
    WatchSource::PodDisruptionBudgets,
    WatchSource::VolumeAttachments,
];

/// Deep-copy view handed to a scheduling pass. The set of nodes is fixed for
/// the duration of the pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<StateNode>,
    /// Synthetic pods the DaemonSet controller would create, one per
    /// template, used to charge daemon overhead to candidate nodes.
    pub daemonset_pods: Vec<Pod>,
    /// Bound, consuming pods with the labels of the node they sit on, for
    /// topology skew counting.
    pub pods_with_node_labels: Vec<(Pod, BTreeMap<String, String>)>,
    pub pvcs: HashMap<String, PersistentVolumeClaim>,
    pub pvs: HashMap<String, PersistentVolume>,
    pub storage_classes: HashMap<String, StorageClass>,
}

impl ClusterSnapshot {
    /// Daemon overhead a brand-new node with the given labels/taints would
    /// carry: every daemon template that tolerates the taints and matches
    /// the labels contributes its request.
    pub fn daemon_overhead(
        &self,
        node_requirements: &Requirements,
        node_taints: &[k8s_openapi::api::core::v1::Taint],
    ) -> Resources {
        let mut out = Resources::new();
        for pod in &self.daemonset_pods {
            if taints::check_all(pod, node_taints).is_err() {
                continue;
            }
            let Ok(reqs) = Requirements::try_from_pod(pod) else {
                continue;
            };
            if !reqs.is_compatible(node_requirements) {
                continue;
            }
            if let Ok(requests) = resources::pod_requests(pod) {
                out.add(&requests);
            }
        }
        out
    }
}

#[derive(Default)]
struct Inner {
    /// Primary index: provider ID (or a claim-name sentinel before launch).
    nodes: HashMap<String, StateNode>,
    /// Secondary index: node name → primary key.
    node_names: HashMap<String, String>,
    /// Pod → primary key of the node it is charged to.
    bindings: HashMap<PodKey, String>,
    /// Scheduled pods whose node has not been observed yet.
    pending_bindings: HashMap<PodKey, (String, Pod)>,
    /// Bound, consuming pods kept whole for topology counting.
    pods: HashMap<PodKey, Pod>,
    daemonsets: HashMap<String, Pod>,
    pvcs: HashMap<String, PersistentVolumeClaim>,
    pvs: HashMap<String, PersistentVolume>,
    storage_classes: HashMap<String, StorageClass>,
    pdbs: HashMap<String, PodDisruptionBudget>,
    volume_attachments: HashMap<String, VolumeAttachment>,
    synced: HashSet<WatchSource>,
}

impl Inner {
    fn key_for_node(node: &Node) -> String {
        match node.spec.as_ref().and_then(|s| s.provider_id.clone()) {
            Some(id) if !id.is_empty() => id,
            _ => format!(
                "node://{}",
                node.metadata.name.as_deref().unwrap_or_default()
            ),
        }
    }

    fn key_for_claim(claim: &NodeClaim) -> String {
        match claim.provider_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!(
                "nodeclaim://{}",
                claim.metadata.name.as_deref().unwrap_or_default()
            ),
        }
    }

    fn bind_pod_to(&mut self, key: &str, pod: &Pod) {
        let pod_key = PodKey::from_pod(pod);
        let Some(state_node) = self.nodes.get_mut(key) else {
            return;
        };
        let requests = resources::pod_requests(pod).unwrap_or_default();
        let limits = resources::pod_limits(pod).unwrap_or_default();
        state_node.add_pod(
            pod_key.clone(),
            requests,
            limits,
            pod_host_ports(pod),
            pod_volume_claims(pod),
        );
        self.bindings.insert(pod_key, key.to_string());
    }

    fn unbind_pod(&mut self, pod_key: &PodKey) {
        if let Some(key) = self.bindings.remove(pod_key)
            && let Some(state_node) = self.nodes.get_mut(&key)
        {
            state_node.remove_pod(pod_key);
        }
        self.pending_bindings.remove(pod_key);
    }

    fn recompute_daemon_overhead(&mut self, key: &str) {
        let Some(state_node) = self.nodes.get(key) else {
            return;
        };
        let node_requirements = state_node.requirements();
        let node_taints = state_node.scheduling_taints();
        let mut requests = Resources::new();
        let mut limits = Resources::new();
        for template in self.daemonsets.values() {
            if taints::check_all(template, &node_taints).is_err() {
                continue;
            }
            let Ok(reqs) = Requirements::try_from_pod(template) else {
                continue;
            };
            if !reqs.is_compatible(&node_requirements) {
                continue;
            }
            if let Ok(r) = resources::pod_requests(template) {
                requests.add(&r);
            }
            if let Ok(l) = resources::pod_limits(template) {
                limits.add(&l);
            }
        }
        if let Some(state_node) = self.nodes.get_mut(key) {
            state_node.set_daemon_overhead(requests, limits);
        }
    }

    fn recompute_all_daemon_overheads(&mut self) {
        let keys: Vec<String> = self.nodes.keys().cloned().collect();
        for key in keys {
            self.recompute_daemon_overhead(&key);
        }
    }

    /// Move an entry (with all its counters) to a new primary key, used when
    /// a claim gains its provider ID or a node pairs with a claim.
    fn migrate(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let Some(mut moving) = self.nodes.remove(from) else {
            return;
        };
        match self.nodes.remove(to) {
            Some(mut existing) => {
                // The node side owns pod counters; keep whichever entry has
                // them and fill in the missing object pointer.
                if existing.node.is_none() {
                    existing.node = moving.node.take();
                }
                if existing.node_claim.is_none() {
                    existing.node_claim = moving.node_claim.take();
                }
                self.nodes.insert(to.to_string(), existing);
            }
            None => {
                self.nodes.insert(to.to_string(), moving);
            }
        }
        for key in self.bindings.values_mut() {
            if key == from {
                *key = to.to_string();
            }
        }
        for key in self.node_names.values_mut() {
            if key == from {
                *key = to.to_string();
            }
        }
    }
}

/// Process-wide cache. Mutations happen only through the update/delete
/// methods below, serialized by one RwLock.
#[derive(Default)]
pub struct ClusterState {
    inner: RwLock<Inner>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sync tracking ────────────────────────────────────────────────

    pub fn mark_synced(&self, source: WatchSource) {
        self.inner.write().unwrap().synced.insert(source);
    }

    /// True only after every watch source has delivered its initial list.
    /// The provisioner must not schedule before this.
    pub fn synced(&self) -> bool {
        let inner = self.inner.read().unwrap();
        REQUIRED_SOURCES.iter().all(|s| inner.synced.contains(s))
    }

    // ── Node writers ─────────────────────────────────────────────────

    pub fn update_node(&self, node: Node) {
        let mut inner = self.inner.write().unwrap();
        let key = Inner::key_for_node(&node);
        let name = node.metadata.name.clone().unwrap_or_default();

        // A node previously tracked under a name-only key may now carry a
        // provider ID.
        if let Some(old_key) = inner.node_names.get(&name).cloned()
            && old_key != key
        {
            inner.migrate(&old_key, &key);
        }
        // Pair with a claim-only entry that already knows this provider ID.
        if let Some(claim_key) = inner
            .nodes
            .iter()
            .find(|(k, v)| {
                k.as_str() != key && v.node.is_none() && v.provider_id() == Some(key.as_str())
            })
            .map(|(k, _)| k.clone())
        {
            inner.migrate(&claim_key, &key);
        }

        match inner.nodes.get_mut(&key) {
            Some(existing) => existing.node = Some(node),
            None => {
                inner.nodes.insert(key.clone(), StateNode::from_node(node));
            }
        }
        inner.node_names.insert(name.clone(), key.clone());

        let pending: Vec<(PodKey, Pod)> = inner
            .pending_bindings
            .iter()
            .filter(|(_, (node_name, _))| *node_name == name)
            .map(|(k, (_, pod))| (k.clone(), pod.clone()))
            .collect();
        for (pod_key, pod) in pending {
            inner.pending_bindings.remove(&pod_key);
            inner.bind_pod_to(&key, &pod);
        }

        inner.recompute_daemon_overhead(&key);
    }

    pub fn delete_node(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        let Some(key) = inner.node_names.remove(name) else {
            return;
        };
        let remove_entry = match inner.nodes.get_mut(&key) {
            Some(entry) => {
                entry.node = None;
                entry.node_claim.is_none()
            }
            None => false,
        };
        if remove_entry {
            inner.nodes.remove(&key);
            let orphaned: Vec<PodKey> = inner
                .bindings
                .iter()
                .filter(|(_, k)| **k == key)
                .map(|(p, _)| p.clone())
                .collect();
            for pod_key in orphaned {
                inner.bindings.remove(&pod_key);
            }
        }
    }

    // ── NodeClaim writers ────────────────────────────────────────────

    /// Also called directly by the provisioner for freshly created claims,
    /// so a scheduling pass that just launched capacity sees it before the
    /// watch stream catches up.
    pub fn update_node_claim(&self, claim: NodeClaim) {
        let mut inner = self.inner.write().unwrap();
        let key = Inner::key_for_claim(&claim);
        let name = claim.metadata.name.clone().unwrap_or_default();
        let sentinel = format!("nodeclaim://{name}");

        // Claim graduated from sentinel key to a real provider ID.
        if key != sentinel && inner.nodes.contains_key(&sentinel) {
            inner.migrate(&sentinel, &key);
        }

        match inner.nodes.get_mut(&key) {
            Some(existing) => existing.node_claim = Some(claim),
            None => {
                inner
                    .nodes
                    .insert(key.clone(), StateNode::from_claim(claim));
            }
        }
        inner.recompute_daemon_overhead(&key);
    }

    pub fn delete_node_claim(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        let keys: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, v)| v.claim_name() == Some(name))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            let remove_entry = match inner.nodes.get_mut(&key) {
                Some(entry) => {
                    entry.node_claim = None;
                    entry.node.is_none()
                }
                None => false,
            };
            if remove_entry {
                inner.nodes.remove(&key);
            }
        }
    }

    // ── Pod writers ──────────────────────────────────────────────────

    pub fn update_pod(&self, pod: Pod) {
        let mut inner = self.inner.write().unwrap();
        let pod_key = PodKey::from_pod(&pod);
        let now = Utc::now();

        // Rebinding and terminal transitions both start from a clean slate;
        // unbinding is idempotent.
        inner.unbind_pod(&pod_key);
        inner.pods.remove(&pod_key);

        if !pod::is_consuming(&pod, now) {
            return;
        }
        let Some(node_name) = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty())
        else {
            return;
        };

        inner.pods.insert(pod_key.clone(), pod.clone());
        match inner.node_names.get(&node_name).cloned() {
            Some(key) => inner.bind_pod_to(&key, &pod),
            None => {
                debug!(pod = %pod_key, node = %node_name, "pod bound to unobserved node");
                inner.pending_bindings.insert(pod_key, (node_name, pod));
            }
        }
    }

    pub fn delete_pod(&self, pod_key: &PodKey) {
        let mut inner = self.inner.write().unwrap();
        inner.unbind_pod(pod_key);
        inner.pods.remove(pod_key);
    }

    // ── Secondary object caches ──────────────────────────────────────

    pub fn update_daemonset(&self, ds: DaemonSet) {
        let mut inner = self.inner.write().unwrap();
        let name = format!(
            "{}/{}",
            ds.metadata.namespace.as_deref().unwrap_or_default(),
            ds.metadata.name.as_deref().unwrap_or_default()
        );
        let Some(spec) = ds.spec else {
            return;
        };
        // Canonical pod the DaemonSet controller would instantiate.
        let template_pod = Pod {
            metadata: spec.template.metadata.clone().unwrap_or_default(),
            spec: spec.template.spec.clone(),
            status: None,
        };
        inner.daemonsets.insert(name, template_pod);
        inner.recompute_all_daemon_overheads();
    }

    pub fn delete_daemonset(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.daemonsets.remove(&format!("{namespace}/{name}"));
        inner.recompute_all_daemon_overheads();
    }

    pub fn update_pvc(&self, pvc: PersistentVolumeClaim) {
        let key = format!(
            "{}/{}",
            pvc.metadata.namespace.as_deref().unwrap_or_default(),
            pvc.metadata.name.as_deref().unwrap_or_default()
        );
        self.inner.write().unwrap().pvcs.insert(key, pvc);
    }

    pub fn delete_pvc(&self, namespace: &str, name: &str) {
        self.inner
            .write()
            .unwrap()
            .pvcs
            .remove(&format!("{namespace}/{name}"));
    }

    pub fn update_pv(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.inner.write().unwrap().pvs.insert(name, pv);
    }

    pub fn delete_pv(&self, name: &str) {
        self.inner.write().unwrap().pvs.remove(name);
    }

    pub fn update_storage_class(&self, sc: StorageClass) {
        let name = sc.metadata.name.clone().unwrap_or_default();
        self.inner.write().unwrap().storage_classes.insert(name, sc);
    }

    pub fn delete_storage_class(&self, name: &str) {
        self.inner.write().unwrap().storage_classes.remove(name);
    }

    pub fn update_pdb(&self, pdb: PodDisruptionBudget) {
        let key = format!(
            "{}/{}",
            pdb.metadata.namespace.as_deref().unwrap_or_default(),
            pdb.metadata.name.as_deref().unwrap_or_default()
        );
        self.inner.write().unwrap().pdbs.insert(key, pdb);
    }

    pub fn delete_pdb(&self, namespace: &str, name: &str) {
        self.inner
            .write()
            .unwrap()
            .pdbs
            .remove(&format!("{namespace}/{name}"));
    }

    pub fn update_volume_attachment(&self, va: VolumeAttachment) {
        let name = va.metadata.name.clone().unwrap_or_default();
        self.inner
            .write()
            .unwrap()
            .volume_attachments
            .insert(name, va);
    }

    pub fn delete_volume_attachment(&self, name: &str) {
        self.inner.write().unwrap().volume_attachments.remove(name);
    }

    // ── Readers ──────────────────────────────────────────────────────

    /// Deep-copy snapshot for a scheduling pass.
    pub fn snapshot(&self) -> ClusterSnapshot {
        let inner = self.inner.read().unwrap();
        if !inner.pending_bindings.is_empty() {
            warn!(
                count = inner.pending_bindings.len(),
                "snapshot taken with pods bound to unobserved nodes"
            );
        }
        let pods_with_node_labels = inner
            .pods
            .iter()
            .filter_map(|(pod_key, pod)| {
                let key = inner.bindings.get(pod_key)?;
                let labels = inner.nodes.get(key)?.labels();
                Some((pod.clone(), labels))
            })
            .collect();
        ClusterSnapshot {
            nodes: inner.nodes.values().cloned().collect(),
            daemonset_pods: inner.daemonsets.values().cloned().collect(),
            pods_with_node_labels,
            pvcs: inner.pvcs.clone(),
            pvs: inner.pvs.clone(),
            storage_classes: inner.storage_classes.clone(),
        }
    }

    pub fn node_by_provider_id(&self, provider_id: &str) -> Option<StateNode> {
        self.inner.read().unwrap().nodes.get(provider_id).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<StateNode> {
        let inner = self.inner.read().unwrap();
        let key = inner.node_names.get(name)?;
        inner.nodes.get(key).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn bound_pod_count(&self) -> usize {
        self.inner.read().unwrap().bindings.len()
    }

    /// Pods currently charged to a node, whole, for the drain planner.
    pub fn pods_on_node(&self, node_name: &str) -> Vec<Pod> {
        let inner = self.inner.read().unwrap();
        let Some(key) = inner.node_names.get(node_name) else {
            return Vec::new();
        };
        inner
            .bindings
            .iter()
            .filter(|(_, k)| *k == key)
            .filter_map(|(pod_key, _)| inner.pods.get(pod_key).cloned())
            .collect()
    }

    /// Disruption budgets in the pod's namespace whose selector matches it.
    pub fn pdbs_matching(&self, p: &Pod) -> Vec<PodDisruptionBudget> {
        let inner = self.inner.read().unwrap();
        let namespace = p.metadata.namespace.as_deref().unwrap_or("default");
        let labels = p.metadata.labels.clone().unwrap_or_default();
        inner
            .pdbs
            .values()
            .filter(|pdb| pdb.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pdb| {
                pdb.spec
                    .as_ref()
                    .and_then(|s| s.selector.as_ref())
                    .is_some_and(|selector| {
                        crate::scheduling::topology::selector_matches(selector, &labels)
                    })
            })
            .cloned()
            .collect()
    }

    /// Number of volume attachments still bound to the given node, for the
    /// drain wait.
    pub fn volume_attachments_on(&self, node_name: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .volume_attachments
            .values()
            .filter(|va| va.spec.node_name == node_name)
            .count()
    }

    /// Capacity currently provisioned under a pool, for pool limit checks.
    pub fn pool_usage(&self, pool: &str) -> Resources {
        let inner = self.inner.read().unwrap();
        let mut out = Resources::new();
        for state_node in inner.nodes.values() {
            let owned = state_node
                .node_claim
                .as_ref()
                .map(|c| c.spec.node_pool == pool)
                .unwrap_or_else(|| {
                    state_node.labels().get(crate::scheduling::labels::NODE_POOL_LABEL)
                        == Some(&pool.to_string())
                });
            if !owned {
                continue;
            }
            if let Some(claim) = &state_node.node_claim
                && let Some(status) = &claim.status
                && let Ok(capacity) = Resources::from_list(&status.capacity)
            {
                out.add(&capacity);
            }
        }
        out
    }
}
