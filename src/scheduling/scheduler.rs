//! The scheduling core.
//!
//! Given a batch of pending pods and per-pool instance-type catalogs, decide
//! which pods land on existing capacity and what new capacity to launch.
//! Placement is First-Fit-Decreasing with cost-guided tie-breaks: pods are
//! processed largest first, existing nodes are tried before new ones, and
//! candidate nodes keep every instance type that still fits so the cloud
//! provider can pick the cheapest available offering at launch time.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Pod, Taint};
use thiserror::Error;
use tracing::{debug, info};

use crate::apis::nodeclaim::{requirement_specs_from, NodeClaimSpec};
use crate::apis::NodePool;
use crate::cloudprovider::types::InstanceType;
use crate::scheduling::labels;
use crate::scheduling::pod::PodKey;
use crate::scheduling::requirements::{Requirement, Requirements};
use crate::scheduling::resources::{self, Resources};
use crate::scheduling::taints;
use crate::scheduling::topology::Topology;
use crate::scheduling::volume::{pod_volume_requirements, VolumeError};
use crate::state::node::{pod_host_ports, pod_volume_claims, HostPort, StateNode};
use crate::state::ClusterSnapshot;

/// Upper bound on the instance types persisted per claim, so the cloud
/// provider receives a bounded selection.
pub const MAX_INSTANCE_TYPES: usize = 60;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulingError {
    #[error("no compatible instance types: {0}")]
    NoCompatibleInstanceTypes(String),

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    #[error("volume topology conflict: {0}")]
    VolumeTopologyConflict(String),

    #[error("unknown or restricted label {0}")]
    UnknownLabel(String),

    #[error("pod is marked do-not-disrupt")]
    DoNotDisrupt,

    #[error("pod spec is invalid: {0}")]
    InvalidPod(String),
}

impl SchedulingError {
    /// Specificity rank used when several pools fail for different reasons;
    /// the most actionable reason wins.
    fn rank(&self) -> u8 {
        match self {
            Self::InvalidPod(_) => 6,
            Self::UnknownLabel(_) => 5,
            Self::VolumeTopologyConflict(_) => 4,
            Self::TopologyConflict(_) => 3,
            Self::InsufficientCapacity(_) => 2,
            Self::NoCompatibleInstanceTypes(_) => 1,
            Self::DoNotDisrupt => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_instance_types: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_instance_types: MAX_INSTANCE_TYPES,
        }
    }
}

/// A new node the scheduler decided to request, with every instance type
/// that can satisfy its pods.
#[derive(Debug, Clone)]
pub struct NodeClaimDraft {
    pub pool: String,
    pub requirements: Requirements,
    pub instance_types: Vec<InstanceType>,
    pub pods: Vec<PodKey>,
    /// Pod requests plus daemon overhead.
    pub requests: Resources,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub labels: BTreeMap<String, String>,
    pub hostname: String,
}

impl NodeClaimDraft {
    pub fn to_spec(&self) -> NodeClaimSpec {
        NodeClaimSpec {
            node_pool: self.pool.clone(),
            requirements: requirement_specs_from(&self.requirements),
            resources: self.requests.to_list(),
            taints: (!self.taints.is_empty()).then(|| self.taints.clone()),
            startup_taints: (!self.startup_taints.is_empty())
                .then(|| self.startup_taints.clone()),
            termination_grace_period_seconds: None,
            expire_after_seconds: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SchedulingResults {
    /// Pods placed on existing nodes, by node name.
    pub bindings: Vec<(PodKey, String)>,
    /// Pods absorbed by in-flight node claims that have no node yet, by
    /// claim name. Nothing to bind; they wait for the node to register.
    pub nominations: Vec<(PodKey, String)>,
    pub new_node_claims: Vec<NodeClaimDraft>,
    pub errors: BTreeMap<PodKey, SchedulingError>,
}

struct PreparedPod {
    pod: Pod,
    key: PodKey,
    requests: Resources,
    /// Requirements without preferred node affinity.
    required: Requirements,
    /// Requirements including the heaviest preferred alternative; dropped
    /// on relaxation.
    with_preferred: Requirements,
    use_preferred: bool,
}

impl PreparedPod {
    fn requirements(&self) -> &Requirements {
        if self.use_preferred {
            &self.with_preferred
        } else {
            &self.required
        }
    }

    /// Drop the preferred node-affinity term. Returns false when already
    /// running on required terms only.
    fn relax(&mut self) -> bool {
        if self.use_preferred && self.with_preferred != self.required {
            self.use_preferred = false;
            true
        } else {
            false
        }
    }
}

struct ExistingNode {
    /// Node name, or the claim name for launched-but-unregistered capacity.
    name: String,
    is_node: bool,
    requirements: Requirements,
    scheduling_taints: Vec<Taint>,
    available: Resources,
    host_ports: Vec<HostPort>,
    state: StateNode,
}

impl ExistingNode {
    fn from_state(state: &StateNode) -> Option<Self> {
        if state.marked_for_deletion() {
            return None;
        }
        let (name, is_node) = match state.node_name() {
            Some(n) => (n.to_string(), true),
            None => (state.claim_name()?.to_string(), false),
        };
        Some(Self {
            name,
            is_node,
            requirements: state.requirements(),
            scheduling_taints: state.scheduling_taints(),
            available: state.available(),
            host_ports: Vec::new(),
            state: state.clone(),
        })
    }

    fn try_add(
        &mut self,
        prepared: &PreparedPod,
        topology: &mut Topology,
        volume_locations: &mut BTreeMap<String, String>,
    ) -> bool {
        if prepared
            .requirements()
            .compatible(&self.requirements)
            .is_err()
        {
            return false;
        }
        if taints::check_all(&prepared.pod, &self.scheduling_taints).is_err() {
            return false;
        }
        if !prepared.requests.fits(&self.available) {
            return false;
        }
        let ports = pod_host_ports(&prepared.pod);
        if self.state.has_host_port_conflict(&ports)
            || self
                .host_ports
                .iter()
                .any(|reserved| ports.iter().any(|p| reserved.conflicts(p)))
        {
            return false;
        }
        // Exclusive volumes: a claim mounted elsewhere pins the pod there.
        let claims = pod_volume_claims(&prepared.pod);
        if claims
            .iter()
            .any(|c| volume_locations.get(c).is_some_and(|owner| owner != &self.name))
        {
            return false;
        }
        let Ok(combined) = prepared.requirements().intersect(&self.requirements) else {
            return false;
        };
        let Ok(topo) = topology.add_requirements(&prepared.pod, &combined) else {
            return false;
        };
        if !topo.is_compatible(&self.requirements) {
            return false;
        }

        let Ok(placed) = combined.intersect(&topo) else {
            return false;
        };
        topology.record(&prepared.pod, &placed);
        self.available.sub_saturating(&prepared.requests);
        self.host_ports.extend(ports);
        for claim in claims {
            volume_locations.insert(claim, self.name.clone());
        }
        true
    }
}

struct Candidate {
    pool: String,
    pool_labels: BTreeMap<String, String>,
    pool_taints: Vec<Taint>,
    startup_taints: Vec<Taint>,
    requirements: Requirements,
    instance_types: Vec<InstanceType>,
    daemon_overhead: Resources,
    requests: Resources,
    pods: Vec<PodKey>,
    host_ports: Vec<HostPort>,
    hostname: String,
}

impl Candidate {
    /// Keep only instance types that remain compatible with the node's
    /// requirements, still have an admissible offering, and whose
    /// allocatable fits the accumulated requests. Guarantees the final
    /// claim fits on every remaining type.
    fn admissible_types(
        types: &[InstanceType],
        requirements: &Requirements,
        total_requests: &Resources,
    ) -> (Vec<InstanceType>, bool) {
        let mut compatible_seen = false;
        let mut out = Vec::new();
        for it in types {
            if !requirements.is_compatible(&it.requirements()) {
                continue;
            }
            if !it.has_admissible_offering(requirements) {
                continue;
            }
            compatible_seen = true;
            if total_requests.fits(&it.allocatable()) {
                out.push(it.clone());
            }
        }
        (out, compatible_seen)
    }

    fn check_min_values(
        requirements: &Requirements,
        instance_types: &[InstanceType],
    ) -> Result<(), SchedulingError> {
        for (key, needed) in requirements.min_values() {
            let available = if key == labels::INSTANCE_TYPE_LABEL {
                Some(instance_types.len())
            } else {
                requirements.get(key).and_then(|r| r.value_count())
            };
            if let Some(count) = available
                && count < needed
            {
                return Err(SchedulingError::NoCompatibleInstanceTypes(format!(
                    "{key} requires at least {needed} values, {count} remain"
                )));
            }
        }
        Ok(())
    }

    fn try_add(
        &mut self,
        prepared: &PreparedPod,
        topology: &mut Topology,
        volume_locations: &mut BTreeMap<String, String>,
    ) -> Result<(), SchedulingError> {
        if taints::check_all(&prepared.pod, &self.pool_taints).is_err() {
            return Err(SchedulingError::NoCompatibleInstanceTypes(
                "pool taints untolerated".to_string(),
            ));
        }
        let ports = pod_host_ports(&prepared.pod);
        if self
            .host_ports
            .iter()
            .any(|reserved| ports.iter().any(|p| reserved.conflicts(p)))
        {
            return Err(SchedulingError::InsufficientCapacity(
                "host port already reserved on candidate".to_string(),
            ));
        }
        let claims = pod_volume_claims(&prepared.pod);
        if let Some(conflict) = claims
            .iter()
            .find(|c| volume_locations.get(*c).is_some_and(|owner| owner != &self.hostname))
        {
            return Err(SchedulingError::VolumeTopologyConflict(format!(
                "claim {conflict} is mounted on another node"
            )));
        }

        let combined = self
            .requirements
            .intersect(prepared.requirements())
            .map_err(|e| SchedulingError::NoCompatibleInstanceTypes(e.to_string()))?;
        let topo = topology
            .add_requirements(&prepared.pod, &combined)
            .map_err(|e| SchedulingError::TopologyConflict(e.to_string()))?;
        let combined = combined
            .intersect(&topo)
            .map_err(|e| SchedulingError::TopologyConflict(e.to_string()))?;

        let mut total = self.requests.clone();
        total.add(&prepared.requests);
        total.add(&self.daemon_overhead);

        let (remaining, compatible_seen) =
            Self::admissible_types(&self.instance_types, &combined, &total);
        if remaining.is_empty() {
            return Err(if compatible_seen {
                SchedulingError::InsufficientCapacity(format!(
                    "no instance type fits {} additional requests",
                    prepared.key
                ))
            } else {
                SchedulingError::NoCompatibleInstanceTypes(format!(
                    "requirements {combined} admit no instance type"
                ))
            });
        }
        Self::check_min_values(&combined, &remaining)?;

        // Commit.
        let narrowing = topology.record(&prepared.pod, &combined);
        let combined = combined
            .intersect(&narrowing)
            .map_err(|e| SchedulingError::TopologyConflict(e.to_string()))?;
        let (remaining, _) = Self::admissible_types(&remaining, &combined, &total);
        self.requirements = combined;
        self.instance_types = remaining;
        self.requests.add(&prepared.requests);
        self.pods.push(prepared.key.clone());
        self.host_ports.extend(ports);
        for claim in claims {
            volume_locations.insert(claim, self.hostname.clone());
        }
        Ok(())
    }

    /// Order instance types by cheapest admissible offering and truncate,
    /// preserving the cheapest representative per zone so zonal flexibility
    /// survives the cut.
    fn finalize(mut self, max_instance_types: usize) -> NodeClaimDraft {
        self.instance_types.sort_by(|a, b| {
            let pa = a.min_available_price(&self.requirements).unwrap_or(f64::MAX);
            let pb = b.min_available_price(&self.requirements).unwrap_or(f64::MAX);
            pa.total_cmp(&pb).then_with(|| a.name.cmp(&b.name))
        });

        let min_keep = self
            .requirements
            .min_values()
            .filter(|(key, _)| *key == labels::INSTANCE_TYPE_LABEL)
            .map(|(_, n)| n)
            .max()
            .unwrap_or(0);
        let limit = max_instance_types.max(min_keep).max(1);

        if self.instance_types.len() > limit {
            let mut kept: Vec<InstanceType> = Vec::with_capacity(limit);
            let mut kept_names: BTreeSet<String> = BTreeSet::new();
            let mut zones_covered: BTreeSet<String> = BTreeSet::new();
            // Cheapest representative per zone first.
            for it in &self.instance_types {
                for offering in it.available_offerings() {
                    if self.requirements.has(labels::ZONE_LABEL, &offering.zone)
                        && zones_covered.insert(offering.zone.clone())
                        && kept_names.insert(it.name.clone())
                    {
                        kept.push(it.clone());
                    }
                }
            }
            for it in &self.instance_types {
                if kept.len() >= limit {
                    break;
                }
                if kept_names.insert(it.name.clone()) {
                    kept.push(it.clone());
                }
            }
            // Zone representatives survive the cut even when numerous.
            kept.truncate(limit.max(zones_covered.len()));
            self.instance_types = kept;
        }

        // Pin the persisted requirements to what actually remains.
        let names: Vec<String> = self.instance_types.iter().map(|t| t.name.clone()).collect();
        let zones: BTreeSet<String> = self
            .instance_types
            .iter()
            .flat_map(|t| t.available_offerings())
            .filter(|o| self.requirements.has(labels::ZONE_LABEL, &o.zone))
            .map(|o| o.zone.clone())
            .collect();
        let capacity_types: BTreeSet<String> = self
            .instance_types
            .iter()
            .flat_map(|t| t.available_offerings())
            .filter(|o| {
                self.requirements
                    .has(labels::CAPACITY_TYPE_LABEL, &o.capacity_type)
            })
            .map(|o| o.capacity_type.clone())
            .collect();
        let mut requirements = self.requirements;
        requirements.add(Requirement::new_in(labels::INSTANCE_TYPE_LABEL, names));
        requirements.add(Requirement::new_in(labels::ZONE_LABEL, zones));
        requirements.add(Requirement::new_in(
            labels::CAPACITY_TYPE_LABEL,
            capacity_types,
        ));

        let mut requests = self.requests;
        requests.add(&self.daemon_overhead);

        NodeClaimDraft {
            pool: self.pool,
            requirements,
            instance_types: self.instance_types,
            pods: self.pods,
            requests,
            taints: self.pool_taints,
            startup_taints: self.startup_taints,
            labels: self.pool_labels,
            hostname: self.hostname,
        }
    }
}

pub struct Scheduler<'a> {
    snapshot: &'a ClusterSnapshot,
    /// Pools with their catalogs, sorted by descending weight then
    /// descending name.
    pools: Vec<(NodePool, Vec<InstanceType>)>,
    options: SchedulerOptions,
    next_node_index: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        snapshot: &'a ClusterSnapshot,
        mut pools: Vec<(NodePool, Vec<InstanceType>)>,
        options: SchedulerOptions,
    ) -> Self {
        pools.sort_by(|(a, _), (b, _)| {
            b.weight().cmp(&a.weight()).then_with(|| {
                b.metadata
                    .name
                    .clone()
                    .unwrap_or_default()
                    .cmp(&a.metadata.name.clone().unwrap_or_default())
            })
        });
        Self {
            snapshot,
            pools,
            options,
            next_node_index: 0,
        }
    }

    fn domain_universe(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut universe: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (pool, instance_types) in &self.pools {
            for it in instance_types {
                for requirement in it.requirements().iter() {
                    for value in requirement.values() {
                        universe
                            .entry(requirement.key().to_string())
                            .or_default()
                            .insert(value.to_string());
                    }
                }
            }
            if let Ok(reqs) = pool.template_requirements() {
                for requirement in reqs.iter() {
                    for value in requirement.values() {
                        universe
                            .entry(requirement.key().to_string())
                            .or_default()
                            .insert(value.to_string());
                    }
                }
            }
        }
        for state_node in &self.snapshot.nodes {
            for (key, value) in state_node.labels() {
                universe.entry(key).or_default().insert(value);
            }
        }
        universe
    }

    fn prepare(&self, pod: Pod) -> Result<PreparedPod, (PodKey, SchedulingError)> {
        let key = PodKey::from_pod(&pod);
        let requests = resources::pod_requests(&pod)
            .map_err(|e| (key.clone(), SchedulingError::InvalidPod(e.to_string())))?;
        let volume_reqs = pod_volume_requirements(
            &pod,
            &self.snapshot.pvcs,
            &self.snapshot.pvs,
            &self.snapshot.storage_classes,
        )
        .map_err(|e| match e {
            VolumeError::Conflict(inner) => (
                key.clone(),
                SchedulingError::VolumeTopologyConflict(inner.to_string()),
            ),
            other => (
                key.clone(),
                SchedulingError::VolumeTopologyConflict(other.to_string()),
            ),
        })?;

        let map_req_err = |e: crate::scheduling::requirements::RequirementError| match e {
            crate::scheduling::requirements::RequirementError::RestrictedLabel(l) => {
                SchedulingError::UnknownLabel(l)
            }
            other => SchedulingError::InvalidPod(other.to_string()),
        };
        let required = Requirements::try_from_pod_with(&pod, false)
            .map_err(|e| (key.clone(), map_req_err(e)))?
            .intersect(&volume_reqs)
            .map_err(|e| {
                (
                    key.clone(),
                    SchedulingError::VolumeTopologyConflict(e.to_string()),
                )
            })?;
        let with_preferred = match Requirements::try_from_pod_with(&pod, true) {
            Ok(reqs) => reqs
                .intersect(&volume_reqs)
                .unwrap_or_else(|_| required.clone()),
            // Preferred terms that conflict are ignored outright.
            Err(_) => required.clone(),
        };

        Ok(PreparedPod {
            pod,
            key,
            requests,
            required,
            with_preferred,
            use_preferred: true,
        })
    }

    fn open_candidate(
        &mut self,
        prepared: &PreparedPod,
        topology: &mut Topology,
        volume_locations: &mut BTreeMap<String, String>,
    ) -> Result<Candidate, SchedulingError> {
        let claims = pod_volume_claims(&prepared.pod);
        if let Some(conflict) = claims.iter().find(|c| volume_locations.contains_key(*c)) {
            return Err(SchedulingError::VolumeTopologyConflict(format!(
                "claim {conflict} is mounted on another node"
            )));
        }
        let mut last_error = SchedulingError::NoCompatibleInstanceTypes(
            "no node pool admits this pod".to_string(),
        );
        for (pool, instance_types) in &self.pools {
            if !pool.is_ready() {
                continue;
            }
            let pool_name = pool.metadata.name.clone().unwrap_or_default();
            let result = (|| {
                let template = pool
                    .template_requirements()
                    .map_err(|e| SchedulingError::NoCompatibleInstanceTypes(e.to_string()))?;
                if taints::check_all(&prepared.pod, pool.taints()).is_err() {
                    return Err(SchedulingError::NoCompatibleInstanceTypes(format!(
                        "pool {pool_name} taints untolerated"
                    )));
                }

                let hostname = format!("{pool_name}-sim-{}", self.next_node_index);
                let mut requirements = template
                    .intersect(prepared.requirements())
                    .map_err(|e| SchedulingError::NoCompatibleInstanceTypes(e.to_string()))?;
                requirements.add(Requirement::new_in(
                    labels::NODE_POOL_LABEL,
                    [pool_name.clone()],
                ));
                topology.register_domain(labels::HOSTNAME_LABEL, &hostname);
                requirements.add(Requirement::new_in(
                    labels::HOSTNAME_LABEL,
                    [hostname.clone()],
                ));

                let topo = topology
                    .add_requirements(&prepared.pod, &requirements)
                    .map_err(|e| SchedulingError::TopologyConflict(e.to_string()))?;
                let requirements = requirements
                    .intersect(&topo)
                    .map_err(|e| SchedulingError::TopologyConflict(e.to_string()))?;

                let daemon_overhead = self
                    .snapshot
                    .daemon_overhead(&requirements, pool.taints());
                let mut total = prepared.requests.clone();
                total.add(&daemon_overhead);

                let (remaining, compatible_seen) =
                    Candidate::admissible_types(instance_types, &requirements, &total);
                if remaining.is_empty() {
                    // A fresh candidate holds this pod alone: if nothing can
                    // run it, the pool simply has no compatible type.
                    return Err(SchedulingError::NoCompatibleInstanceTypes(if compatible_seen {
                        format!(
                            "no instance type in pool {pool_name} is large enough for {}",
                            prepared.key
                        )
                    } else {
                        format!("pool {pool_name} has no instance type for {}", prepared.key)
                    }));
                }
                Candidate::check_min_values(&requirements, &remaining)?;

                let narrowing = topology.record(&prepared.pod, &requirements);
                let requirements = requirements
                    .intersect(&narrowing)
                    .map_err(|e| SchedulingError::TopologyConflict(e.to_string()))?;
                let (remaining, _) =
                    Candidate::admissible_types(&remaining, &requirements, &total);

                Ok(Candidate {
                    pool: pool_name.clone(),
                    pool_labels: pool.spec.template.metadata.labels.clone(),
                    pool_taints: pool.taints().to_vec(),
                    startup_taints: pool.startup_taints().to_vec(),
                    requirements,
                    instance_types: remaining,
                    daemon_overhead,
                    requests: prepared.requests.clone(),
                    pods: vec![prepared.key.clone()],
                    host_ports: pod_host_ports(&prepared.pod),
                    hostname,
                })
            })();

            match result {
                Ok(candidate) => {
                    self.next_node_index += 1;
                    for claim in &claims {
                        volume_locations.insert(claim.clone(), candidate.hostname.clone());
                    }
                    return Ok(candidate);
                }
                Err(e) => {
                    if e.rank() >= last_error.rank() {
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Run the pass. Pods must already be classified as provisionable.
    pub fn schedule(mut self, pending: Vec<Pod>) -> SchedulingResults {
        let mut results = SchedulingResults::default();

        let universe = self.domain_universe();
        let mut topology = Topology::new(
            universe,
            &self.snapshot.pods_with_node_labels,
            &pending,
        );

        let mut prepared: Vec<PreparedPod> = Vec::new();
        for pod in pending {
            match self.prepare(pod) {
                Ok(p) => prepared.push(p),
                Err((key, error)) => {
                    results.errors.insert(key, error);
                }
            }
        }
        // First-Fit-Decreasing: biggest pods first.
        prepared.sort_by(|a, b| b.requests.ffd_key().cmp(&a.requests.ffd_key()));

        let mut existing: Vec<ExistingNode> = self
            .snapshot
            .nodes
            .iter()
            .filter_map(ExistingNode::from_state)
            .collect();
        existing.sort_by(|a, b| {
            // Real nodes before in-flight claims, then by name.
            b.is_node.cmp(&a.is_node).then_with(|| a.name.cmp(&b.name))
        });

        // Where each exclusive volume claim currently lives, across real
        // nodes, in-flight capacity and this pass's candidates.
        let mut volume_locations: BTreeMap<String, String> = BTreeMap::new();
        for node in &existing {
            for claim in node.state.volume_claims() {
                volume_locations.insert(claim, node.name.clone());
            }
        }

        let mut candidates: Vec<Candidate> = Vec::new();

        for mut pod in prepared {
            loop {
                if let Some(index) = existing
                    .iter_mut()
                    .position(|n| n.try_add(&pod, &mut topology, &mut volume_locations))
                {
                    let node = &existing[index];
                    debug!(pod = %pod.key, node = %node.name, "placed on existing capacity");
                    if node.is_node {
                        results.bindings.push((pod.key.clone(), node.name.clone()));
                    } else {
                        results.nominations.push((pod.key.clone(), node.name.clone()));
                    }
                    break;
                }

                let mut placed = false;
                let mut best_error: Option<SchedulingError> = None;
                for candidate in candidates.iter_mut() {
                    match candidate.try_add(&pod, &mut topology, &mut volume_locations) {
                        Ok(()) => {
                            debug!(pod = %pod.key, hostname = %candidate.hostname, "placed on in-flight node");
                            placed = true;
                            break;
                        }
                        Err(e) => {
                            if best_error.as_ref().is_none_or(|b| e.rank() > b.rank()) {
                                best_error = Some(e);
                            }
                        }
                    }
                }
                if placed {
                    break;
                }

                match self.open_candidate(&pod, &mut topology, &mut volume_locations) {
                    Ok(candidate) => {
                        debug!(pod = %pod.key, pool = %candidate.pool, hostname = %candidate.hostname, "opened candidate node");
                        candidates.push(candidate);
                        break;
                    }
                    Err(e) => {
                        if best_error.as_ref().is_none_or(|b| e.rank() > b.rank()) {
                            best_error = Some(e);
                        }
                    }
                }

                // Nothing fits: drop the softest constraint and retry, or
                // give up on the pod.
                if pod.relax() || topology.relax(&pod.key) {
                    debug!(pod = %pod.key, "relaxed soft constraint and retrying");
                    continue;
                }
                results.errors.insert(
                    pod.key.clone(),
                    best_error.unwrap_or_else(|| {
                        SchedulingError::NoCompatibleInstanceTypes(
                            "no pool produced a candidate".to_string(),
                        )
                    }),
                );
                break;
            }
        }

        results.new_node_claims = candidates
            .into_iter()
            .map(|c| c.finalize(self.options.max_instance_types))
            .collect();

        info!(
            bound = results.bindings.len(),
            new_nodes = results.new_node_claims.len(),
            failed = results.errors.len(),
            "scheduling pass complete"
        );
        results
    }
}
