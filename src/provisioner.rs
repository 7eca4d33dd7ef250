//! The provisioner: batch, schedule, launch.
//!
//! Waits for a batch window to close, snapshots cluster state, runs the
//! scheduler, and turns the plan into NodeClaim objects and Nominated
//! events. Freshly created claims are reflected straight into the cache so
//! the next pass cannot double-provision while the watch stream catches up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;
use kube::{Client, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::apis::nodeclaim::NodeClaimStatus;
use crate::apis::{NodeClaim, NodePool};
use crate::cloudprovider::{CloudProvider, InstanceTypeCache, UnavailableOfferings};
use crate::config::Settings;
use crate::events::{object_ref, EventRecorder, Reason};
use crate::metrics::{PoolLabels, ReasonLabels, SharedMetrics};
use crate::scheduling::batcher::Batcher;
use crate::scheduling::pod::{self, PodKey};
use crate::scheduling::resources::Resources;
use crate::scheduling::scheduler::{
    NodeClaimDraft, Scheduler, SchedulerOptions, SchedulingError,
};
use crate::state::ClusterState;

const SOFT_ANTI_AFFINITY_WARNING_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Provisioner {
    pub client: Client,
    pub provider: Arc<CloudProvider>,
    pub state: Arc<ClusterState>,
    pub events: EventRecorder,
    pub metrics: SharedMetrics,
    pub instance_types: Arc<InstanceTypeCache>,
    pub unavailable_offerings: Arc<UnavailableOfferings>,
    pub settings: Settings,
    /// When each still-unbound pod was first seen, for the unbound-time
    /// histogram.
    first_seen: HashMap<PodKey, Instant>,
    /// Last time the preferred-anti-affinity warning fired per pod.
    soft_anti_affinity_warned: HashMap<PodKey, Instant>,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        provider: Arc<CloudProvider>,
        state: Arc<ClusterState>,
        events: EventRecorder,
        metrics: SharedMetrics,
        instance_types: Arc<InstanceTypeCache>,
        unavailable_offerings: Arc<UnavailableOfferings>,
        settings: Settings,
    ) -> Self {
        Self {
            client,
            provider,
            state,
            events,
            metrics,
            instance_types,
            unavailable_offerings,
            settings,
            first_seen: HashMap::new(),
            soft_anti_affinity_warned: HashMap::new(),
        }
    }

    /// Main loop: one scheduling pass per closed batch window.
    pub async fn run(mut self, mut batcher: Batcher, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                open = batcher.wait() => {
                    if !open {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
            // Scheduling against an unsynced cache would double-count or
            // miss capacity; yield until the initial lists land.
            while !self.state.synced() {
                self.metrics.cluster_state_synced.set(0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                    _ = shutdown.changed() => return,
                }
            }
            self.metrics.cluster_state_synced.set(1);

            if let Err(error) = self.provision_once().await {
                warn!(%error, "provisioning pass failed");
            }
        }
    }

    /// Pending pods that this controller should find capacity for.
    async fn pending_pods(&self) -> kube::Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields("status.phase=Pending");
        let now = Utc::now();
        Ok(pods
            .list(&lp)
            .await?
            .into_iter()
            .filter(|p| pod::is_provisionable(p, now))
            .collect())
    }

    async fn ready_pools(&self) -> kube::Result<Vec<(NodePool, Vec<crate::cloudprovider::types::InstanceType>)>> {
        let pools: Api<NodePool> = Api::all(self.client.clone());
        let mut out = Vec::new();
        for pool in pools.list(&ListParams::default()).await? {
            let usage = self.state.pool_usage(&pool.name_any());
            self.metrics
                .nodepool_usage_cpu_millis
                .get_or_create(&PoolLabels {
                    nodepool: pool.name_any(),
                })
                .set(usage.cpu_millis() as i64);

            let mut instance_types = match self.instance_types.get(&self.provider, &pool).await {
                Ok(instance_types) => instance_types,
                Err(error) => {
                    warn!(pool = %pool.name_any(), %error, "failed to fetch instance types");
                    self.metrics
                        .cloudprovider_errors_total
                        .get_or_create(&ReasonLabels::new("instance_types"))
                        .inc();
                    continue;
                }
            };
            self.unavailable_offerings.filter(&mut instance_types);

            // A pool whose template admits nothing at all is misconfigured;
            // it drops out of rotation without affecting its siblings.
            if let Err(reason) = self.pool_admits_something(&pool, &instance_types) {
                if pool.is_ready() {
                    if let Err(error) = self.mark_pool_ready(&pool, false, &reason).await {
                        warn!(pool = %pool.name_any(), %error, "failed to update pool readiness");
                    }
                }
                continue;
            }
            if !pool.is_ready() {
                if let Err(error) = self
                    .mark_pool_ready(&pool, true, "instance types available")
                    .await
                {
                    warn!(pool = %pool.name_any(), %error, "failed to update pool readiness");
                }
            }
            if self.pool_at_limit(&pool) {
                debug!(pool = %pool.name_any(), "skipping pool at resource limit");
                continue;
            }
            out.push((pool, instance_types));
        }
        Ok(out)
    }

    fn pool_admits_something(
        &self,
        pool: &NodePool,
        instance_types: &[crate::cloudprovider::types::InstanceType],
    ) -> Result<(), String> {
        let template = pool
            .template_requirements()
            .map_err(|e| format!("invalid template requirements: {e}"))?;
        let admissible = instance_types.iter().any(|it| {
            template.is_compatible(&it.requirements()) && it.has_admissible_offering(&template)
        });
        if admissible {
            Ok(())
        } else {
            Err("no admissible instance types for the pool template".to_string())
        }
    }

    async fn mark_pool_ready(
        &self,
        pool: &NodePool,
        ready: bool,
        message: &str,
    ) -> kube::Result<()> {
        use crate::apis::nodepool::condition::READY;
        let mut conditions = pool.conditions().to_vec();
        crate::apis::set_condition(
            &mut conditions,
            READY,
            ready,
            if ready { "Ready" } else { "NoCompatibleInstanceTypes" },
            message,
            Utc::now(),
        );
        let pools: Api<NodePool> = Api::all(self.client.clone());
        pools
            .patch_status(
                &pool.name_any(),
                &PatchParams::default(),
                &Patch::Merge(json!({"status": {"conditions": conditions}})),
            )
            .await?;
        if !ready {
            let reference = object_ref(
                "NodePool",
                "karpenter.sh/v1",
                &pool.name_any(),
                None,
                pool.metadata.uid.as_deref(),
            );
            self.events
                .publish(
                    &reference,
                    Reason::NoCompatibleInstanceTypes,
                    message.to_string(),
                )
                .await;
        }
        Ok(())
    }

    fn pool_at_limit(&self, pool: &NodePool) -> bool {
        let Some(limits) = &pool.spec.limits else {
            return false;
        };
        let Ok(limits) = Resources::from_list(limits) else {
            return false;
        };
        let usage = self.state.pool_usage(&pool.name_any());
        limits.names().any(|name| usage.get(name) >= limits.get(name))
    }

    pub async fn provision_once(&mut self) -> anyhow::Result<()> {
        let started = Instant::now();
        let pending = self.pending_pods().await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "found provisionable pods");
        for p in &pending {
            self.first_seen
                .entry(PodKey::from_pod(p))
                .or_insert_with(Instant::now);
        }

        let pools = self.ready_pools().await?;
        let snapshot = self.state.snapshot();
        self.metrics
            .cluster_state_node_count
            .set(snapshot.nodes.len() as i64);
        self.metrics
            .cluster_state_pod_count
            .set(self.state.bound_pod_count() as i64);

        let scheduler = Scheduler::new(
            &snapshot,
            pools,
            SchedulerOptions {
                max_instance_types: self.settings.max_instance_types,
            },
        );
        let results = scheduler.schedule(pending.clone());
        self.metrics
            .scheduling_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        let by_key: HashMap<PodKey, &Pod> =
            pending.iter().map(|p| (PodKey::from_pod(p), p)).collect();

        for (pod_key, node_name) in &results.bindings {
            if let Some(p) = by_key.get(pod_key) {
                self.events
                    .publish(
                        &pod_reference(p),
                        Reason::Nominated,
                        format!("pod should schedule on existing node {node_name}"),
                    )
                    .await;
            }
            self.observe_bound(pod_key);
        }
        for (pod_key, claim_name) in &results.nominations {
            debug!(pod = %pod_key, claim = %claim_name, "pod waits for in-flight capacity");
            self.observe_bound(pod_key);
        }

        for draft in &results.new_node_claims {
            let claim_name = self.create_node_claim(draft).await?;
            for pod_key in &draft.pods {
                if let Some(p) = by_key.get(pod_key) {
                    self.events
                        .publish(
                            &pod_reference(p),
                            Reason::Nominated,
                            format!("pod should schedule on incoming node claim {claim_name}"),
                        )
                        .await;
                }
                self.observe_bound(pod_key);
            }
            self.warn_soft_anti_affinity(draft, &by_key).await;
        }

        for (pod_key, error) in &results.errors {
            self.metrics
                .scheduling_errors_total
                .get_or_create(&ReasonLabels::new(error_reason(error)))
                .inc();
            if let Some(p) = by_key.get(pod_key) {
                let reason = match error {
                    SchedulingError::NoCompatibleInstanceTypes(_) => {
                        Reason::NoCompatibleInstanceTypes
                    }
                    SchedulingError::InsufficientCapacity(_) => {
                        Reason::InsufficientCapacityError
                    }
                    _ => Reason::FailedScheduling,
                };
                self.events
                    .publish(&pod_reference(p), reason, error.to_string())
                    .await;
            }
        }
        Ok(())
    }

    /// Persist a draft as a NodeClaim and reflect it into the cache with a
    /// projected status, so the next pass sees the capacity as existing.
    async fn create_node_claim(&self, draft: &NodeClaimDraft) -> anyhow::Result<String> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let name = format!("{}-{}", draft.pool, uuid::Uuid::new_v4());
        let mut claim = NodeClaim::new(&name, draft.to_spec());
        claim.metadata.labels = {
            let mut labels = draft.labels.clone();
            labels.extend(draft.requirements.labels());
            Some(labels)
        };
        let created = api.create(&PostParams::default(), &claim).await?;
        info!(
            claim = %name,
            pool = %draft.pool,
            pods = draft.pods.len(),
            instance_types = draft.instance_types.len(),
            "created node claim"
        );
        self.metrics
            .nodeclaims_created_total
            .get_or_create(&PoolLabels {
                nodepool: draft.pool.clone(),
            })
            .inc();

        // Projected status from the cheapest candidate: enough for the
        // scheduler to treat the claim as capacity before launch resolves
        // the real numbers.
        let mut reflected = created;
        if let Some(cheapest) = draft.instance_types.first() {
            reflected.status = Some(NodeClaimStatus {
                capacity: cheapest.capacity.to_list(),
                allocatable: cheapest.allocatable().to_list(),
                ..Default::default()
            });
        }
        self.state.update_node_claim(reflected);
        Ok(name)
    }

    fn observe_bound(&mut self, pod_key: &PodKey) {
        if let Some(first_seen) = self.first_seen.remove(pod_key) {
            self.metrics
                .pods_unbound_time_seconds
                .observe(first_seen.elapsed().as_secs_f64());
        }
    }

    /// Over-provisioning caused by preferred anti-affinity is easy to
    /// misread as a scheduler bug; warn, at most once per pod per hour.
    async fn warn_soft_anti_affinity(
        &mut self,
        draft: &NodeClaimDraft,
        by_key: &HashMap<PodKey, &Pod>,
    ) {
        for pod_key in &draft.pods {
            let Some(p) = by_key.get(pod_key) else {
                continue;
            };
            let has_soft_anti_affinity = p
                .spec
                .as_ref()
                .and_then(|s| s.affinity.as_ref())
                .and_then(|a| a.pod_anti_affinity.as_ref())
                .and_then(|aa| {
                    aa.preferred_during_scheduling_ignored_during_execution
                        .as_ref()
                })
                .is_some_and(|terms| !terms.is_empty());
            if !has_soft_anti_affinity {
                continue;
            }
            let warned_recently = self
                .soft_anti_affinity_warned
                .get(pod_key)
                .is_some_and(|at| at.elapsed() < SOFT_ANTI_AFFINITY_WARNING_INTERVAL);
            if warned_recently {
                continue;
            }
            self.soft_anti_affinity_warned
                .insert(pod_key.clone(), Instant::now());
            self.events
                .publish(
                    &pod_reference(p),
                    Reason::PreferredAntiAffinityInhibitsConsolidation,
                    "preferred anti-affinity forced a new node; consolidation may not undo this"
                        .to_string(),
                )
                .await;
        }
    }
}

fn pod_reference(p: &Pod) -> k8s_openapi::api::core::v1::ObjectReference {
    object_ref(
        "Pod",
        "v1",
        p.metadata.name.as_deref().unwrap_or_default(),
        p.metadata.namespace.as_deref(),
        p.metadata.uid.as_deref(),
    )
}

fn error_reason(error: &SchedulingError) -> &'static str {
    match error {
        SchedulingError::NoCompatibleInstanceTypes(_) => "no_compatible_instance_types",
        SchedulingError::InsufficientCapacity(_) => "insufficient_capacity",
        SchedulingError::TopologyConflict(_) => "topology_conflict",
        SchedulingError::VolumeTopologyConflict(_) => "volume_topology_conflict",
        SchedulingError::UnknownLabel(_) => "unknown_label",
        SchedulingError::DoNotDisrupt => "do_not_disrupt",
        SchedulingError::InvalidPod(_) => "invalid_pod",
    }
}
