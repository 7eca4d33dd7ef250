//! The per-claim lifecycle controller.
//!
//! Drives each NodeClaim through launch → registration → initialization,
//! watches for drift and expiry afterwards, and unwinds everything through
//! the drain flow when a deletion lands. Every transition is idempotent
//! under re-reconciliation; the interesting decisions live in the pure
//! submodules, this module is the API glue.

pub mod drift;
pub mod garbagecollect;
pub mod initialization;
pub mod launch;
pub mod liveness;
pub mod registration;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::sync::watch as tokio_watch;
use tracing::{debug, error, info, warn};

use crate::apis::nodeclaim::condition;
use crate::apis::nodepool::condition as pool_condition;
use crate::apis::{set_condition, NodeClaim, NodePool};
use crate::cloudprovider::types::ProviderId;
use crate::cloudprovider::{CloudProvider, CloudProviderError, UnavailableOfferings};
use crate::config::Settings;
use crate::events::{object_ref, EventRecorder, Reason};
use crate::metrics::{PoolLabels, ReasonLabels, SharedMetrics};
use crate::scheduling::labels;
use crate::state::ClusterState;
use crate::termination::eviction::EvictionQueue;
use crate::termination::plan_drain;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    CloudProvider(#[from] CloudProviderError),
}

pub struct Context {
    pub client: Client,
    pub provider: Arc<CloudProvider>,
    pub state: Arc<ClusterState>,
    pub events: EventRecorder,
    pub metrics: SharedMetrics,
    pub eviction_queue: Arc<EvictionQueue>,
    pub unavailable_offerings: Arc<UnavailableOfferings>,
    pub settings: Settings,
}

impl Context {
    fn claims(&self) -> Api<NodeClaim> {
        Api::all(self.client.clone())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pools(&self) -> Api<NodePool> {
        Api::all(self.client.clone())
    }

    fn claim_ref(&self, claim: &NodeClaim) -> k8s_openapi::api::core::v1::ObjectReference {
        object_ref(
            "NodeClaim",
            "karpenter.sh/v1",
            &claim.name_any(),
            None,
            claim.metadata.uid.as_deref(),
        )
    }
}

async fn ensure_finalizer(ctx: &Context, claim: &NodeClaim) -> Result<(), LifecycleError> {
    let finalizers = claim.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == labels::TERMINATION_FINALIZER) {
        return Ok(());
    }
    let mut desired = finalizers;
    desired.push(labels::TERMINATION_FINALIZER.to_string());
    ctx.claims()
        .patch(
            &claim.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({"metadata": {"finalizers": desired}})),
        )
        .await?;
    Ok(())
}

async fn remove_finalizer(ctx: &Context, claim: &NodeClaim) -> Result<(), LifecycleError> {
    let desired: Vec<String> = claim
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != labels::TERMINATION_FINALIZER)
        .collect();
    match ctx
        .claims()
        .patch(
            &claim.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({"metadata": {"finalizers": desired}})),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn patch_claim_status(
    ctx: &Context,
    name: &str,
    status: &crate::apis::NodeClaimStatus,
) -> Result<(), LifecycleError> {
    ctx.claims()
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({"status": status})),
        )
        .await?;
    Ok(())
}

/// Mark the owning pool's registration health after liveness failures.
async fn mark_pool_registration_unhealthy(
    ctx: &Context,
    pool_name: &str,
    message: &str,
) -> Result<(), LifecycleError> {
    let pools = ctx.pools();
    let Some(pool) = pools.get_opt(pool_name).await? else {
        return Ok(());
    };
    let mut conditions = pool.conditions().to_vec();
    set_condition(
        &mut conditions,
        pool_condition::NODE_REGISTRATION_HEALTHY,
        false,
        "RegistrationFailed",
        message,
        Utc::now(),
    );
    pools
        .patch_status(
            pool_name,
            &PatchParams::default(),
            &Patch::Merge(json!({"status": {"conditions": conditions}})),
        )
        .await?;
    let reference = object_ref("NodePool", "karpenter.sh/v1", pool_name, None, None);
    ctx.events
        .publish(&reference, Reason::RegistrationFailed, message.to_string())
        .await;
    Ok(())
}

async fn handle_launch(ctx: &Context, claim: &NodeClaim) -> Result<Action, LifecycleError> {
    match ctx.provider.create(claim).await {
        Ok(instance) => {
            info!(claim = %claim.name_any(), provider_id = %instance.provider_id, "launched instance");
            let status = launch::launched_status(claim, &instance, Utc::now());
            let resolved = launch::resolved_labels(claim, &instance);
            ctx.claims()
                .patch(
                    &claim.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(json!({"metadata": {"labels": resolved}})),
                )
                .await?;
            patch_claim_status(ctx, &claim.name_any(), &status).await?;
            ctx.metrics
                .status_condition_transitions_total
                .get_or_create(&ReasonLabels::new(condition::LAUNCHED))
                .inc();

            let mut reflected = claim.clone();
            reflected.metadata.labels = Some(launch::resolved_labels(claim, &instance));
            reflected.status = Some(status);
            ctx.state.update_node_claim(reflected);
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        Err(CloudProviderError::InsufficientCapacity {
            instance_type,
            zone,
            capacity_type,
        }) => {
            warn!(
                claim = %claim.name_any(),
                %instance_type, %zone, %capacity_type,
                "offering sold out; blacklisting and recycling claim"
            );
            ctx.unavailable_offerings
                .mark(&instance_type, &zone, &capacity_type);
            ctx.metrics
                .cloudprovider_errors_total
                .get_or_create(&ReasonLabels::new("insufficient_capacity"))
                .inc();
            ctx.events
                .publish(
                    &ctx.claim_ref(claim),
                    Reason::InsufficientCapacityError,
                    format!("{instance_type} ({capacity_type}) unavailable in {zone}"),
                )
                .await;
            // Recycle: the next scheduling pass re-plans around the
            // blacklisted offering.
            remove_finalizer(ctx, claim).await?;
            match ctx
                .claims()
                .delete(&claim.name_any(), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            ctx.state.delete_node_claim(&claim.name_any());
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.metrics
                .cloudprovider_errors_total
                .get_or_create(&ReasonLabels::new("create"))
                .inc();
            Err(e.into())
        }
    }
}

async fn handle_registration(ctx: &Context, claim: &NodeClaim) -> Result<Action, LifecycleError> {
    let provider_id = claim.provider_id().unwrap_or_default().to_string();
    let backing_node = ctx
        .state
        .node_by_provider_id(&provider_id)
        .and_then(|s| s.node);

    let Some(node) = backing_node else {
        if liveness::registration_expired(claim, ctx.settings.registration_ttl(), Utc::now()) {
            warn!(claim = %claim.name_any(), %provider_id, "node never registered; deleting claim");
            ctx.metrics
                .nodeclaims_disrupted_total
                .get_or_create(&ReasonLabels::new("liveness"))
                .inc();
            mark_pool_registration_unhealthy(
                ctx,
                &claim.spec.node_pool,
                &format!(
                    "node claim {} launched but no node registered within the TTL",
                    claim.name_any()
                ),
            )
            .await?;
            if let Err(e) = ctx.provider.delete(&ProviderId(provider_id)).await
                && !e.is_not_found()
            {
                return Err(e.into());
            }
            remove_finalizer(ctx, claim).await?;
            match ctx
                .claims()
                .delete(&claim.name_any(), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            ctx.state.delete_node_claim(&claim.name_any());
            return Ok(Action::await_change());
        }
        let requeue = liveness::time_until_expiry(claim, ctx.settings.registration_ttl(), Utc::now())
            .unwrap_or(Duration::from_secs(60))
            .min(Duration::from_secs(60));
        return Ok(Action::requeue(requeue));
    };

    let node_name = node.name_any();
    debug!(claim = %claim.name_any(), node = %node_name, "registering node");
    let node_labels = registration::registered_labels(claim, &node);
    let node_taints = registration::registered_taints(claim, &node);
    ctx.nodes()
        .patch(
            &node_name,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": {"labels": node_labels},
                "spec": {"taints": node_taints},
            })),
        )
        .await?;

    let mut status = claim.status.clone().unwrap_or_default();
    status.node_name = Some(node_name);
    set_condition(
        &mut status.conditions,
        condition::REGISTERED,
        true,
        "Registered",
        "",
        Utc::now(),
    );
    patch_claim_status(ctx, &claim.name_any(), &status).await?;
    ctx.metrics
        .nodes_registered_total
        .get_or_create(&PoolLabels {
            nodepool: claim.spec.node_pool.clone(),
        })
        .inc();
    ctx.metrics
        .status_condition_transitions_total
        .get_or_create(&ReasonLabels::new(condition::REGISTERED))
        .inc();
    Ok(Action::requeue(Duration::from_secs(5)))
}

async fn handle_initialization(ctx: &Context, claim: &NodeClaim) -> Result<Action, LifecycleError> {
    let provider_id = claim.provider_id().unwrap_or_default().to_string();
    let Some(node) = ctx
        .state
        .node_by_provider_id(&provider_id)
        .and_then(|s| s.node)
    else {
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    if !initialization::is_initialized(claim, &node) {
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    ctx.nodes()
        .patch(
            &node.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": {"labels": {labels::INITIALIZED_LABEL: "true"}},
            })),
        )
        .await?;
    let mut status = claim.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        condition::INITIALIZED,
        true,
        "Initialized",
        "",
        Utc::now(),
    );
    set_condition(&mut status.conditions, condition::READY, true, "Ready", "", Utc::now());
    patch_claim_status(ctx, &claim.name_any(), &status).await?;
    ctx.metrics
        .status_condition_transitions_total
        .get_or_create(&ReasonLabels::new(condition::INITIALIZED))
        .inc();
    info!(claim = %claim.name_any(), node = %node.name_any(), "node initialized");
    Ok(Action::requeue(ctx.settings.drift_interval()))
}

async fn handle_settled(ctx: &Context, claim: &NodeClaim) -> Result<Action, LifecycleError> {
    let provider_id = claim.provider_id().unwrap_or_default().to_string();
    let node = ctx
        .state
        .node_by_provider_id(&provider_id)
        .and_then(|s| s.node);

    let mut drift_reason = ctx.provider.is_drifted(claim).await.unwrap_or_default();
    if drift_reason.is_none()
        && let Some(node) = node.as_ref()
    {
        drift_reason = drift::statically_drifted(claim, node);
    }

    let mut status = claim.status.clone().unwrap_or_default();
    let mut changed = false;
    if let Some(reason) = drift_reason {
        changed |= set_condition(
            &mut status.conditions,
            condition::DRIFTED,
            true,
            "Drifted",
            &reason,
            Utc::now(),
        );
        if changed {
            info!(claim = %claim.name_any(), %reason, "claim drifted");
            ctx.metrics
                .nodeclaims_disrupted_total
                .get_or_create(&ReasonLabels::new("drift"))
                .inc();
            ctx.metrics
                .status_condition_transitions_total
                .get_or_create(&ReasonLabels::new(condition::DRIFTED))
                .inc();
        }
    }
    if drift::is_expired(claim, Utc::now()) {
        let newly = set_condition(
            &mut status.conditions,
            condition::EXPIRED,
            true,
            "Expired",
            "",
            Utc::now(),
        );
        if newly {
            ctx.metrics
                .nodeclaims_disrupted_total
                .get_or_create(&ReasonLabels::new("expiration"))
                .inc();
            ctx.metrics
                .status_condition_transitions_total
                .get_or_create(&ReasonLabels::new(condition::EXPIRED))
                .inc();
        }
        changed |= newly;
    }
    if changed {
        patch_claim_status(ctx, &claim.name_any(), &status).await?;
    }
    Ok(Action::requeue(ctx.settings.drift_interval()))
}

async fn handle_termination(ctx: &Context, claim: &NodeClaim) -> Result<Action, LifecycleError> {
    let now = Utc::now();
    let provider_id = claim.provider_id().map(String::from);
    let state_node = provider_id
        .as_deref()
        .and_then(|id| ctx.state.node_by_provider_id(id));
    let node = state_node.as_ref().and_then(|s| s.node.clone());

    if let Some(node) = node.as_ref() {
        let node_name = node.name_any();
        // Fence the node off before draining it.
        let mut taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        if !labels::has_disrupted_taint(&taints) {
            taints.push(labels::disrupted_taint());
            ctx.nodes()
                .patch(
                    &node_name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({"spec": {"taints": taints}})),
                )
                .await?;
            ctx.events
                .publish(
                    &object_ref("Node", "v1", &node_name, None, None),
                    Reason::Disrupted,
                    format!("draining for node claim {}", claim.name_any()),
                )
                .await;
        }

        let pods = ctx.state.pods_on_node(&node_name);
        let plan = plan_drain(
            claim,
            &node_name,
            provider_id.as_deref().unwrap_or_default(),
            &pods,
            now,
        );
        let pdb_blocked = pods
            .iter()
            .filter(|p| {
                ctx.state.pdbs_matching(p).iter().any(|pdb| {
                    pdb.status.as_ref().map(|s| s.disruptions_allowed) == Some(0)
                })
            })
            .count();
        if pdb_blocked > 0 {
            debug!(node = %node_name, blocked = pdb_blocked, "pods held by exhausted disruption budgets");
        }
        for request in &plan.evict {
            ctx.eviction_queue.enqueue(request.clone());
        }
        if plan.deadline_pressure {
            ctx.events
                .publish(
                    &object_ref("Node", "v1", &node_name, None, None),
                    Reason::TerminationGracePeriodExpiring,
                    format!(
                        "{} pods force-deleted with clamped grace periods",
                        plan.pre_delete.len()
                    ),
                )
                .await;
        }
        for (pod_key, grace) in &plan.pre_delete {
            let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &pod_key.namespace);
            let dp = DeleteParams {
                grace_period_seconds: Some((*grace).max(0) as u32),
                ..Default::default()
            };
            match pods_api.delete(&pod_key.name, &dp).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !plan.is_drained() {
            debug!(node = %node_name, remaining = plan.remaining, "drain in progress");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
        if ctx.state.volume_attachments_on(&node_name) > 0 {
            debug!(node = %node_name, "waiting for volume attachments to detach");
            return Ok(Action::requeue(Duration::from_secs(5)));
        }
    }

    // Drained (or no node ever registered): release the instance.
    if let Some(id) = provider_id {
        match ctx.provider.delete(&ProviderId(id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(node) = node.as_ref() {
        match ctx
            .nodes()
            .delete(&node.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    remove_finalizer(ctx, claim).await?;
    ctx.state.delete_node_claim(&claim.name_any());
    ctx.metrics
        .nodeclaims_terminated_total
        .get_or_create(&PoolLabels {
            nodepool: claim.spec.node_pool.clone(),
        })
        .inc();
    info!(claim = %claim.name_any(), "terminated");
    Ok(Action::await_change())
}

pub async fn reconcile(claim: Arc<NodeClaim>, ctx: Arc<Context>) -> Result<Action, LifecycleError> {
    if claim.is_terminating() {
        return handle_termination(&ctx, &claim).await;
    }
    ensure_finalizer(&ctx, &claim).await?;
    if !claim.is_launched() {
        return handle_launch(&ctx, &claim).await;
    }
    if !claim.is_registered() {
        return handle_registration(&ctx, &claim).await;
    }
    if !claim.is_initialized() {
        return handle_initialization(&ctx, &claim).await;
    }
    handle_settled(&ctx, &claim).await
}

pub fn error_policy(claim: Arc<NodeClaim>, error: &LifecycleError, _ctx: Arc<Context>) -> Action {
    warn!(claim = %claim.name_any(), %error, "reconcile failed");
    Action::requeue(Duration::from_secs(15))
}

/// Run the claim controller until shutdown.
pub async fn run(ctx: Arc<Context>) {
    let claims: Api<NodeClaim> = Api::all(ctx.client.clone());
    Controller::new(claims, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures_util::future::ready(()))
        .await;
}

/// Periodic sweep reconciling the provider's inventory against the cluster.
pub async fn run_garbage_collection(
    ctx: Arc<Context>,
    mut shutdown: tokio_watch::Receiver<bool>,
) {
    let interval = ctx.settings.gc_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        if let Err(error) = collect_garbage(&ctx).await {
            error!(%error, "garbage collection sweep failed");
        }
    }
}

async fn collect_garbage(ctx: &Context) -> Result<(), LifecycleError> {
    let instances = ctx.provider.list().await?;
    let snapshot = ctx.state.snapshot();
    let known: HashSet<String> = snapshot
        .nodes
        .iter()
        .filter(|s| s.node_claim.is_some())
        .filter_map(|s| s.provider_id().map(String::from))
        .collect();
    let now = Utc::now();

    for instance in instances {
        let node_ready = snapshot
            .nodes
            .iter()
            .find(|s| s.provider_id() == Some(instance.provider_id.0.as_str()))
            .and_then(|s| s.node.as_ref())
            .map(initialization::is_node_ready)
            .unwrap_or(false);
        if garbagecollect::is_orphan(
            &instance,
            &known,
            node_ready,
            ctx.settings.orphan_grace(),
            now,
        ) {
            warn!(provider_id = %instance.provider_id, "deleting orphaned instance");
            match ctx.provider.delete(&instance.provider_id).await {
                Ok(()) => {
                    ctx.metrics
                        .nodeclaims_disrupted_total
                        .get_or_create(&ReasonLabels::new("garbage_collection"))
                        .inc();
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
