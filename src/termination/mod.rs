//! Drain orchestration for terminating nodes.
//!
//! Draining walks pods off a node in blast-radius order, feeds them through
//! the eviction queue, and falls back to direct deletion with a clamped
//! grace period once the node's own termination deadline would cut a pod's
//! graceful window short anyway.

pub mod eviction;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::apis::NodeClaim;
use crate::scheduling::pod::{self, PodKey};
use crate::termination::eviction::{EvictionKey, EvictionRequest, DEFAULT_REASON};

/// Eviction order: pods whose loss hurts least go first, so cluster-critical
/// workloads keep running while the rest of the node empties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainGroup {
    NonCriticalNonDaemon,
    NonCriticalDaemon,
    CriticalNonDaemon,
    CriticalDaemon,
}

pub fn drain_group(p: &Pod) -> DrainGroup {
    match (pod::is_critical(p), pod::is_owned_by_daemonset(p)) {
        (false, false) => DrainGroup::NonCriticalNonDaemon,
        (false, true) => DrainGroup::NonCriticalDaemon,
        (true, false) => DrainGroup::CriticalNonDaemon,
        (true, true) => DrainGroup::CriticalDaemon,
    }
}

/// The node's hard termination deadline, if the claim carries one.
pub fn node_deadline(claim: &NodeClaim) -> Option<DateTime<Utc>> {
    let deleted_at = crate::apis::time_to_chrono(claim.metadata.deletion_timestamp.as_ref()?);
    let grace = claim.spec.termination_grace_period_seconds?;
    Some(deleted_at + Duration::seconds(grace))
}

/// Grace period to pre-delete a pod with, when its own grace period would
/// overrun the node deadline. The node is going away regardless; this gives
/// the pod the longest graceful window that still fits.
pub fn clamped_grace_seconds(
    p: &Pod,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<i64> {
    let remaining = (deadline - now).num_seconds().max(0);
    (pod::termination_grace_seconds(p) > remaining).then_some(remaining)
}

/// One drain evaluation, pure: what to evict now, what to pre-delete, and
/// how many pods still hold the node.
#[derive(Debug, Default)]
pub struct DrainPlan {
    pub evict: Vec<EvictionRequest>,
    /// (pod, gracePeriodSeconds) pairs deleted directly, bypassing both the
    /// disruption budget and the do-not-disrupt annotation.
    pub pre_delete: Vec<(PodKey, i64)>,
    /// Evictable or still-terminating pods that keep the drain in progress.
    pub remaining: usize,
    /// True when the pre-delete path fired because the node deadline is
    /// closing in; the caller surfaces this as an event.
    pub deadline_pressure: bool,
}

impl DrainPlan {
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }
}

pub fn plan_drain(
    claim: &NodeClaim,
    node_name: &str,
    provider_id: &str,
    pods: &[Pod],
    now: DateTime<Utc>,
) -> DrainPlan {
    let deadline = node_deadline(claim);
    let reason = claim
        .disruption_reason()
        .unwrap_or(DEFAULT_REASON)
        .to_string();

    let mut plan = DrainPlan::default();
    let mut current_group: Option<DrainGroup> = None;

    let mut ordered: Vec<&Pod> = pods.iter().collect();
    ordered.sort_by_key(|p| drain_group(p));

    for p in ordered {
        if pod::classify(p, now) == pod::PodDisposition::Terminal {
            continue;
        }
        if p.metadata.deletion_timestamp.is_some() {
            // Already on its way out; it still holds the node.
            plan.remaining += 1;
            continue;
        }
        if !pod::is_evictable(p, now) {
            continue;
        }
        plan.remaining += 1;

        if let Some(deadline) = deadline
            && let Some(grace) = clamped_grace_seconds(p, deadline, now)
        {
            plan.pre_delete.push((PodKey::from_pod(p), grace));
            plan.deadline_pressure = true;
            continue;
        }
        // The annotation defers voluntary eviction; the deadline path above
        // still catches the pod eventually.
        if pod::has_do_not_disrupt(p) {
            continue;
        }

        // Evict one group at a time.
        let group = drain_group(p);
        match current_group {
            None => current_group = Some(group),
            Some(g) if g != group => continue,
            Some(_) => {}
        }
        plan.evict.push(EvictionRequest {
            key: EvictionKey {
                namespace: p.metadata.namespace.clone().unwrap_or_default(),
                name: p.metadata.name.clone().unwrap_or_default(),
                uid: p.metadata.uid.clone().unwrap_or_default(),
                provider_id: provider_id.to_string(),
            },
            node_name: node_name.to_string(),
            reason: reason.clone(),
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodeclaim::NodeClaimSpec;
    use crate::scheduling::labels::DO_NOT_DISRUPT_ANNOTATION;
    use crate::scheduling::pod::{SYSTEM_CLUSTER_CRITICAL, SYSTEM_NODE_CRITICAL};
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn plain_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".into()),
                termination_grace_period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn daemon_pod(name: &str) -> Pod {
        let mut p = plain_pod(name);
        p.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".into(),
            controller: Some(true),
            ..Default::default()
        }]);
        p
    }

    fn critical_pod(name: &str, class: &str) -> Pod {
        let mut p = plain_pod(name);
        p.spec.as_mut().unwrap().priority_class_name = Some(class.into());
        p
    }

    fn deleting_claim(grace: Option<i64>, deleted_ago_seconds: i64) -> NodeClaim {
        let mut claim = NodeClaim::new(
            "claim-a",
            NodeClaimSpec {
                node_pool: "default".into(),
                requirements: vec![],
                resources: BTreeMap::new(),
                taints: None,
                startup_taints: None,
                termination_grace_period_seconds: grace,
                expire_after_seconds: None,
            },
        );
        claim.metadata.deletion_timestamp =
            Some(crate::apis::chrono_to_time(Utc::now() - Duration::seconds(deleted_ago_seconds)));
        claim
    }

    #[test]
    fn groups_order_by_blast_radius() {
        assert!(drain_group(&plain_pod("a")) < drain_group(&daemon_pod("b")));
        assert!(
            drain_group(&daemon_pod("b"))
                < drain_group(&critical_pod("c", SYSTEM_CLUSTER_CRITICAL))
        );
        let mut critical_daemon = daemon_pod("d");
        critical_daemon.spec.as_mut().unwrap().priority_class_name =
            Some(SYSTEM_NODE_CRITICAL.into());
        assert_eq!(drain_group(&critical_daemon), DrainGroup::CriticalDaemon);
    }

    #[test]
    fn evicts_lowest_group_first() {
        let claim = deleting_claim(None, 0);
        let pods = vec![
            plain_pod("app"),
            daemon_pod("agent"),
            critical_pod("dns", SYSTEM_CLUSTER_CRITICAL),
        ];
        let plan = plan_drain(&claim, "node-a", "fake://i-1", &pods, Utc::now());
        assert_eq!(plan.evict.len(), 1);
        assert_eq!(plan.evict[0].key.name, "app");
        assert_eq!(plan.remaining, 3);
    }

    #[test]
    fn do_not_disrupt_pods_are_not_evicted() {
        let claim = deleting_claim(None, 0);
        let mut protected = plain_pod("protected");
        protected.metadata.annotations = Some(BTreeMap::from([(
            DO_NOT_DISRUPT_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        let plan = plan_drain(&claim, "node-a", "fake://i-1", &[protected], Utc::now());
        assert!(plan.evict.is_empty());
        assert!(plan.pre_delete.is_empty());
        assert_eq!(plan.remaining, 1);
    }

    #[test]
    fn deadline_clamps_long_grace_periods_and_bypasses_annotations() {
        // Node deleted 50s ago with a 60s grace: 10s remain.
        let claim = deleting_claim(Some(60), 50);
        let mut slow = plain_pod("slow");
        slow.spec.as_mut().unwrap().termination_grace_period_seconds = Some(600);
        slow.metadata.annotations = Some(BTreeMap::from([(
            DO_NOT_DISRUPT_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        let plan = plan_drain(&claim, "node-a", "fake://i-1", &[slow], Utc::now());
        assert!(plan.evict.is_empty());
        assert_eq!(plan.pre_delete.len(), 1);
        let (_, grace) = &plan.pre_delete[0];
        assert!(*grace <= 10 && *grace >= 8, "clamped grace was {grace}");
        assert!(plan.deadline_pressure);
    }

    #[test]
    fn terminating_pods_hold_the_node_without_reeviction() {
        let claim = deleting_claim(None, 0);
        let mut leaving = plain_pod("leaving");
        leaving.metadata.deletion_timestamp = Some(crate::apis::chrono_to_time(Utc::now()));
        let plan = plan_drain(&claim, "node-a", "fake://i-1", &[leaving], Utc::now());
        assert!(plan.evict.is_empty());
        assert_eq!(plan.remaining, 1);
    }

    #[test]
    fn empty_node_is_drained() {
        let claim = deleting_claim(None, 0);
        let plan = plan_drain(&claim, "node-a", "fake://i-1", &[], Utc::now());
        assert!(plan.is_drained());
    }

    #[test]
    fn reason_comes_from_disruption_condition() {
        let mut claim = deleting_claim(None, 0);
        let mut status = crate::apis::nodeclaim::NodeClaimStatus::default();
        crate::apis::set_condition(
            &mut status.conditions,
            crate::apis::nodeclaim::condition::DISRUPTION_REASON,
            true,
            "Drifted",
            "",
            Utc::now(),
        );
        claim.status = Some(status);
        let plan = plan_drain(&claim, "node-a", "fake://i-1", &[plain_pod("a")], Utc::now());
        assert_eq!(plan.evict[0].reason, "Drifted");

        let plain = deleting_claim(None, 0);
        let plan = plan_drain(&plain, "node-a", "fake://i-1", &[plain_pod("a")], Utc::now());
        assert_eq!(plan.evict[0].reason, DEFAULT_REASON);
    }
}
