//! Pod classification.
//!
//! Every control loop asks the same handful of questions about pods, so the
//! answers are computed once per pass from pod state and the wall clock,
//! never stored back onto the pod.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::scheduling::labels::{DO_NOT_DISRUPT_ANNOTATION, MIRROR_POD_ANNOTATION};

pub const SYSTEM_CLUSTER_CRITICAL: &str = "system-cluster-critical";
pub const SYSTEM_NODE_CRITICAL: &str = "system-node-critical";

/// Identity of a pod, stable across informer re-deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PodKey {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One value per pod per pass; the predicates below derive from it plus pod
/// shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodDisposition {
    /// Succeeded or Failed; occupies no resources.
    Terminal,
    /// Deletion timestamp set, grace period exhausted, still around.
    StuckTerminating,
    /// Deletion timestamp set, within its grace period.
    Terminating,
    /// Everything else.
    Active,
}

pub fn classify(pod: &Pod, now: DateTime<Utc>) -> PodDisposition {
    if is_terminal(pod) {
        return PodDisposition::Terminal;
    }
    match pod.metadata.deletion_timestamp.as_ref() {
        None => PodDisposition::Active,
        Some(deleted_at) => {
            let grace = pod
                .spec
                .as_ref()
                .and_then(|s| s.termination_grace_period_seconds)
                .unwrap_or(30);
            let deadline = crate::apis::time_to_chrono(deleted_at) + Duration::seconds(grace);
            if now > deadline {
                PodDisposition::StuckTerminating
            } else {
                PodDisposition::Terminating
            }
        }
    }
}

pub fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

pub fn is_scheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| !n.is_empty())
}

pub fn is_mirror(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
}

pub fn is_owned_by_daemonset(pod: &Pod) -> bool {
    owner_kind(pod) == Some("DaemonSet")
}

fn owner_kind(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.kind.as_str())
}

/// Pods that report themselves unschedulable via the scheduler's
/// PodScheduled=False/Unschedulable condition.
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

/// A pod the provisioner should try to place on a new or existing node:
/// pending, unschedulable, and not something another controller will handle.
/// DaemonSet pods target every node including ones that cannot run them;
/// launching capacity for them satisfies nothing.
pub fn is_provisionable(pod: &Pod, now: DateTime<Utc>) -> bool {
    classify(pod, now) == PodDisposition::Active
        && !is_scheduled(pod)
        && is_unschedulable(pod)
        && !is_owned_by_daemonset(pod)
        && !is_mirror(pod)
}

/// A pod whose requests should count against its node.
pub fn is_consuming(pod: &Pod, now: DateTime<Utc>) -> bool {
    classify(pod, now) != PodDisposition::Terminal && is_scheduled(pod)
}

/// A pod that would land somewhere else if its node went away.
pub fn is_reschedulable(pod: &Pod, now: DateTime<Utc>) -> bool {
    is_consuming(pod, now) && !is_owned_by_daemonset(pod) && !is_mirror(pod)
}

/// A pod the drain logic must actively evict: still running, not a mirror
/// pod (the kubelet owns those), not already terminal.
pub fn is_evictable(pod: &Pod, now: DateTime<Utc>) -> bool {
    matches!(
        classify(pod, now),
        PodDisposition::Active | PodDisposition::StuckTerminating
    ) && !is_mirror(pod)
}

pub fn has_do_not_disrupt(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DO_NOT_DISRUPT_ANNOTATION))
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub fn is_critical(pod: &Pod) -> bool {
    matches!(
        pod.spec.as_ref().and_then(|s| s.priority_class_name.as_deref()),
        Some(SYSTEM_CLUSTER_CRITICAL) | Some(SYSTEM_NODE_CRITICAL)
    )
}

pub fn termination_grace_seconds(pod: &Pod) -> i64 {
    pod.spec
        .as_ref()
        .and_then(|s| s.termination_grace_period_seconds)
        .unwrap_or(30)
}
