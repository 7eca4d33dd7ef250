//! Well-known label keys, taints and annotations.
//!
//! These strings are a stable contract with node pools, cloud providers and
//! users; renaming any of them is a breaking change.

use k8s_openapi::api::core::v1::Taint;

pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const ARCH_LABEL: &str = "kubernetes.io/arch";
pub const OS_LABEL: &str = "kubernetes.io/os";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const REGION_LABEL: &str = "topology.kubernetes.io/region";

pub const NODE_POOL_LABEL: &str = "karpenter.sh/nodepool";
pub const CAPACITY_TYPE_LABEL: &str = "karpenter.sh/capacity-type";
pub const REGISTERED_LABEL: &str = "karpenter.sh/registered";
pub const INITIALIZED_LABEL: &str = "karpenter.sh/initialized";

pub const CAPACITY_TYPE_SPOT: &str = "spot";
pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
pub const CAPACITY_TYPE_RESERVED: &str = "reserved";

/// NoExecute taint applied at launch; removed when the backing node has
/// registered and its labels/taints have been synced.
pub const UNREGISTERED_TAINT_KEY: &str = "karpenter.sh/unregistered";
/// NoSchedule taint applied when a node begins draining.
pub const DISRUPTED_TAINT_KEY: &str = "karpenter.sh/disrupted";

pub const DO_NOT_DISRUPT_ANNOTATION: &str = "karpenter.sh/do-not-disrupt";
pub const TERMINATION_FINALIZER: &str = "karpenter.sh/termination";

/// Annotation kubelet puts on mirror (static) pods.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub const NO_SCHEDULE: &str = "NoSchedule";
pub const NO_EXECUTE: &str = "NoExecute";
pub const PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";

pub fn unregistered_taint() -> Taint {
    Taint {
        key: UNREGISTERED_TAINT_KEY.to_string(),
        effect: NO_EXECUTE.to_string(),
        ..Default::default()
    }
}

pub fn disrupted_taint() -> Taint {
    Taint {
        key: DISRUPTED_TAINT_KEY.to_string(),
        effect: NO_SCHEDULE.to_string(),
        ..Default::default()
    }
}

/// Label keys in the `karpenter.sh` namespace that users and pods may
/// legitimately select on. Anything else under that prefix is reserved for
/// the controller and is rejected at scheduling time.
pub fn is_restricted(key: &str) -> bool {
    let reserved = key == REGISTERED_LABEL || key == INITIALIZED_LABEL;
    let in_namespace = key.starts_with("karpenter.sh/");
    in_namespace && (reserved || !(key == NODE_POOL_LABEL || key == CAPACITY_TYPE_LABEL))
}

/// True when `taints` contains the disrupted no-schedule taint.
pub fn has_disrupted_taint(taints: &[Taint]) -> bool {
    taints
        .iter()
        .any(|t| t.key == DISRUPTED_TAINT_KEY && t.effect == NO_SCHEDULE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodepool_and_capacity_type_are_selectable() {
        assert!(!is_restricted(NODE_POOL_LABEL));
        assert!(!is_restricted(CAPACITY_TYPE_LABEL));
    }

    #[test]
    fn controller_internal_labels_are_restricted() {
        assert!(is_restricted(REGISTERED_LABEL));
        assert!(is_restricted(INITIALIZED_LABEL));
        assert!(is_restricted("karpenter.sh/something-else"));
    }

    #[test]
    fn foreign_domains_are_unrestricted() {
        assert!(!is_restricted(ZONE_LABEL));
        assert!(!is_restricted("example.com/team"));
    }
}
