//! Drift detection: a node whose realized configuration no longer matches
//! what its claim asked for is a candidate for replacement. Drift is not an
//! error; it is a status condition the disruption flow consumes.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;

use crate::apis::NodeClaim;
use crate::scheduling::requirements::Requirements;

pub const REASON_REQUIREMENTS: &str = "RequirementsDrifted";
pub const REASON_EXPIRED: &str = "Expired";

/// Cluster-side drift: the node's labels stopped satisfying the claim's
/// requirements (a controller relabeled it, or the claim spec changed).
/// Provider-side drift (image, instance shape) comes from `is_drifted` on
/// the cloud provider and is OR'd in by the reconciler.
pub fn statically_drifted(claim: &NodeClaim, node: &Node) -> Option<String> {
    let requirements = claim.requirements().ok()?;
    let node_labels = node.metadata.labels.clone().unwrap_or_default();
    let node_requirements = Requirements::from_labels(&node_labels);
    match requirements.compatible(&node_requirements) {
        Ok(()) => None,
        Err(e) => Some(format!("{REASON_REQUIREMENTS}: {e}")),
    }
}

/// Age-based expiry configured on the claim (carried from the pool's
/// disruption block).
pub fn is_expired(claim: &NodeClaim, now: DateTime<Utc>) -> bool {
    let Some(expire_after) = claim.spec.expire_after_seconds else {
        return false;
    };
    let Some(created_at) = claim.metadata.creation_timestamp.as_ref() else {
        return false;
    };
    now.signed_duration_since(crate::apis::time_to_chrono(created_at))
        >= chrono::Duration::seconds(expire_after)
}
