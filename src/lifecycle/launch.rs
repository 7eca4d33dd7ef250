//! Launch: claim → cloud instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::apis::nodeclaim::{condition, NodeClaimStatus};
use crate::apis::{set_condition, NodeClaim};
use crate::cloudprovider::types::CreatedInstance;
use crate::scheduling::labels;

/// Status document recorded after a successful provider create: exactly one
/// provider ID, resolved capacity, and the Launched condition.
pub fn launched_status(
    claim: &NodeClaim,
    instance: &CreatedInstance,
    now: DateTime<Utc>,
) -> NodeClaimStatus {
    let mut status = claim.status.clone().unwrap_or_default();
    status.provider_id = Some(instance.provider_id.0.clone());
    status.image_id = Some(instance.image_id.clone());
    status.capacity = instance.capacity.clone();
    status.allocatable = instance.allocatable.clone();
    set_condition(
        &mut status.conditions,
        condition::LAUNCHED,
        true,
        "Launched",
        &format!("launched {}", instance.provider_id),
        now,
    );
    status
}

/// Labels the launch resolves onto the claim: what the instance reports,
/// plus every single-valued requirement, plus the pool identity.
pub fn resolved_labels(claim: &NodeClaim, instance: &CreatedInstance) -> BTreeMap<String, String> {
    let mut out = claim.metadata.labels.clone().unwrap_or_default();
    if let Ok(requirements) = claim.requirements() {
        for (k, v) in requirements.labels() {
            out.insert(k, v);
        }
    }
    for (k, v) in &instance.labels {
        out.insert(k.clone(), v.clone());
    }
    out.insert(
        labels::NODE_POOL_LABEL.to_string(),
        claim.spec.node_pool.clone(),
    );
    out
}
