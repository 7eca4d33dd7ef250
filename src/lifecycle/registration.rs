//! Registration: pair the claim with its node and make the node schedulable.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Taint};

use crate::apis::NodeClaim;
use crate::scheduling::labels;

pub fn node_matches(claim: &NodeClaim, node: &Node) -> bool {
    let claim_id = claim.provider_id();
    let node_id = node.spec.as_ref().and_then(|s| s.provider_id.as_deref());
    claim_id.is_some() && claim_id == node_id
}

/// Labels the node must carry after registration: the claim's resolved
/// labels plus the registered marker.
pub fn registered_labels(claim: &NodeClaim, node: &Node) -> BTreeMap<String, String> {
    let mut out = node.metadata.labels.clone().unwrap_or_default();
    for (k, v) in claim.metadata.labels.clone().unwrap_or_default() {
        out.insert(k, v);
    }
    out.insert(labels::REGISTERED_LABEL.to_string(), "true".to_string());
    out
}

/// Taints the node must carry after registration: the claim's declared
/// taints, with the unregistered startup taint lifted and any taints other
/// controllers added left alone.
pub fn registered_taints(claim: &NodeClaim, node: &Node) -> Vec<Taint> {
    let mut out: Vec<Taint> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.key != labels::UNREGISTERED_TAINT_KEY)
        .collect();
    for taint in claim.spec.taints.clone().unwrap_or_default() {
        if !out.iter().any(|t| t.key == taint.key && t.effect == taint.effect) {
            out.push(taint);
        }
    }
    out
}
