//! Initialization: the node is Ready and everything the instance promised
//! has actually been registered by device plugins.

use k8s_openapi::api::core::v1::Node;

use crate::apis::NodeClaim;

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Extended resources (GPUs and friends) appear in node allocatable only
/// after their device plugin starts. Until every resource the claim's
/// capacity promises is visible, pods requesting them would be rejected by
/// the kubelet, so the node is not initialized.
pub fn extended_resources_registered(claim: &NodeClaim, node: &Node) -> bool {
    let Some(status) = claim.status.as_ref() else {
        return true;
    };
    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.clone())
        .unwrap_or_default();
    status
        .capacity
        .keys()
        .all(|resource| allocatable.contains_key(resource))
}

pub fn is_initialized(claim: &NodeClaim, node: &Node) -> bool {
    is_node_ready(node) && extended_resources_registered(claim, node)
}
