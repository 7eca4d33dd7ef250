//! The NodeClaim custom resource.
//!
//! A NodeClaim is an in-cluster request for one cloud instance and the unit
//! of lifecycle bookkeeping. It is created by the provisioner, resolved by a
//! cloud provider launch, paired with a Node at registration, and torn down
//! through the termination flow.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::{condition_is_true, find_condition};
use crate::scheduling::requirements::{Requirement, RequirementError, Requirements};

/// Lifecycle condition types. Transitions through these are monotonic for a
/// healthy claim; only drift-triggered replacement walks them back.
pub mod condition {
    pub const LAUNCHED: &str = "Launched";
    pub const REGISTERED: &str = "Registered";
    pub const INITIALIZED: &str = "Initialized";
    pub const DRIFTED: &str = "Drifted";
    pub const EXPIRED: &str = "Expired";
    pub const READY: &str = "Ready";
    pub const DISRUPTION_REASON: &str = "DisruptionReason";
}

/// A single scheduling requirement as persisted on claims and pools. The
/// shape mirrors a node-selector expression plus the MinValues flexibility
/// hint.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimRequirement {
    pub key: String,
    pub operator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_values: Option<usize>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "karpenter.sh", version = "v1", kind = "NodeClaim")]
#[kube(status = "NodeClaimStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Name of the owning NodePool.
    pub node_pool: String,
    /// Requirements the launched instance must satisfy. Internally
    /// consistent: every key keeps at least one admissible value.
    pub requirements: Vec<NodeClaimRequirement>,
    /// Sum of the scheduled pods' requests plus daemon overhead.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Quantity>,
    /// Taints carried over from the pool template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<Taint>>,
    /// Taints removed once the node has registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_taints: Option<Vec<Taint>>,
    /// Hard deadline for draining once termination begins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    /// Age after which the claim is marked Expired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Cloud-provider instance identifier; exactly one once launched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Name of the backing Node once registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaim {
    pub fn provider_id(&self) -> Option<&str> {
        self.status.as_ref()?.provider_id.as_deref()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(self.conditions(), type_)
    }

    pub fn is_launched(&self) -> bool {
        condition_is_true(self.conditions(), condition::LAUNCHED)
    }

    pub fn is_registered(&self) -> bool {
        condition_is_true(self.conditions(), condition::REGISTERED)
    }

    pub fn is_initialized(&self) -> bool {
        condition_is_true(self.conditions(), condition::INITIALIZED)
    }

    pub fn is_drifted(&self) -> bool {
        condition_is_true(self.conditions(), condition::DRIFTED)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// How long since the claim was launched, for the registration liveness
    /// check.
    pub fn launched_at(&self) -> Option<DateTime<Utc>> {
        self.condition(condition::LAUNCHED)
            .filter(|c| c.status == super::CONDITION_TRUE)
            .map(|c| super::time_to_chrono(&c.last_transition_time))
    }

    /// The drain reason recorded by the disruption flow, surfaced in
    /// eviction messages.
    pub fn disruption_reason(&self) -> Option<&str> {
        self.condition(condition::DISRUPTION_REASON)
            .filter(|c| c.status == super::CONDITION_TRUE)
            .map(|c| c.reason.as_str())
    }

    /// Scheduling requirements parsed into algebra form.
    pub fn requirements(&self) -> Result<Requirements, RequirementError> {
        requirements_from_specs(&self.spec.requirements)
    }
}

pub fn requirements_from_specs(
    specs: &[NodeClaimRequirement],
) -> Result<Requirements, RequirementError> {
    let mut out = Requirements::new();
    for spec in specs {
        let expr = k8s_openapi::api::core::v1::NodeSelectorRequirement {
            key: spec.key.clone(),
            operator: spec.operator.clone(),
            values: spec.values.clone(),
        };
        out.add(Requirement::try_from_expression(&expr, spec.min_values)?);
    }
    Ok(out)
}

pub fn requirement_specs_from(requirements: &Requirements) -> Vec<NodeClaimRequirement> {
    let min_values: BTreeMap<&str, usize> = requirements.min_values().collect();
    requirements
        .node_selector_requirements()
        .into_iter()
        .map(|expr| NodeClaimRequirement {
            min_values: min_values.get(expr.key.as_str()).copied(),
            key: expr.key,
            operator: expr.operator,
            values: expr.values,
        })
        .collect()
}
