//! The NodePool custom resource: a user-authored template describing the
//! universe of acceptable instances plus disruption policy.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::apis::nodeclaim::{requirements_from_specs, NodeClaimRequirement};
use crate::apis::{condition_is_true, find_condition};
use crate::scheduling::requirements::{RequirementError, Requirements};

pub mod condition {
    pub const READY: &str = "Ready";
    pub const NODE_REGISTRATION_HEALTHY: &str = "NodeRegistrationHealthy";
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub enum ConsolidationPolicy {
    WhenEmpty,
    #[default]
    WhenEmptyOrUnderutilized,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudget {
    /// Number or percentage of nodes that may be disrupted at once.
    pub nodes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasons: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disruption {
    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidate_after_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub budgets: Vec<DisruptionBudget>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<NodeClaimRequirement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<Taint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_taints: Option<Vec<Taint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplate {
    #[serde(default)]
    pub metadata: NodeClaimTemplateMeta,
    #[serde(default)]
    pub spec: NodeClaimTemplateSpec,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "karpenter.sh", version = "v1", kind = "NodePool")]
#[kube(status = "NodePoolStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Pools are consulted in descending weight order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
    /// Aggregate resource ceiling across all nodes owned by this pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, Quantity>>,
    pub template: NodeClaimTemplate,
    #[serde(default)]
    pub disruption: Disruption,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Resources currently provisioned under this pool.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Quantity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodePool {
    pub fn weight(&self) -> i32 {
        self.spec.weight.unwrap_or(0)
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

    /// Pools default to ready; only an explicit `Ready=False` (set when the
    /// pool has no admissible instance types at all) takes them out of
    /// rotation.
    pub fn is_ready(&self) -> bool {
        match self.condition(condition::READY) {
            Some(c) => c.status == super::CONDITION_TRUE,
            None => true,
        }
    }

    pub fn is_registration_healthy(&self) -> bool {
        condition_is_true(self.conditions(), condition::NODE_REGISTRATION_HEALTHY)
    }

    pub fn template_requirements(&self) -> Result<Requirements, RequirementError> {
        requirements_from_specs(&self.spec.template.spec.requirements)
    }

    pub fn taints(&self) -> &[Taint] {
        self.spec.template.spec.taints.as_deref().unwrap_or_default()
    }

    pub fn startup_taints(&self) -> &[Taint] {
        self.spec
            .template
            .spec
            .startup_taints
            .as_deref()
            .unwrap_or_default()
    }
}
