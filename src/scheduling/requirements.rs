//! Set algebra over labeled scheduling constraints.
//!
//! A [`Requirement`] describes the admissible values for one label key; a
//! [`Requirements`] maps keys to requirements with at most one entry per key.
//! Intersection is the workhorse: the scheduler narrows a candidate node by
//! intersecting pod, pool and instance-type requirements and checking that
//! every key keeps at least one admissible value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm, Pod};
use thiserror::Error;

use crate::scheduling::labels;

#[derive(Debug, PartialEq, Error)]
pub enum RequirementError {
    #[error("unsupported operator {0:?}")]
    UnsupportedOperator(String),

    #[error("operator {operator} on {key} requires exactly one integer value")]
    InvalidBound { key: String, operator: String },

    #[error("label {0} is restricted")]
    RestrictedLabel(String),

    #[error("incompatible requirements for {key}: {left} does not overlap {right}")]
    Incompatible {
        key: String,
        left: String,
        right: String,
    },
}

/// Admissible values for a single label key.
///
/// `complement = false` means `values` is the allowed set (`In`, or
/// `DoesNotExist` when empty). `complement = true` means `values` is the
/// excluded set (`NotIn`, or `Exists` when empty); numeric bounds only
/// further restrict a complement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    min_values: Option<usize>,
}

impl Requirement {
    pub fn new_in<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.to_string(),
            complement: false,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            min_values: None,
        }
    }

    pub fn not_in<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.to_string(),
            complement: true,
            values: values.into_iter().map(Into::into).collect(),
            greater_than: None,
            less_than: None,
            min_values: None,
        }
    }

    pub fn exists(key: &str) -> Self {
        Self::not_in::<_, String>(key, [])
    }

    pub fn does_not_exist(key: &str) -> Self {
        Self::new_in::<_, String>(key, [])
    }

    pub fn greater_than(key: &str, bound: i64) -> Self {
        Self {
            greater_than: Some(bound),
            ..Self::exists(key)
        }
    }

    pub fn less_than(key: &str, bound: i64) -> Self {
        Self {
            less_than: Some(bound),
            ..Self::exists(key)
        }
    }

    pub fn with_min_values(mut self, min_values: usize) -> Self {
        self.min_values = Some(min_values);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn min_values(&self) -> Option<usize> {
        self.min_values
    }

    /// Concrete admissible values. Empty for complements, whose universe is
    /// open-ended.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let concrete = !self.complement;
        self.values
            .iter()
            .map(String::as_str)
            .filter(move |_| concrete)
    }

    /// Number of concrete admissible values; `None` when the requirement is
    /// a complement and therefore unbounded.
    pub fn value_count(&self) -> Option<usize> {
        if self.complement {
            None
        } else {
            Some(self.values.len())
        }
    }

    fn bounds_empty(&self) -> bool {
        matches!((self.greater_than, self.less_than), (Some(gt), Some(lt)) if gt >= lt)
    }

    /// True when no value can ever satisfy this requirement.
    pub fn is_unsatisfiable(&self) -> bool {
        (!self.complement && self.values.is_empty()) || self.bounds_empty()
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        // Non-integer values never satisfy a numeric bound.
        let Ok(n) = value.parse::<i64>() else {
            return false;
        };
        if let Some(gt) = self.greater_than
            && n <= gt
        {
            return false;
        }
        if let Some(lt) = self.less_than
            && n >= lt
        {
            return false;
        }
        true
    }

    /// Membership test against the admissible set.
    pub fn has(&self, value: &str) -> bool {
        if !self.within_bounds(value) {
            return false;
        }
        if self.complement {
            !self.values.contains(value)
        } else {
            self.values.contains(value)
        }
    }

    /// Conjunction of two requirements for the same key.
    pub fn intersect(&self, other: &Requirement) -> Requirement {
        debug_assert_eq!(self.key, other.key);
        let complement = self.complement && other.complement;
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let values: BTreeSet<String> = match (self.complement, other.complement) {
            (false, false) => self.values.intersection(&other.values).cloned().collect(),
            (false, true) => self.values.difference(&other.values).cloned().collect(),
            (true, false) => other.values.difference(&self.values).cloned().collect(),
            (true, true) => self.values.union(&other.values).cloned().collect(),
        };
        let mut out = Requirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            min_values: match (self.min_values, other.min_values) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        };
        if !out.complement && (out.greater_than.is_some() || out.less_than.is_some()) {
            let (gt, lt) = (out.greater_than, out.less_than);
            out.values.retain(|v| {
                let Ok(n) = v.parse::<i64>() else {
                    return false;
                };
                gt.is_none_or(|g| n > g) && lt.is_none_or(|l| n < l)
            });
        }
        out
    }

    /// Project back to the Kubernetes expression form. A requirement that
    /// carries numeric bounds expands to one expression per bound.
    pub fn node_selector_requirements(&self) -> Vec<NodeSelectorRequirement> {
        let mut out = Vec::new();
        if self.complement {
            if !self.values.is_empty() {
                out.push(NodeSelectorRequirement {
                    key: self.key.clone(),
                    operator: "NotIn".to_string(),
                    values: Some(self.values.iter().cloned().collect()),
                });
            } else if self.greater_than.is_none() && self.less_than.is_none() {
                out.push(NodeSelectorRequirement {
                    key: self.key.clone(),
                    operator: "Exists".to_string(),
                    values: None,
                });
            }
        } else if self.values.is_empty() {
            out.push(NodeSelectorRequirement {
                key: self.key.clone(),
                operator: "DoesNotExist".to_string(),
                values: None,
            });
        } else {
            out.push(NodeSelectorRequirement {
                key: self.key.clone(),
                operator: "In".to_string(),
                values: Some(self.values.iter().cloned().collect()),
            });
        }
        if let Some(gt) = self.greater_than {
            out.push(NodeSelectorRequirement {
                key: self.key.clone(),
                operator: "Gt".to_string(),
                values: Some(vec![gt.to_string()]),
            });
        }
        if let Some(lt) = self.less_than {
            out.push(NodeSelectorRequirement {
                key: self.key.clone(),
                operator: "Lt".to_string(),
                values: Some(vec![lt.to_string()]),
            });
        }
        out
    }

    pub fn try_from_expression(
        expr: &NodeSelectorRequirement,
        min_values: Option<usize>,
    ) -> Result<Self, RequirementError> {
        let values = expr.values.clone().unwrap_or_default();
        let mut req = match expr.operator.as_str() {
            "In" => Self::new_in(&expr.key, values),
            "NotIn" => Self::not_in(&expr.key, values),
            "Exists" => Self::exists(&expr.key),
            "DoesNotExist" => Self::does_not_exist(&expr.key),
            "Gt" | "Lt" => {
                let bound = values
                    .first()
                    .filter(|_| values.len() == 1)
                    .and_then(|v| v.parse::<i64>().ok())
                    .ok_or_else(|| RequirementError::InvalidBound {
                        key: expr.key.clone(),
                        operator: expr.operator.clone(),
                    })?;
                if expr.operator == "Gt" {
                    Self::greater_than(&expr.key, bound)
                } else {
                    Self::less_than(&expr.key, bound)
                }
            }
            other => return Err(RequirementError::UnsupportedOperator(other.to_string())),
        };
        req.min_values = min_values;
        Ok(req)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<&str> = self.values.iter().map(String::as_str).collect();
        match (self.complement, values.is_empty()) {
            (false, true) => write!(f, "{} DoesNotExist", self.key)?,
            (false, false) => write!(f, "{} In {values:?}", self.key)?,
            (true, true) => write!(f, "{} Exists", self.key)?,
            (true, false) => write!(f, "{} NotIn {values:?}", self.key)?,
        }
        if let Some(gt) = self.greater_than {
            write!(f, " >{gt}")?;
        }
        if let Some(lt) = self.less_than {
            write!(f, " <{lt}")?;
        }
        Ok(())
    }
}

/// A conjunction of requirements, keyed by label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    inner: BTreeMap<String, Requirement>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_requirements<I: IntoIterator<Item = Requirement>>(reqs: I) -> Self {
        let mut out = Self::new();
        for r in reqs {
            out.add(r);
        }
        out
    }

    /// Requirements equivalent to a concrete label set: one single-value
    /// `In` per key.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self::from_requirements(
            labels
                .iter()
                .map(|(k, v)| Requirement::new_in(k, [v.clone()])),
        )
    }

    /// Fold in a requirement, intersecting with any existing entry for the
    /// same key. Only used while a Requirements is being constructed.
    pub fn add(&mut self, req: Requirement) {
        match self.inner.remove(req.key()) {
            Some(existing) => {
                let merged = existing.intersect(&req);
                self.inner.insert(merged.key.clone(), merged);
            }
            None => {
                self.inner.insert(req.key.clone(), req);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.inner.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.inner.values()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// True when the value is admissible for `key`; absent keys admit
    /// anything.
    pub fn has(&self, key: &str, value: &str) -> bool {
        self.inner.get(key).is_none_or(|r| r.has(value))
    }

    /// Conjunction of two requirement sets. Fails on the first key whose
    /// intersection admits no value.
    pub fn intersect(&self, other: &Requirements) -> Result<Requirements, RequirementError> {
        let mut out = self.clone();
        for (key, req) in &other.inner {
            match out.inner.get(key) {
                Some(existing) => {
                    let merged = existing.intersect(req);
                    if merged.is_unsatisfiable() {
                        return Err(RequirementError::Incompatible {
                            key: key.clone(),
                            left: existing.to_string(),
                            right: req.to_string(),
                        });
                    }
                    out.inner.insert(key.clone(), merged);
                }
                None => {
                    out.inner.insert(key.clone(), req.clone());
                }
            }
        }
        Ok(out)
    }

    /// Compatibility test: every shared key must keep a non-empty
    /// intersection. Keys known to only one side are accepted.
    pub fn compatible(&self, other: &Requirements) -> Result<(), RequirementError> {
        for (key, req) in &self.inner {
            if let Some(theirs) = other.inner.get(key) {
                let merged = req.intersect(theirs);
                if merged.is_unsatisfiable() {
                    return Err(RequirementError::Incompatible {
                        key: key.clone(),
                        left: req.to_string(),
                        right: theirs.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_compatible(&self, other: &Requirements) -> bool {
        self.compatible(other).is_ok()
    }

    /// Keys with exactly one admissible concrete value project to labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.inner
            .iter()
            .filter_map(|(k, r)| {
                (!r.complement && r.values.len() == 1)
                    .then(|| (k.clone(), r.values.first().cloned().unwrap_or_default()))
            })
            .collect()
    }

    /// All `MinValues` hints, keyed by label.
    pub fn min_values(&self) -> impl Iterator<Item = (&str, usize)> {
        self.inner
            .iter()
            .filter_map(|(k, r)| r.min_values.map(|m| (k.as_str(), m)))
    }

    /// Project the full set back to Kubernetes expressions, suitable for
    /// persisting to a node claim.
    pub fn node_selector_requirements(&self) -> Vec<NodeSelectorRequirement> {
        self.inner
            .values()
            .flat_map(Requirement::node_selector_requirements)
            .collect()
    }

    pub fn try_from_expressions(
        exprs: &[NodeSelectorRequirement],
    ) -> Result<Self, RequirementError> {
        let mut out = Self::new();
        for e in exprs {
            out.add(Requirement::try_from_expression(e, None)?);
        }
        Ok(out)
    }

    fn add_term(&mut self, term: &NodeSelectorTerm) -> Result<(), RequirementError> {
        for expr in term.match_expressions.as_deref().unwrap_or_default() {
            self.add(Requirement::try_from_expression(expr, None)?);
        }
        Ok(())
    }

    /// A pod's scheduling requirements: node selector, required node
    /// affinity, and the heaviest preferred node-affinity alternative.
    /// Restricted labels are rejected so a typo'd `karpenter.sh/...`
    /// selector surfaces as a scheduling error rather than a silent no-op.
    pub fn try_from_pod(pod: &Pod) -> Result<Self, RequirementError> {
        Self::try_from_pod_with(pod, true)
    }

    /// As [`Self::try_from_pod`], optionally leaving preferred terms out;
    /// the relaxation path re-derives requirements without them.
    pub fn try_from_pod_with(
        pod: &Pod,
        include_preferred: bool,
    ) -> Result<Self, RequirementError> {
        let mut out = Self::new();
        let Some(spec) = pod.spec.as_ref() else {
            return Ok(out);
        };
        if let Some(selector) = &spec.node_selector {
            for (k, v) in selector {
                out.add(Requirement::new_in(k, [v.clone()]));
            }
        }
        if let Some(node_affinity) = spec.affinity.as_ref().and_then(|a| a.node_affinity.as_ref())
        {
            if let Some(required) = &node_affinity.required_during_scheduling_ignored_during_execution
            {
                // Multiple terms are OR'd by kube; we honor the first
                // alternative, matching the single-pass simulation.
                if let Some(term) = required.node_selector_terms.first() {
                    out.add_term(term)?;
                }
            }
            if include_preferred
                && let Some(preferred) =
                    &node_affinity.preferred_during_scheduling_ignored_during_execution
                && let Some(heaviest) = preferred.iter().max_by_key(|p| p.weight)
            {
                out.add_term(&heaviest.preference)?;
            }
        }
        for key in out.inner.keys() {
            if labels::is_restricted(key) {
                return Err(RequirementError::RestrictedLabel(key.clone()));
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for r in self.inner.values() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_in(key: &str, values: &[&str]) -> Requirement {
        Requirement::new_in(key, values.iter().map(|s| s.to_string()))
    }

    #[test]
    fn in_intersect_in_is_set_intersection() {
        let a = req_in("zone", &["z1", "z2"]);
        let b = req_in("zone", &["z2", "z3"]);
        let r = a.intersect(&b);
        assert!(r.has("z2"));
        assert!(!r.has("z1"));
        assert!(!r.has("z3"));
    }

    #[test]
    fn in_intersect_not_in_subtracts() {
        let a = req_in("zone", &["z1", "z2"]);
        let b = Requirement::not_in("zone", ["z2".to_string()]);
        let r = a.intersect(&b);
        assert!(r.has("z1"));
        assert!(!r.has("z2"));
    }

    #[test]
    fn not_in_intersect_not_in_unions() {
        let a = Requirement::not_in("zone", ["z1".to_string()]);
        let b = Requirement::not_in("zone", ["z2".to_string()]);
        let r = a.intersect(&b);
        assert!(!r.has("z1"));
        assert!(!r.has("z2"));
        assert!(r.has("z3"));
    }

    #[test]
    fn exists_admits_everything() {
        let r = Requirement::exists("zone");
        assert!(r.has("anything"));
        assert!(!r.is_unsatisfiable());
    }

    #[test]
    fn does_not_exist_admits_nothing() {
        let r = Requirement::does_not_exist("zone");
        assert!(!r.has("anything"));
        assert!(r.is_unsatisfiable());
    }

    #[test]
    fn bounds_tighten_and_prune() {
        let a = Requirement::greater_than("gpus", 1);
        let b = Requirement::less_than("gpus", 8);
        let r = a.intersect(&b);
        assert!(r.has("4"));
        assert!(!r.has("1"));
        assert!(!r.has("8"));
        assert!(!r.has("not-a-number"));

        let values = req_in("gpus", &["0", "2", "9"]);
        let pruned = values.intersect(&r);
        assert!(pruned.has("2"));
        assert!(!pruned.has("0"));
        assert!(!pruned.has("9"));
    }

    #[test]
    fn inverted_bounds_are_unsatisfiable() {
        let a = Requirement::greater_than("gpus", 8);
        let b = Requirement::less_than("gpus", 4);
        assert!(a.intersect(&b).is_unsatisfiable());
    }

    #[test]
    fn intersection_is_commutative() {
        let cases = [
            (req_in("k", &["a", "b"]), req_in("k", &["b", "c"])),
            (
                req_in("k", &["a", "b"]),
                Requirement::not_in("k", ["b".to_string()]),
            ),
            (
                Requirement::not_in("k", ["a".to_string()]),
                Requirement::not_in("k", ["b".to_string()]),
            ),
            (Requirement::exists("k"), req_in("k", &["a"])),
            (
                Requirement::greater_than("k", 2),
                req_in("k", &["1", "3", "5"]),
            ),
        ];
        for (a, b) in cases {
            assert_eq!(a.intersect(&b), b.intersect(&a), "{a} vs {b}");
        }
    }

    #[test]
    fn intersection_is_associative() {
        let a = req_in("k", &["1", "2", "3", "4"]);
        let b = Requirement::not_in("k", ["2".to_string()]);
        let c = Requirement::greater_than("k", 1);
        assert_eq!(
            a.intersect(&b).intersect(&c),
            a.intersect(&b.intersect(&c)),
        );
    }

    #[test]
    fn min_values_takes_the_max() {
        let a = req_in("type", &["a", "b", "c"]).with_min_values(2);
        let b = req_in("type", &["a", "b", "c"]).with_min_values(3);
        assert_eq!(a.intersect(&b).min_values(), Some(3));
    }

    #[test]
    fn expression_round_trip() {
        let reqs = [
            req_in("zone", &["z1", "z2"]),
            Requirement::not_in("team", ["infra".to_string()]),
            Requirement::exists("arch"),
            Requirement::does_not_exist("gpu"),
            Requirement::greater_than("cores", 4),
        ];
        for original in reqs {
            let exprs = original.node_selector_requirements();
            let mut rebuilt = Requirements::new();
            for e in &exprs {
                rebuilt.add(Requirement::try_from_expression(e, None).unwrap());
            }
            assert_eq!(rebuilt.get(original.key()), Some(&original));
        }
    }

    #[test]
    fn requirements_intersect_detects_conflicts() {
        let a = Requirements::from_requirements([req_in("zone", &["z1"])]);
        let b = Requirements::from_requirements([req_in("zone", &["z2"])]);
        let err = a.intersect(&b).unwrap_err();
        assert!(matches!(err, RequirementError::Incompatible { key, .. } if key == "zone"));
    }

    #[test]
    fn compatibility_ignores_unshared_keys() {
        let a = Requirements::from_requirements([req_in("zone", &["z1"])]);
        let b = Requirements::from_requirements([req_in("arch", &["arm64"])]);
        assert!(a.is_compatible(&b));
    }

    #[test]
    fn labels_project_single_valued_keys() {
        let reqs = Requirements::from_requirements([
            req_in("zone", &["z1"]),
            req_in("type", &["a", "b"]),
            Requirement::exists("arch"),
        ]);
        let labels = reqs.labels();
        assert_eq!(labels.get("zone").map(String::as_str), Some("z1"));
        assert!(!labels.contains_key("type"));
        assert!(!labels.contains_key("arch"));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let expr = NodeSelectorRequirement {
            key: "zone".into(),
            operator: "Near".into(),
            values: None,
        };
        assert!(matches!(
            Requirement::try_from_expression(&expr, None),
            Err(RequirementError::UnsupportedOperator(_))
        ));
    }
}
