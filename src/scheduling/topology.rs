//! Topology tracking for one scheduling pass.
//!
//! Built fresh per pass from the cluster snapshot plus the pending batch.
//! Each spread constraint or (anti-)affinity term becomes a counting group
//! over a topology key; `add_requirements` folds the currently-allowed
//! domains into a pod's requirements, and `record` commits a placement to a
//! single domain so later pods in the same pass see the updated skew.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::core::v1::{Pod, PodAffinityTerm};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use thiserror::Error;

use crate::scheduling::pod::PodKey;
use crate::scheduling::requirements::{Requirement, Requirements};

#[derive(Debug, PartialEq, Error)]
#[error("no feasible {key} domain: {detail}")]
pub struct TopologyError {
    pub key: String,
    pub detail: String,
}

/// Label-selector matching with the metav1 semantics: NotIn and
/// DoesNotExist are satisfied by absent keys, In and Exists are not.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    for expr in selector.match_expressions.as_deref().unwrap_or_default() {
        let value = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        let ok = match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
            "NotIn" => value.is_none_or(|v| !values.iter().any(|x| x == v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, PartialEq)]
enum GroupKind {
    Spread { max_skew: i32 },
    Affinity,
    AntiAffinity,
}

#[derive(Debug, Clone)]
struct TopologyGroup {
    kind: GroupKind,
    key: String,
    selector: Option<LabelSelector>,
    namespaces: BTreeSet<String>,
    counts: BTreeMap<String, usize>,
    /// Weight of the preferred term this group came from; `None` for hard
    /// constraints. Soft groups can be relaxed away.
    weight: Option<i32>,
    /// The pod that introduced a soft group.
    source: Option<PodKey>,
    relaxed: bool,
}

impl TopologyGroup {
    fn identity(&self) -> (String, String, String, String) {
        (
            format!("{:?}", self.kind),
            self.key.clone(),
            serde_json::to_string(&self.selector).unwrap_or_default(),
            format!("{:?}", self.namespaces),
        )
    }

    fn counts_pod(&self, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        if !self.namespaces.contains(namespace) {
            return false;
        }
        match &self.selector {
            Some(selector) => selector_matches(selector, labels),
            None => false,
        }
    }

    fn min_count(&self, candidates: &BTreeSet<String>) -> usize {
        candidates
            .iter()
            .map(|d| self.counts.get(d).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Domains a new matching pod may land in without violating the group.
    /// `candidates` is what the node under consideration can reach;
    /// `universe` is every domain that exists, because skew and occupancy
    /// are global properties.
    fn allowed_domains(
        &self,
        candidates: &BTreeSet<String>,
        universe: &BTreeSet<String>,
        self_selecting: bool,
    ) -> BTreeSet<String> {
        match self.kind {
            GroupKind::Spread { max_skew } => {
                let max_skew = max_skew.max(1) as usize;
                let min = self.min_count(universe);
                candidates
                    .iter()
                    .filter(|d| {
                        let count = self.counts.get(*d).copied().unwrap_or(0);
                        count + 1 - min <= max_skew
                    })
                    .cloned()
                    .collect()
            }
            GroupKind::AntiAffinity => candidates
                .iter()
                .filter(|d| self.counts.get(*d).copied().unwrap_or(0) == 0)
                .cloned()
                .collect(),
            GroupKind::Affinity => {
                let globally_occupied = universe
                    .iter()
                    .any(|d| self.counts.get(d).copied().unwrap_or(0) > 0);
                if !globally_occupied && self_selecting {
                    // First matching pod bootstraps the domain.
                    candidates.clone()
                } else {
                    candidates
                        .iter()
                        .filter(|d| self.counts.get(*d).copied().unwrap_or(0) > 0)
                        .cloned()
                        .collect()
                }
            }
        }
    }
}

pub struct Topology {
    groups: Vec<TopologyGroup>,
    /// Observed plus projected domain values per topology key.
    domains: BTreeMap<String, BTreeSet<String>>,
    /// Which groups each pending pod is subject to.
    memberships: HashMap<PodKey, Vec<usize>>,
}

impl Topology {
    /// Build the tracker for one pass.
    ///
    /// `universe` carries the domain values valid for new nodes (zones and
    /// friends from the node-pool catalogs); existing pods contribute their
    /// nodes' observed values on top.
    pub fn new(
        universe: BTreeMap<String, BTreeSet<String>>,
        existing: &[(Pod, BTreeMap<String, String>)],
        pending: &[Pod],
    ) -> Self {
        let mut topology = Self {
            groups: Vec::new(),
            domains: universe,
            memberships: HashMap::new(),
        };
        for pod in pending {
            topology.register_pod(pod);
        }
        for (pod, node_labels) in existing {
            for key in topology.group_keys() {
                if let Some(domain) = node_labels.get(&key) {
                    topology.observe_domain(&key, domain);
                }
            }
            topology.count_existing(pod, node_labels);
        }
        topology
    }

    fn group_keys(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key.clone()).collect()
    }

    fn observe_domain(&mut self, key: &str, value: &str) {
        self.domains
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
    }

    /// Project a domain value that will exist once a candidate node is
    /// created (a synthetic hostname, for instance).
    pub fn register_domain(&mut self, key: &str, value: &str) {
        self.observe_domain(key, value);
    }

    fn count_existing(&mut self, pod: &Pod, node_labels: &BTreeMap<String, String>) {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        for group in &mut self.groups {
            if !group.counts_pod(namespace, &labels) {
                continue;
            }
            if let Some(domain) = node_labels.get(&group.key) {
                *group.counts.entry(domain.clone()).or_insert(0) += 1;
            }
        }
    }

    fn push_group(&mut self, group: TopologyGroup, pod_key: &PodKey) {
        let index = if group.weight.is_none() {
            // Hard groups with the same shape share counts.
            let identity = group.identity();
            match self
                .groups
                .iter()
                .position(|g| g.weight.is_none() && g.identity() == identity)
            {
                Some(i) => i,
                None => {
                    self.groups.push(group);
                    self.groups.len() - 1
                }
            }
        } else {
            self.groups.push(group);
            self.groups.len() - 1
        };
        self.memberships
            .entry(pod_key.clone())
            .or_default()
            .push(index);
    }

    fn term_namespaces(pod: &Pod, term: &PodAffinityTerm) -> BTreeSet<String> {
        let own = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        match term.namespaces.as_deref() {
            Some(names) if !names.is_empty() => names.iter().cloned().collect(),
            _ => BTreeSet::from([own]),
        }
    }

    fn register_pod(&mut self, pod: &Pod) {
        let pod_key = PodKey::from_pod(pod);
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let Some(spec) = pod.spec.as_ref() else {
            return;
        };

        for constraint in spec.topology_spread_constraints.as_deref().unwrap_or_default() {
            // ScheduleAnyway is advisory; treat as the softest constraint.
            let soft = constraint.when_unsatisfiable == "ScheduleAnyway";
            self.push_group(
                TopologyGroup {
                    kind: GroupKind::Spread {
                        max_skew: constraint.max_skew,
                    },
                    key: constraint.topology_key.clone(),
                    selector: constraint.label_selector.clone(),
                    namespaces: BTreeSet::from([namespace.clone()]),
                    counts: BTreeMap::new(),
                    weight: soft.then_some(0),
                    source: soft.then(|| pod_key.clone()),
                    relaxed: false,
                },
                &pod_key,
            );
        }

        let affinity = spec.affinity.as_ref();
        if let Some(pod_affinity) = affinity.and_then(|a| a.pod_affinity.as_ref()) {
            for term in pod_affinity
                .required_during_scheduling_ignored_during_execution
                .as_deref()
                .unwrap_or_default()
            {
                self.push_group(
                    TopologyGroup {
                        kind: GroupKind::Affinity,
                        key: term.topology_key.clone(),
                        selector: term.label_selector.clone(),
                        namespaces: Self::term_namespaces(pod, term),
                        counts: BTreeMap::new(),
                        weight: None,
                        source: None,
                        relaxed: false,
                    },
                    &pod_key,
                );
            }
        }
        if let Some(anti) = affinity.and_then(|a| a.pod_anti_affinity.as_ref()) {
            for term in anti
                .required_during_scheduling_ignored_during_execution
                .as_deref()
                .unwrap_or_default()
            {
                self.push_group(
                    TopologyGroup {
                        kind: GroupKind::AntiAffinity,
                        key: term.topology_key.clone(),
                        selector: term.label_selector.clone(),
                        namespaces: Self::term_namespaces(pod, term),
                        counts: BTreeMap::new(),
                        weight: None,
                        source: None,
                        relaxed: false,
                    },
                    &pod_key,
                );
            }
            for weighted in anti
                .preferred_during_scheduling_ignored_during_execution
                .as_deref()
                .unwrap_or_default()
            {
                self.push_group(
                    TopologyGroup {
                        kind: GroupKind::AntiAffinity,
                        key: weighted.pod_affinity_term.topology_key.clone(),
                        selector: weighted.pod_affinity_term.label_selector.clone(),
                        namespaces: Self::term_namespaces(pod, &weighted.pod_affinity_term),
                        counts: BTreeMap::new(),
                        weight: Some(weighted.weight),
                        source: Some(pod_key.clone()),
                        relaxed: false,
                    },
                    &pod_key,
                );
            }
        }
    }

    pub fn has_constraints(&self, pod_key: &PodKey) -> bool {
        self.memberships
            .get(pod_key)
            .is_some_and(|m| !m.is_empty())
    }

    fn self_selecting(group: &TopologyGroup, pod: &Pod) -> bool {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        group.counts_pod(namespace, &labels)
    }

    /// Requirements that force the pod into domains not violating any of its
    /// groups, given the node requirements accumulated so far.
    pub fn add_requirements(
        &self,
        pod: &Pod,
        current: &Requirements,
    ) -> Result<Requirements, TopologyError> {
        let pod_key = PodKey::from_pod(pod);
        let mut out = Requirements::new();
        for &index in self.memberships.get(&pod_key).map(Vec::as_slice).unwrap_or_default() {
            let group = &self.groups[index];
            if group.relaxed {
                continue;
            }
            let universe = self.domains.get(&group.key).cloned().unwrap_or_default();
            let candidates: BTreeSet<String> = universe
                .iter()
                .filter(|d| current.has(&group.key, d))
                .cloned()
                .collect();
            let allowed =
                group.allowed_domains(&candidates, &universe, Self::self_selecting(group, pod));
            if allowed.is_empty() {
                return Err(TopologyError {
                    key: group.key.clone(),
                    detail: match group.kind {
                        GroupKind::Spread { max_skew } => {
                            format!("maxSkew {max_skew} exhausted across {candidates:?}")
                        }
                        GroupKind::AntiAffinity => {
                            format!("anti-affinity conflict in every domain of {candidates:?}")
                        }
                        GroupKind::Affinity => {
                            format!("no domain satisfies pod affinity among {candidates:?}")
                        }
                    },
                });
            }
            out.add(Requirement::new_in(&group.key, allowed));
        }
        Ok(out)
    }

    /// Commit a placement. Every group the placed pod matches picks the
    /// least-loaded admissible domain and counts the pod there; the
    /// returned requirements pin the node to the chosen domains so the
    /// commitment is visible to later placements.
    pub fn record(&mut self, pod: &Pod, placed: &Requirements) -> Requirements {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let mut narrowing = Requirements::new();
        for group in &mut self.groups {
            if group.relaxed || !group.counts_pod(namespace, &labels) {
                continue;
            }
            let Some(requirement) = placed.get(&group.key) else {
                continue;
            };
            let admissible: Vec<&str> = self
                .domains
                .get(&group.key)
                .map(|universe| {
                    universe
                        .iter()
                        .map(String::as_str)
                        .filter(|d| requirement.has(d))
                        .collect()
                })
                .unwrap_or_default();
            let Some(chosen) = admissible
                .iter()
                .min_by_key(|d| group.counts.get(**d).copied().unwrap_or(0))
                .map(|d| d.to_string())
            else {
                continue;
            };
            *group.counts.entry(chosen.clone()).or_insert(0) += 1;
            narrowing.add(Requirement::new_in(&group.key, [chosen]));
        }
        narrowing
    }

    /// Drop the lowest-weight soft constraint attributable to the pod.
    /// Returns false when nothing is left to relax.
    pub fn relax(&mut self, pod_key: &PodKey) -> bool {
        let candidate = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| {
                !g.relaxed && g.weight.is_some() && g.source.as_ref() == Some(pod_key)
            })
            .min_by_key(|(_, g)| g.weight.unwrap_or(0))
            .map(|(i, _)| i);
        match candidate {
            Some(index) => {
                self.groups[index].relaxed = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::labels::{HOSTNAME_LABEL, ZONE_LABEL};
    use k8s_openapi::api::core::v1::{
        Affinity, PodAntiAffinity, PodSpec, TopologySpreadConstraint,
    };
    use kube::api::ObjectMeta;

    fn labeled_pod(name: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                uid: Some(format!("uid-{name}")),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    fn app_selector(app: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            ..Default::default()
        }
    }

    fn with_spread(mut pod: Pod, max_skew: i32) -> Pod {
        pod.spec.as_mut().unwrap().topology_spread_constraints =
            Some(vec![TopologySpreadConstraint {
                max_skew,
                topology_key: ZONE_LABEL.into(),
                when_unsatisfiable: "DoNotSchedule".into(),
                label_selector: Some(app_selector("web")),
                ..Default::default()
            }]);
        pod
    }

    fn with_anti_affinity(mut pod: Pod, app: &str) -> Pod {
        pod.spec.as_mut().unwrap().affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    topology_key: HOSTNAME_LABEL.into(),
                    label_selector: Some(app_selector(app)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        pod
    }

    fn zones() -> BTreeMap<String, BTreeSet<String>> {
        BTreeMap::from([(
            ZONE_LABEL.to_string(),
            BTreeSet::from(["z1".to_string(), "z2".to_string(), "z3".to_string()]),
        )])
    }

    #[test]
    fn spread_distributes_across_zones() {
        let pods: Vec<Pod> = (0..7)
            .map(|i| with_spread(labeled_pod(&format!("p{i}"), "web"), 1))
            .collect();
        let mut topology = Topology::new(zones(), &[], &pods);

        let mut per_zone: BTreeMap<String, usize> = BTreeMap::new();
        for pod in &pods {
            let reqs = topology.add_requirements(pod, &Requirements::new()).unwrap();
            let narrowed = topology.record(pod, &reqs);
            let zone = narrowed.labels().get(ZONE_LABEL).cloned().unwrap();
            *per_zone.entry(zone).or_insert(0) += 1;
        }
        let mut counts: Vec<usize> = per_zone.values().copied().collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![2, 2, 3]);
    }

    #[test]
    fn spread_counts_existing_pods() {
        let existing = vec![
            (
                labeled_pod("old-1", "web"),
                BTreeMap::from([(ZONE_LABEL.to_string(), "z1".to_string())]),
            ),
            (
                labeled_pod("old-2", "web"),
                BTreeMap::from([(ZONE_LABEL.to_string(), "z1".to_string())]),
            ),
        ];
        let pod = with_spread(labeled_pod("new", "web"), 1);
        let topology = Topology::new(zones(), &existing, &[pod.clone()]);
        let reqs = topology.add_requirements(&pod, &Requirements::new()).unwrap();
        // z1 already has skew 2; only the empty zones are allowed.
        assert!(!reqs.has(ZONE_LABEL, "z1"));
        assert!(reqs.has(ZONE_LABEL, "z2"));
        assert!(reqs.has(ZONE_LABEL, "z3"));
    }

    #[test]
    fn anti_affinity_excludes_occupied_domains() {
        let pods: Vec<Pod> = (0..3)
            .map(|i| with_anti_affinity(labeled_pod(&format!("p{i}"), "db"), "db"))
            .collect();
        let mut universe = BTreeMap::new();
        universe.insert(
            HOSTNAME_LABEL.to_string(),
            BTreeSet::from(["host-1".to_string(), "host-2".to_string()]),
        );
        let mut topology = Topology::new(universe, &[], &pods);

        let reqs = topology
            .add_requirements(&pods[0], &Requirements::new())
            .unwrap();
        assert!(reqs.has(HOSTNAME_LABEL, "host-1"));
        topology.record(&pods[0], &reqs);

        let reqs = topology
            .add_requirements(&pods[1], &Requirements::new())
            .unwrap();
        let allowed = reqs.get(HOSTNAME_LABEL).unwrap();
        assert_eq!(allowed.value_count(), Some(1));

        topology.record(&pods[1], &reqs);
        // Both hosts occupied: third pod has nowhere to go.
        let err = topology
            .add_requirements(&pods[2], &Requirements::new())
            .unwrap_err();
        assert_eq!(err.key, HOSTNAME_LABEL);
    }

    #[test]
    fn registered_domains_open_new_hosts() {
        let pod = with_anti_affinity(labeled_pod("p0", "db"), "db");
        let mut topology = Topology::new(BTreeMap::new(), &[], &[pod.clone()]);
        assert!(topology
            .add_requirements(&pod, &Requirements::new())
            .is_err());
        topology.register_domain(HOSTNAME_LABEL, "fresh-host");
        let reqs = topology.add_requirements(&pod, &Requirements::new()).unwrap();
        assert!(reqs.has(HOSTNAME_LABEL, "fresh-host"));
    }

    #[test]
    fn relax_drops_soft_groups_only() {
        let mut pod = labeled_pod("p0", "db");
        pod.spec.as_mut().unwrap().affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    k8s_openapi::api::core::v1::WeightedPodAffinityTerm {
                        weight: 10,
                        pod_affinity_term: PodAffinityTerm {
                            topology_key: HOSTNAME_LABEL.into(),
                            label_selector: Some(app_selector("db")),
                            ..Default::default()
                        },
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        });
        let key = PodKey::from_pod(&pod);
        let mut topology = Topology::new(BTreeMap::new(), &[], &[pod.clone()]);
        assert!(topology.has_constraints(&key));
        assert!(topology.relax(&key));
        // Nothing soft remains.
        assert!(!topology.relax(&key));
        // With the soft group gone the pod is unconstrained.
        let reqs = topology.add_requirements(&pod, &Requirements::new()).unwrap();
        assert!(reqs.is_empty());
    }

    #[test]
    fn selector_not_in_matches_absent_keys() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement {
                    key: "tier".into(),
                    operator: "NotIn".into(),
                    values: Some(vec!["db".into()]),
                },
            ]),
            ..Default::default()
        };
        assert!(selector_matches(&selector, &BTreeMap::new()));
        assert!(!selector_matches(
            &selector,
            &BTreeMap::from([("tier".to_string(), "db".to_string())])
        ));
    }
}
