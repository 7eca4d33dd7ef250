//! PVC-derived scheduling requirements.
//!
//! A pod that mounts a PersistentVolumeClaim inherits topology from storage:
//! a bound volume pins it to the volume's node affinity, an unbound claim is
//! constrained by its storage class's allowed topologies.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use thiserror::Error;

use crate::scheduling::requirements::{Requirement, RequirementError, Requirements};
use crate::state::node::pod_volume_claims;

#[derive(Debug, PartialEq, Error)]
pub enum VolumeError {
    #[error("pod references unresolvable claim {0}")]
    UnresolvedClaim(String),

    #[error("claim {claim} is bound to missing volume {volume}")]
    MissingVolume { claim: String, volume: String },

    #[error("claim {claim} uses unknown storage class {class}")]
    UnknownStorageClass { claim: String, class: String },

    #[error("volume topology conflict: {0}")]
    Conflict(RequirementError),
}

fn volume_requirements(pv: &PersistentVolume) -> Result<Requirements, VolumeError> {
    let Some(required) = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|na| na.required.as_ref())
    else {
        return Ok(Requirements::new());
    };
    // Volume affinity terms are OR'd; a provisioned volume carries exactly
    // one in practice.
    let Some(term) = required.node_selector_terms.first() else {
        return Ok(Requirements::new());
    };
    let mut out = Requirements::new();
    for expr in term.match_expressions.as_deref().unwrap_or_default() {
        out.add(
            Requirement::try_from_expression(expr, None).map_err(VolumeError::Conflict)?,
        );
    }
    Ok(out)
}

fn class_requirements(sc: &StorageClass) -> Requirements {
    let mut out = Requirements::new();
    for term in sc.allowed_topologies.as_deref().unwrap_or_default() {
        for expr in term.match_label_expressions.as_deref().unwrap_or_default() {
            out.add(Requirement::new_in(&expr.key, expr.values.clone()));
        }
    }
    out
}

/// Topology requirements a pod inherits from its volume claims, merged
/// across all claims. Conflicting claims (say, two volumes pinned to
/// different zones) surface as a conflict, not an empty requirement.
pub fn pod_volume_requirements(
    pod: &Pod,
    pvcs: &HashMap<String, PersistentVolumeClaim>,
    pvs: &HashMap<String, PersistentVolume>,
    storage_classes: &HashMap<String, StorageClass>,
) -> Result<Requirements, VolumeError> {
    let mut out = Requirements::new();
    for claim_key in pod_volume_claims(pod) {
        let pvc = pvcs
            .get(&claim_key)
            .ok_or_else(|| VolumeError::UnresolvedClaim(claim_key.clone()))?;

        let from_claim = match pvc.spec.as_ref().and_then(|s| s.volume_name.as_deref()) {
            Some(volume_name) if !volume_name.is_empty() => {
                let pv = pvs.get(volume_name).ok_or_else(|| VolumeError::MissingVolume {
                    claim: claim_key.clone(),
                    volume: volume_name.to_string(),
                })?;
                volume_requirements(pv)?
            }
            _ => match pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) {
                Some(class) => {
                    let sc = storage_classes.get(class).ok_or_else(|| {
                        VolumeError::UnknownStorageClass {
                            claim: claim_key.clone(),
                            class: class.to_string(),
                        }
                    })?;
                    class_requirements(sc)
                }
                // No class and no volume: nothing to constrain on yet.
                None => Requirements::new(),
            },
        };
        out = out.intersect(&from_claim).map_err(VolumeError::Conflict)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::labels::ZONE_LABEL;
    use k8s_openapi::api::core::v1::{
        NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec,
        PodSpec, TopologySelectorLabelRequirement, TopologySelectorTerm, Volume,
        VolumeNodeAffinity,
    };
    use kube::api::ObjectMeta;

    fn pod_with_claim(claim_name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "data".into(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim_name.into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pvc(name: &str, volume: Option<&str>, class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: volume.map(String::from),
                storage_class_name: class.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn zoned_pv(name: &str, zone: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: ZONE_LABEL.into(),
                                operator: "In".into(),
                                values: Some(vec![zone.into()]),
                            }]),
                            ..Default::default()
                        }],
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn bound_volume_pins_zone() {
        let pod = pod_with_claim("data-0");
        let pvcs = HashMap::from([("default/data-0".to_string(), pvc("data-0", Some("pv-1"), None))]);
        let pvs = HashMap::from([("pv-1".to_string(), zoned_pv("pv-1", "z2"))]);
        let reqs =
            pod_volume_requirements(&pod, &pvcs, &pvs, &HashMap::new()).unwrap();
        assert!(reqs.has(ZONE_LABEL, "z2"));
        assert!(!reqs.has(ZONE_LABEL, "z1"));
    }

    #[test]
    fn unbound_claim_uses_class_topologies() {
        let pod = pod_with_claim("data-0");
        let pvcs = HashMap::from([(
            "default/data-0".to_string(),
            pvc("data-0", None, Some("fast")),
        )]);
        let sc = StorageClass {
            metadata: ObjectMeta {
                name: Some("fast".into()),
                ..Default::default()
            },
            allowed_topologies: Some(vec![TopologySelectorTerm {
                match_label_expressions: Some(vec![TopologySelectorLabelRequirement {
                    key: ZONE_LABEL.into(),
                    values: vec!["z1".into(), "z3".into()],
                }]),
            }]),
            ..Default::default()
        };
        let classes = HashMap::from([("fast".to_string(), sc)]);
        let reqs =
            pod_volume_requirements(&pod, &pvcs, &HashMap::new(), &classes).unwrap();
        assert!(reqs.has(ZONE_LABEL, "z1"));
        assert!(!reqs.has(ZONE_LABEL, "z2"));
    }

    #[test]
    fn missing_claim_is_an_error() {
        let pod = pod_with_claim("ghost");
        let err = pod_volume_requirements(&pod, &HashMap::new(), &HashMap::new(), &HashMap::new())
            .unwrap_err();
        assert_eq!(err, VolumeError::UnresolvedClaim("default/ghost".into()));
    }

    #[test]
    fn conflicting_volumes_conflict() {
        let mut pod = pod_with_claim("data-0");
        pod.spec.as_mut().unwrap().volumes.as_mut().unwrap().push(Volume {
            name: "data2".into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "data-1".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        let pvcs = HashMap::from([
            ("default/data-0".to_string(), pvc("data-0", Some("pv-1"), None)),
            ("default/data-1".to_string(), pvc("data-1", Some("pv-2"), None)),
        ]);
        let pvs = HashMap::from([
            ("pv-1".to_string(), zoned_pv("pv-1", "z1")),
            ("pv-2".to_string(), zoned_pv("pv-2", "z2")),
        ]);
        let err = pod_volume_requirements(&pod, &pvcs, &pvs, &HashMap::new()).unwrap_err();
        assert!(matches!(err, VolumeError::Conflict(_)));
    }
}
