//! Taint and toleration matching.

use k8s_openapi::api::core::v1::{Pod, Taint, Toleration};
use thiserror::Error;

use crate::scheduling::labels::{NO_EXECUTE, NO_SCHEDULE};

#[derive(Debug, PartialEq, Error)]
#[error("untolerated taint {key}={value}:{effect}")]
pub struct UntoleratedTaint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

fn tolerates_taint(toleration: &Toleration, taint: &Taint) -> bool {
    // Empty effect tolerates all effects.
    if let Some(effect) = toleration.effect.as_deref()
        && !effect.is_empty()
        && effect != taint.effect
    {
        return false;
    }
    match toleration.operator.as_deref() {
        Some("Exists") => match toleration.key.as_deref() {
            // Exists with an empty key tolerates everything.
            None | Some("") => true,
            Some(key) => key == taint.key,
        },
        // Equal is the default operator.
        _ => {
            toleration.key.as_deref() == Some(taint.key.as_str())
                && toleration.value.as_deref().unwrap_or("")
                    == taint.value.as_deref().unwrap_or("")
        }
    }
}

/// Scheduling only cares about NoSchedule and NoExecute; PreferNoSchedule is
/// advisory.
fn blocks_scheduling(taint: &Taint) -> bool {
    taint.effect == NO_SCHEDULE || taint.effect == NO_EXECUTE
}

pub fn tolerates(pod: &Pod, taint: &Taint) -> bool {
    if !blocks_scheduling(taint) {
        return true;
    }
    pod.spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .map(|tolerations| tolerations.iter().any(|t| tolerates_taint(t, taint)))
        .unwrap_or(false)
}

/// First untolerated taint, if any.
pub fn check_all(pod: &Pod, taints: &[Taint]) -> Result<(), UntoleratedTaint> {
    for taint in taints {
        if !tolerates(pod, taint) {
            return Err(UntoleratedTaint {
                key: taint.key.clone(),
                value: taint.value.clone().unwrap_or_default(),
                effect: taint.effect.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;

    fn taint(key: &str, value: &str, effect: &str) -> Taint {
        Taint {
            key: key.into(),
            value: (!value.is_empty()).then(|| value.to_string()),
            effect: effect.into(),
            ..Default::default()
        }
    }

    fn pod_with(tolerations: Vec<Toleration>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                tolerations: Some(tolerations),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn no_tolerations_blocks_on_no_schedule() {
        let pod = Pod::default();
        assert!(!tolerates(&pod, &taint("team", "infra", NO_SCHEDULE)));
    }

    #[test]
    fn prefer_no_schedule_never_blocks() {
        let pod = Pod::default();
        assert!(tolerates(&pod, &taint("team", "infra", "PreferNoSchedule")));
    }

    #[test]
    fn equal_operator_matches_key_and_value() {
        let pod = pod_with(vec![Toleration {
            key: Some("team".into()),
            operator: Some("Equal".into()),
            value: Some("infra".into()),
            ..Default::default()
        }]);
        assert!(tolerates(&pod, &taint("team", "infra", NO_SCHEDULE)));
        assert!(!tolerates(&pod, &taint("team", "web", NO_SCHEDULE)));
    }

    #[test]
    fn exists_with_empty_key_tolerates_everything() {
        let pod = pod_with(vec![Toleration {
            operator: Some("Exists".into()),
            ..Default::default()
        }]);
        assert!(tolerates(&pod, &taint("anything", "at-all", NO_EXECUTE)));
    }

    #[test]
    fn effect_scoping_applies() {
        let pod = pod_with(vec![Toleration {
            key: Some("team".into()),
            operator: Some("Exists".into()),
            effect: Some(NO_SCHEDULE.into()),
            ..Default::default()
        }]);
        assert!(tolerates(&pod, &taint("team", "", NO_SCHEDULE)));
        assert!(!tolerates(&pod, &taint("team", "", NO_EXECUTE)));
    }

    #[test]
    fn check_all_reports_first_offender() {
        let pod = Pod::default();
        let taints = vec![
            taint("a", "1", "PreferNoSchedule"),
            taint("b", "2", NO_SCHEDULE),
        ];
        let err = check_all(&pod, &taints).unwrap_err();
        assert_eq!(err.key, "b");
    }
}
