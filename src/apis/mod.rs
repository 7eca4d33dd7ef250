//! Custom resource definitions and status-condition helpers.

pub mod nodeclaim;
pub mod nodepool;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub use nodeclaim::{NodeClaim, NodeClaimRequirement, NodeClaimSpec, NodeClaimStatus};
pub use nodepool::{NodePool, NodePoolSpec, NodePoolStatus};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Convert a Kubernetes API timestamp (backed by `jiff::Timestamp`) to the
/// `chrono::DateTime<Utc>` used throughout the rest of this crate.
pub fn time_to_chrono(t: &Time) -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::SystemTime::from(t.0))
}

/// Convert a `chrono::DateTime<Utc>` to the Kubernetes API timestamp type.
pub fn chrono_to_time(dt: DateTime<Utc>) -> Time {
    Time(
        k8s_openapi::jiff::Timestamp::try_from(std::time::SystemTime::from(dt))
            .expect("timestamp out of jiff's representable range"),
    )
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == CONDITION_TRUE)
}

/// Upsert a status condition. The transition time only moves when the
/// status actually changes, which keeps repeated reconciles idempotent.
/// Returns true when anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let status = if status { CONDITION_TRUE } else { CONDITION_FALSE };
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            let changed = existing.status != status
                || existing.reason != reason
                || existing.message != message;
            if existing.status != status {
                existing.last_transition_time = chrono_to_time(now);
            }
            existing.status = status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            changed
        }
        None => {
            conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: chrono_to_time(now),
                observed_generation: None,
            });
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_is_idempotent() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        assert!(set_condition(&mut conditions, "Ready", true, "Up", "", now));
        assert!(!set_condition(&mut conditions, "Ready", true, "Up", "", now));
        assert_eq!(conditions.len(), 1);
        assert!(condition_is_true(&conditions, "Ready"));
    }

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(60);
        let t2 = t1 + chrono::Duration::seconds(60);
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "Up", "", t0);
        set_condition(&mut conditions, "Ready", true, "StillUp", "", t1);
        assert_eq!(time_to_chrono(&conditions[0].last_transition_time), t0);
        set_condition(&mut conditions, "Ready", false, "Down", "", t2);
        assert_eq!(time_to_chrono(&conditions[0].last_transition_time), t2);
    }
}
