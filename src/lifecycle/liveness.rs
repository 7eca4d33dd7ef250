//! Registration liveness: a launched claim whose node never appears is torn
//! down rather than left holding pods' hopes forever.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::apis::NodeClaim;

pub const DEFAULT_REGISTRATION_TTL: Duration = Duration::from_secs(15 * 60);

/// Consecutive registration failures before the owning pool is marked
/// NodeRegistrationHealthy=False. One failure flips it today; the constant
/// exists so the threshold can move without touching the flow.
pub const REGISTRATION_FAILURES_BEFORE_UNHEALTHY: u32 = 1;

/// True when the claim launched more than `ttl` ago and still has no
/// registered node.
pub fn registration_expired(claim: &NodeClaim, ttl: Duration, now: DateTime<Utc>) -> bool {
    if claim.is_registered() {
        return false;
    }
    match claim.launched_at() {
        Some(launched_at) => {
            now.signed_duration_since(launched_at)
                >= chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
        }
        None => false,
    }
}

/// Time left before the TTL fires, for requeue scheduling.
pub fn time_until_expiry(
    claim: &NodeClaim,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let launched_at = claim.launched_at()?;
    let deadline = launched_at + chrono::Duration::from_std(ttl).ok()?;
    (deadline - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodeclaim::{condition, NodeClaimSpec, NodeClaimStatus};
    use crate::apis::set_condition;
    use std::collections::BTreeMap;

    fn launched_claim(minutes_ago: i64) -> NodeClaim {
        let mut claim = NodeClaim::new(
            "claim-a",
            NodeClaimSpec {
                node_pool: "general".into(),
                requirements: vec![],
                resources: BTreeMap::new(),
                taints: None,
                startup_taints: None,
                termination_grace_period_seconds: None,
                expire_after_seconds: None,
            },
        );
        let mut status = NodeClaimStatus::default();
        set_condition(
            &mut status.conditions,
            condition::LAUNCHED,
            true,
            "Launched",
            "",
            Utc::now() - chrono::Duration::minutes(minutes_ago),
        );
        claim.status = Some(status);
        claim
    }

    #[test]
    fn expires_after_ttl() {
        let claim = launched_claim(16);
        assert!(registration_expired(
            &claim,
            DEFAULT_REGISTRATION_TTL,
            Utc::now()
        ));
    }

    #[test]
    fn within_ttl_is_alive() {
        let claim = launched_claim(5);
        assert!(!registration_expired(
            &claim,
            DEFAULT_REGISTRATION_TTL,
            Utc::now()
        ));
        let remaining = time_until_expiry(&claim, DEFAULT_REGISTRATION_TTL, Utc::now()).unwrap();
        assert!(remaining <= Duration::from_secs(10 * 60));
        assert!(remaining > Duration::from_secs(9 * 60));
    }

    #[test]
    fn registered_claims_never_expire() {
        let mut claim = launched_claim(60);
        let status = claim.status.as_mut().unwrap();
        set_condition(
            &mut status.conditions,
            condition::REGISTERED,
            true,
            "Registered",
            "",
            Utc::now(),
        );
        assert!(!registration_expired(
            &claim,
            DEFAULT_REGISTRATION_TTL,
            Utc::now()
        ));
    }

    #[test]
    fn unlaunched_claims_do_not_expire() {
        let mut claim = launched_claim(60);
        claim.status = None;
        assert!(!registration_expired(
            &claim,
            DEFAULT_REGISTRATION_TTL,
            Utc::now()
        ));
    }
}
