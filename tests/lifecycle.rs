mod common;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::Utc;

use common::{instance_type, ZONES};
use karpenter::apis::nodeclaim::{condition, NodeClaimRequirement, NodeClaimSpec};
use karpenter::apis::{set_condition, NodeClaim};
use karpenter::cloudprovider::fake::{CreateBehavior, FakeProvider};
use karpenter::cloudprovider::types::ProviderId;
use karpenter::cloudprovider::{CloudProvider, CloudProviderError, UnavailableOfferings};
use karpenter::lifecycle::garbagecollect::{is_orphan, DEFAULT_ORPHAN_GRACE};
use karpenter::lifecycle::liveness::{
    registration_expired, DEFAULT_REGISTRATION_TTL, REGISTRATION_FAILURES_BEFORE_UNHEALTHY,
};
use karpenter::scheduling::labels;

fn claim(name: &str) -> NodeClaim {
    NodeClaim::new(
        name,
        NodeClaimSpec {
            node_pool: "general".into(),
            requirements: vec![],
            resources: BTreeMap::new(),
            taints: None,
            startup_taints: None,
            termination_grace_period_seconds: None,
            expire_after_seconds: None,
        },
    )
}

fn launched_minutes_ago(name: &str, minutes: i64) -> NodeClaim {
    let mut c = claim(name);
    let mut status = karpenter::apis::NodeClaimStatus::default();
    set_condition(
        &mut status.conditions,
        condition::LAUNCHED,
        true,
        "Launched",
        "",
        Utc::now() - chrono::Duration::minutes(minutes),
    );
    status.provider_id = Some(format!("fake://{name}"));
    c.status = Some(status);
    c
}

#[test]
fn liveness_fires_exactly_at_the_default_ttl() {
    assert!(!registration_expired(
        &launched_minutes_ago("young", 14),
        DEFAULT_REGISTRATION_TTL,
        Utc::now()
    ));
    assert!(registration_expired(
        &launched_minutes_ago("stale", 16),
        DEFAULT_REGISTRATION_TTL,
        Utc::now()
    ));
    // The pool goes unhealthy on the first failure.
    assert_eq!(REGISTRATION_FAILURES_BEFORE_UNHEALTHY, 1);
}

#[tokio::test]
async fn insufficient_capacity_surfaces_the_failing_offering() {
    let provider = FakeProvider::new()
        .with_instance_types(vec![instance_type("small", 2, 4096, 0.02)])
        .on_next_create(CreateBehavior::InsufficientCapacity);
    let provider = CloudProvider::Fake(provider);

    let mut c = claim("general-1");
    c.spec.requirements = vec![NodeClaimRequirement {
        key: labels::CAPACITY_TYPE_LABEL.into(),
        operator: "In".into(),
        values: Some(vec![labels::CAPACITY_TYPE_SPOT.into()]),
        min_values: None,
    }];
    let error = provider.create(&c).await.unwrap_err();
    let CloudProviderError::InsufficientCapacity {
        instance_type: it,
        zone,
        capacity_type,
    } = error
    else {
        panic!("expected insufficient capacity, got {error:?}");
    };
    assert_eq!(it, "small");
    assert_eq!(capacity_type, labels::CAPACITY_TYPE_SPOT);
    assert!(ZONES.contains(&zone.as_str()));

    // The blacklisted offering disappears from the next pass's catalog.
    let unavailable = UnavailableOfferings::new(Duration::from_secs(60));
    unavailable.mark(&it, &zone, &capacity_type);
    let mut catalog = vec![instance_type("small", 2, 4096, 0.02)];
    unavailable.filter(&mut catalog);
    let blocked = catalog[0]
        .offerings
        .iter()
        .find(|o| o.zone == zone && o.capacity_type == capacity_type)
        .unwrap();
    assert!(!blocked.available);
    // Other offerings in the same zone are untouched.
    let on_demand = catalog[0]
        .offerings
        .iter()
        .find(|o| o.zone == zone && o.capacity_type == labels::CAPACITY_TYPE_ON_DEMAND)
        .unwrap();
    assert!(on_demand.available);
}

#[tokio::test]
async fn garbage_collection_reaps_only_aged_unknown_instances() {
    let provider = FakeProvider::new().with_instance_types(vec![instance_type(
        "small", 2, 4096, 0.02,
    )]);

    // A legitimate instance backed by a claim.
    let owned = provider.create(&claim("general-1")).await.unwrap();
    // An orphan: exists on the provider, no claim, past the grace window.
    let mut orphan = owned.clone();
    orphan.provider_id = ProviderId("fake://orphan".into());
    orphan.created_at = Utc::now() - chrono::Duration::minutes(10);
    provider.inject_instance(orphan.clone());

    let known: HashSet<String> = HashSet::from([owned.provider_id.0.clone()]);
    let provider = CloudProvider::Fake(provider);
    let now = Utc::now();

    let mut reaped = Vec::new();
    for instance in provider.list().await.unwrap() {
        if is_orphan(&instance, &known, false, DEFAULT_ORPHAN_GRACE, now) {
            provider.delete(&instance.provider_id).await.unwrap();
            reaped.push(instance.provider_id.0.clone());
        }
    }
    assert_eq!(reaped, vec!["fake://orphan".to_string()]);
    let survivors: Vec<String> = provider
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.provider_id.0)
        .collect();
    assert_eq!(survivors, vec![owned.provider_id.0]);
}

#[tokio::test]
async fn drifted_claims_report_their_reason() {
    let fake = FakeProvider::new();
    fake.set_drifted("general-1", "ImageDeprecated");
    let provider = CloudProvider::Fake(fake);
    assert_eq!(
        provider.is_drifted(&claim("general-1")).await.unwrap(),
        Some("ImageDeprecated".to_string())
    );
    assert_eq!(provider.is_drifted(&claim("general-2")).await.unwrap(), None);
}
