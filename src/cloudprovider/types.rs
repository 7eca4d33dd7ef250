//! Instance-type catalog types.
//!
//! An [`InstanceType`] is what a cloud provider offers: a named shape with
//! capacity, per-(zone × capacity-type) offerings and prices. The scheduler
//! treats these as the universe candidate nodes are drawn from.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::scheduling::labels;
use crate::scheduling::requirements::{Requirement, Requirements};
use crate::scheduling::resources::Resources;

/// The provider's native identifier for a launched instance. Opaque to the
/// caller; only the provider adapter interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub String);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The (capacity-type × zone) tuple at which an instance type can be
/// launched, with its price.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub zone: String,
    pub capacity_type: String,
    pub price_per_hour: f64,
    pub available: bool,
}

/// Resources the node itself consumes before any pod lands on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overhead {
    pub kube_reserved: Resources,
    pub system_reserved: Resources,
    pub eviction_threshold: Resources,
}

impl Overhead {
    pub fn total(&self) -> Resources {
        let mut out = self.kube_reserved.clone();
        out.add(&self.system_reserved);
        out.add(&self.eviction_threshold);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    pub architecture: String,
    pub os: String,
    pub offerings: Vec<Offering>,
    pub capacity: Resources,
    pub overhead: Overhead,
}

impl InstanceType {
    /// Capacity left for pods: capacity minus the node's own overhead.
    pub fn allocatable(&self) -> Resources {
        let mut out = self.capacity.clone();
        out.sub_saturating(&self.overhead.total());
        out
    }

    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|o| o.available)
    }

    /// The requirements this instance type satisfies: its identity labels
    /// plus the zones and capacity types it is currently offered at.
    pub fn requirements(&self) -> Requirements {
        let zones: Vec<String> = self
            .available_offerings()
            .map(|o| o.zone.clone())
            .collect();
        let capacity_types: Vec<String> = self
            .available_offerings()
            .map(|o| o.capacity_type.clone())
            .collect();
        Requirements::from_requirements([
            Requirement::new_in(labels::INSTANCE_TYPE_LABEL, [self.name.clone()]),
            Requirement::new_in(labels::ARCH_LABEL, [self.architecture.clone()]),
            Requirement::new_in(labels::OS_LABEL, [self.os.clone()]),
            Requirement::new_in(labels::ZONE_LABEL, zones),
            Requirement::new_in(labels::CAPACITY_TYPE_LABEL, capacity_types),
        ])
    }

    /// Cheapest available offering admissible under `reqs`, used for the
    /// price tie-break and for truncation ordering.
    pub fn min_available_price(&self, reqs: &Requirements) -> Option<f64> {
        self.available_offerings()
            .filter(|o| {
                reqs.has(labels::ZONE_LABEL, &o.zone)
                    && reqs.has(labels::CAPACITY_TYPE_LABEL, &o.capacity_type)
            })
            .map(|o| o.price_per_hour)
            .min_by(f64::total_cmp)
    }

    /// True when at least one offering is both available and admissible.
    pub fn has_admissible_offering(&self, reqs: &Requirements) -> bool {
        self.min_available_price(reqs).is_some()
    }
}

/// What the provider reports about a launched instance. Mirrors the fields
/// the lifecycle controller copies into the claim status.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedInstance {
    pub provider_id: ProviderId,
    pub instance_type: String,
    pub zone: String,
    pub capacity_type: String,
    pub image_id: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: BTreeMap<String, Quantity>,
    pub allocatable: BTreeMap<String, Quantity>,
    pub created_at: DateTime<Utc>,
}
