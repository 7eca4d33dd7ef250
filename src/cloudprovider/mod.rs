//! Cloud-provider contract.
//!
//! The provider's responsibility is to turn a NodeClaim into a machine that
//! joins the cluster, or to fail loudly. Only simulation-grade providers
//! live in-tree: kwok (nodes without kubelets) and a deterministic fake for
//! tests. Real SDK wrappers are external collaborators implementing the same
//! five operations.

pub mod fake;
pub mod kwok;
pub mod types;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::apis::{NodeClaim, NodePool};
use crate::cloudprovider::fake::FakeProvider;
use crate::cloudprovider::kwok::KwokProvider;
use crate::cloudprovider::types::{CreatedInstance, InstanceType, ProviderId};

#[derive(Debug, thiserror::Error)]
pub enum CloudProviderError {
    /// The specific offering is sold out. The scheduler blacklists the
    /// (instance-type, zone, capacity-type) tuple for a TTL and moves on.
    #[error("insufficient capacity for {instance_type} ({capacity_type}) in {zone}")]
    InsufficientCapacity {
        instance_type: String,
        zone: String,
        capacity_type: String,
    },

    /// The provider couldn't create the instance at all. Bad permissions,
    /// quota exceeded, invalid config.
    #[error("creation failed: {message}")]
    CreationFailed { message: String },

    /// No instance with the given provider ID exists.
    #[error("instance {0} not found")]
    NotFound(ProviderId),

    /// Underlying API/network error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CloudProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Provide instances from a given backend. Enum dispatch: no cluster mixes
/// providers, and the closed set keeps call sites free of trait objects.
pub enum CloudProvider {
    Kwok(KwokProvider),
    Fake(FakeProvider),
}

impl CloudProvider {
    /// Launch an instance satisfying the claim's requirements. On success
    /// the returned record carries the provider ID, resolved labels and
    /// capacity that the lifecycle controller persists to the claim status.
    pub async fn create(&self, claim: &NodeClaim) -> Result<CreatedInstance, CloudProviderError> {
        match self {
            Self::Kwok(p) => p.create(claim).await,
            Self::Fake(p) => p.create(claim).await,
        }
    }

    pub async fn get(
        &self,
        provider_id: &ProviderId,
    ) -> Result<CreatedInstance, CloudProviderError> {
        match self {
            Self::Kwok(p) => p.get(provider_id).await,
            Self::Fake(p) => p.get(provider_id).await,
        }
    }

    /// All live instances owned by this controller, for garbage collection.
    pub async fn list(&self) -> Result<Vec<CreatedInstance>, CloudProviderError> {
        match self {
            Self::Kwok(p) => p.list().await,
            Self::Fake(p) => p.list().await,
        }
    }

    pub async fn delete(&self, provider_id: &ProviderId) -> Result<(), CloudProviderError> {
        match self {
            Self::Kwok(p) => p.delete(provider_id).await,
            Self::Fake(p) => p.delete(provider_id).await,
        }
    }

    /// Whether the instance backing the claim no longer matches what the
    /// claim asked for. Returns the drift reason when drifted.
    pub async fn is_drifted(
        &self,
        claim: &NodeClaim,
    ) -> Result<Option<String>, CloudProviderError> {
        match self {
            Self::Kwok(p) => p.is_drifted(claim).await,
            Self::Fake(p) => p.is_drifted(claim).await,
        }
    }

    pub async fn instance_types(
        &self,
        pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        match self {
            Self::Kwok(p) => p.instance_types(pool).await,
            Self::Fake(p) => p.instance_types(pool).await,
        }
    }

    /// Node-class kinds this provider understands, advertised so pool
    /// admission can reject references to foreign providers' classes.
    pub fn supported_node_classes(&self) -> Vec<&'static str> {
        match self {
            Self::Kwok(_) => vec!["KwokNodeClass"],
            Self::Fake(_) => vec!["FakeNodeClass"],
        }
    }
}

/// Offerings recently rejected with insufficient capacity. Scheduling passes
/// skip these until the TTL lapses.
pub struct UnavailableOfferings {
    ttl: Duration,
    inner: Mutex<HashMap<(String, String, String), Instant>>,
}

impl UnavailableOfferings {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60);

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, instance_type: &str, zone: &str, capacity_type: &str) {
        self.inner.lock().unwrap().insert(
            (
                instance_type.to_string(),
                zone.to_string(),
                capacity_type.to_string(),
            ),
            Instant::now() + self.ttl,
        );
    }

    pub fn is_unavailable(&self, instance_type: &str, zone: &str, capacity_type: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.retain(|_, expiry| *expiry > now);
        inner.contains_key(&(
            instance_type.to_string(),
            zone.to_string(),
            capacity_type.to_string(),
        ))
    }

    /// Apply the blacklist to a catalog snapshot by flipping matching
    /// offerings to unavailable.
    pub fn filter(&self, instance_types: &mut [InstanceType]) {
        for it in instance_types {
            for offering in &mut it.offerings {
                if offering.available
                    && self.is_unavailable(&it.name, &offering.zone, &offering.capacity_type)
                {
                    offering.available = false;
                }
            }
        }
    }
}

impl Default for UnavailableOfferings {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

/// Write-through TTL cache for per-pool instance-type catalogs, so hot
/// scheduling loops don't hammer provider pricing endpoints.
pub struct InstanceTypeCache {
    ttl: Duration,
    inner: Mutex<HashMap<String, (Instant, Vec<InstanceType>)>>,
}

impl InstanceTypeCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        provider: &CloudProvider,
        pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        let key = pool.metadata.name.clone().unwrap_or_default();
        if let Some((fetched_at, cached)) = self.inner.lock().unwrap().get(&key) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }
        let fresh = provider.instance_types(pool).await?;
        self.inner
            .lock()
            .unwrap()
            .insert(key, (Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    pub fn invalidate(&self, pool_name: &str) {
        self.inner.lock().unwrap().remove(pool_name);
    }
}

impl Default for InstanceTypeCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_offerings_expire() {
        let cache = UnavailableOfferings::new(Duration::from_millis(0));
        cache.mark("c-4x", "z1", "spot");
        // Zero TTL: expired by the time we ask.
        assert!(!cache.is_unavailable("c-4x", "z1", "spot"));

        let cache = UnavailableOfferings::new(Duration::from_secs(60));
        cache.mark("c-4x", "z1", "spot");
        assert!(cache.is_unavailable("c-4x", "z1", "spot"));
        assert!(!cache.is_unavailable("c-4x", "z2", "spot"));
    }
}
