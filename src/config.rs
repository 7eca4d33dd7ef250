//! Environment-driven settings.

use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Debug, Clone)]
pub struct Settings {
    /// Quiet period after the last pending-pod event before a batch closes.
    #[envconfig(from = "KARPENTER_BATCH_IDLE_SECONDS", default = "1")]
    pub batch_idle_seconds: u64,

    /// Hard ceiling on a batch window regardless of event churn.
    #[envconfig(from = "KARPENTER_BATCH_MAX_SECONDS", default = "10")]
    pub batch_max_seconds: u64,

    /// How long a launched claim may wait for its node before liveness
    /// deletes it.
    #[envconfig(from = "KARPENTER_REGISTRATION_TTL_SECONDS", default = "900")]
    pub registration_ttl_seconds: u64,

    /// Grace before an unclaimed cloud instance is garbage collected.
    #[envconfig(from = "KARPENTER_ORPHAN_GRACE_SECONDS", default = "120")]
    pub orphan_grace_seconds: u64,

    #[envconfig(from = "KARPENTER_GC_INTERVAL_SECONDS", default = "120")]
    pub gc_interval_seconds: u64,

    /// Cadence of drift and expiry checks on settled claims.
    #[envconfig(from = "KARPENTER_DRIFT_INTERVAL_SECONDS", default = "300")]
    pub drift_interval_seconds: u64,

    /// Cap on instance types persisted per claim.
    #[envconfig(from = "KARPENTER_MAX_INSTANCE_TYPES", default = "60")]
    pub max_instance_types: usize,

    /// TTL for offerings blacklisted after insufficient-capacity errors.
    #[envconfig(from = "KARPENTER_UNAVAILABLE_OFFERING_TTL_SECONDS", default = "180")]
    pub unavailable_offering_ttl_seconds: u64,

    /// TTL for cached per-pool instance-type catalogs.
    #[envconfig(from = "KARPENTER_INSTANCE_TYPE_TTL_SECONDS", default = "300")]
    pub instance_type_ttl_seconds: u64,

    /// Bind address for /metrics and /healthz.
    #[envconfig(from = "KARPENTER_LISTEN_ADDR", default = "0.0.0.0:8080")]
    pub listen_addr: String,
}

impl Settings {
    pub fn batch_idle(&self) -> Duration {
        Duration::from_secs(self.batch_idle_seconds)
    }

    pub fn batch_max(&self) -> Duration {
        Duration::from_secs(self.batch_max_seconds)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_seconds)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_seconds)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_secs(self.drift_interval_seconds)
    }

    pub fn unavailable_offering_ttl(&self) -> Duration {
        Duration::from_secs(self.unavailable_offering_ttl_seconds)
    }

    pub fn instance_type_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_type_ttl_seconds)
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Mirrors the envconfig defaults for tests and tooling that build
        // settings without an environment.
        Self {
            batch_idle_seconds: 1,
            batch_max_seconds: 10,
            registration_ttl_seconds: 900,
            orphan_grace_seconds: 120,
            gc_interval_seconds: 120,
            drift_interval_seconds: 300,
            max_instance_types: 60,
            unavailable_offering_ttl_seconds: 180,
            instance_type_ttl_seconds: 300,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.batch_idle(), Duration::from_secs(1));
        assert_eq!(settings.batch_max(), Duration::from_secs(10));
        assert_eq!(settings.registration_ttl(), Duration::from_secs(900));
        assert_eq!(settings.orphan_grace(), Duration::from_secs(120));
        assert_eq!(settings.max_instance_types, 60);
    }
}
