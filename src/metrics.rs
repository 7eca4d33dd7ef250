//! Prometheus metrics, served on `/metrics`.

use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

impl ReasonLabels {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
    pub nodepool: String,
}

pub struct Metrics {
    registry: Registry,
    /// Claims removed outside of normal consolidation, by reason
    /// (`liveness`, `drift`, `expiration`, `garbage_collection`).
    pub nodeclaims_disrupted_total: Family<ReasonLabels, Counter>,
    pub nodeclaims_created_total: Family<PoolLabels, Counter>,
    pub nodeclaims_terminated_total: Family<PoolLabels, Counter>,
    pub nodes_registered_total: Family<PoolLabels, Counter>,
    pub scheduling_duration_seconds: Histogram,
    pub scheduling_errors_total: Family<ReasonLabels, Counter>,
    /// Seconds a pod stayed unbound before the scheduler resolved it.
    pub pods_unbound_time_seconds: Histogram,
    pub evictions_total: Family<ReasonLabels, Counter>,
    pub eviction_queue_depth: Gauge,
    pub cluster_state_synced: Gauge,
    pub cluster_state_node_count: Gauge,
    pub cluster_state_pod_count: Gauge,
    pub cloudprovider_errors_total: Family<ReasonLabels, Counter>,
    /// CPU currently provisioned per pool, in milli-cores.
    pub nodepool_usage_cpu_millis: Family<PoolLabels, Gauge>,
    pub status_condition_transitions_total: Family<ReasonLabels, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("karpenter");

        let nodeclaims_disrupted_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "nodeclaims_disrupted",
            "Node claims disrupted outside voluntary consolidation",
            nodeclaims_disrupted_total.clone(),
        );
        let nodeclaims_created_total = Family::<PoolLabels, Counter>::default();
        registry.register(
            "nodeclaims_created",
            "Node claims created per pool",
            nodeclaims_created_total.clone(),
        );
        let nodeclaims_terminated_total = Family::<PoolLabels, Counter>::default();
        registry.register(
            "nodeclaims_terminated",
            "Node claims fully terminated per pool",
            nodeclaims_terminated_total.clone(),
        );
        let nodes_registered_total = Family::<PoolLabels, Counter>::default();
        registry.register(
            "nodes_registered",
            "Nodes that completed registration per pool",
            nodes_registered_total.clone(),
        );

        let scheduling_duration_seconds =
            Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            "scheduler_scheduling_duration_seconds",
            "Wall time of one scheduling pass",
            scheduling_duration_seconds.clone(),
        );
        let scheduling_errors_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "scheduler_errors",
            "Pods that failed a scheduling pass, by reason",
            scheduling_errors_total.clone(),
        );
        let pods_unbound_time_seconds = Histogram::new(exponential_buckets(1.0, 2.0, 12));
        registry.register(
            "pods_unbound_time_seconds",
            "Time pods spent unbound before scheduling resolved them",
            pods_unbound_time_seconds.clone(),
        );

        let evictions_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "voluntary_disruption_evictions",
            "Eviction attempts by outcome",
            evictions_total.clone(),
        );
        let eviction_queue_depth = Gauge::default();
        registry.register(
            "termination_eviction_queue_depth",
            "Entries currently queued for eviction",
            eviction_queue_depth.clone(),
        );

        let cluster_state_synced = Gauge::default();
        registry.register(
            "cluster_state_synced",
            "1 when every watch source has delivered its initial list",
            cluster_state_synced.clone(),
        );
        let cluster_state_node_count = Gauge::default();
        registry.register(
            "cluster_state_node_count",
            "State nodes currently tracked",
            cluster_state_node_count.clone(),
        );
        let cluster_state_pod_count = Gauge::default();
        registry.register(
            "cluster_state_pod_count",
            "Bound pods currently tracked",
            cluster_state_pod_count.clone(),
        );

        let cloudprovider_errors_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "cloudprovider_errors",
            "Cloud provider call failures by kind",
            cloudprovider_errors_total.clone(),
        );

        let nodepool_usage_cpu_millis = Family::<PoolLabels, Gauge>::default();
        registry.register(
            "nodepool_usage_cpu_millis",
            "CPU provisioned under each pool, in milli-cores",
            nodepool_usage_cpu_millis.clone(),
        );
        let status_condition_transitions_total = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "status_condition_transitions",
            "Status condition transitions on node claims, by condition type",
            status_condition_transitions_total.clone(),
        );

        Self {
            registry,
            nodeclaims_disrupted_total,
            nodeclaims_created_total,
            nodeclaims_terminated_total,
            nodes_registered_total,
            scheduling_duration_seconds,
            scheduling_errors_total,
            pods_unbound_time_seconds,
            evictions_total,
            eviction_queue_depth,
            cluster_state_synced,
            cluster_state_node_count,
            cluster_state_pod_count,
            cloudprovider_errors_total,
            nodepool_usage_cpu_millis,
            status_condition_transitions_total,
        }
    }

    pub fn render(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            buffer.clear();
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_reason_labels() {
        let metrics = Metrics::new();
        metrics
            .nodeclaims_disrupted_total
            .get_or_create(&ReasonLabels::new("liveness"))
            .inc();
        let output = metrics.render();
        assert!(output.contains("karpenter_nodeclaims_disrupted_total"));
        assert!(output.contains("reason=\"liveness\""));
    }

    #[test]
    fn gauges_default_to_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.eviction_queue_depth.get(), 0);
        let output = metrics.render();
        assert!(output.contains("karpenter_cluster_state_synced"));
    }
}
