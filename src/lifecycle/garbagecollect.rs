//! Orphan garbage collection.
//!
//! Launches can succeed on the provider side while the claim write is lost,
//! and claims can be deleted out from under their instances. Each sweep
//! compares the provider's inventory with the cluster's and deletes what
//! nobody owns.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cloudprovider::types::CreatedInstance;

pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(2 * 60);

/// An instance is an orphan when no claim knows its provider ID, it has had
/// a grace window to show up, and its node is not Ready (a Ready node with
/// no claim means an operator adopted it; leave it alone).
pub fn is_orphan(
    instance: &CreatedInstance,
    known_provider_ids: &HashSet<String>,
    node_ready: bool,
    grace: Duration,
    now: DateTime<Utc>,
) -> bool {
    if known_provider_ids.contains(&instance.provider_id.0) {
        return false;
    }
    if node_ready {
        return false;
    }
    now.signed_duration_since(instance.created_at)
        >= chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX)
}
