//! A deterministic, in-memory provider for testing failure modes.
//!
//! Each call to `create()`/`delete()` pops the next behavior from a queue;
//! when the queue is empty, the configured default applies. Created
//! instances are tracked so `get`/`list` and garbage-collection tests see a
//! consistent inventory.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::apis::{NodeClaim, NodePool};
use crate::cloudprovider::types::{CreatedInstance, InstanceType, ProviderId};
use crate::cloudprovider::CloudProviderError;
use crate::scheduling::labels;

/// What happens on the next `create()` call.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// Happy path — returns a resolved instance.
    Succeed,
    /// Returns Ok after sleeping for the given duration.
    SucceedAfterDelay(Duration),
    /// The chosen offering is sold out.
    InsufficientCapacity,
    /// General creation failure.
    CreationFailed(String),
    /// Network/API blowup.
    InternalError(String),
}

/// What happens on the next `delete()` call.
#[derive(Debug, Clone)]
pub enum DeleteBehavior {
    Succeed,
    /// The instance is already gone.
    NotFound,
    Fail(String),
}

/// Logged record of a `create()` call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub claim_name: String,
    pub result_provider_id: Option<ProviderId>,
}

/// Logged record of a `delete()` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub provider_id: ProviderId,
}

#[derive(Debug)]
struct FakeProviderState {
    instance_types: Vec<InstanceType>,
    create_behaviors: VecDeque<CreateBehavior>,
    delete_behaviors: VecDeque<DeleteBehavior>,
    default_create: CreateBehavior,
    default_delete: DeleteBehavior,
    instances: HashMap<ProviderId, CreatedInstance>,
    drifted: HashMap<String, String>,
    create_calls: Vec<CreateCall>,
    delete_calls: Vec<DeleteCall>,
}

#[derive(Clone)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
    next_id: Arc<AtomicU64>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProviderState {
                instance_types: Vec::new(),
                create_behaviors: VecDeque::new(),
                delete_behaviors: VecDeque::new(),
                default_create: CreateBehavior::Succeed,
                default_delete: DeleteBehavior::Succeed,
                instances: HashMap::new(),
                drifted: HashMap::new(),
                create_calls: Vec::new(),
                delete_calls: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // ── Builder methods ──────────────────────────────────────────────

    pub fn with_instance_types(self, instance_types: Vec<InstanceType>) -> Self {
        self.state.lock().unwrap().instance_types = instance_types;
        self
    }

    pub fn on_next_create(self, behavior: CreateBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .create_behaviors
            .push_back(behavior);
        self
    }

    pub fn on_next_delete(self, behavior: DeleteBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .delete_behaviors
            .push_back(behavior);
        self
    }

    pub fn with_default_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().default_create = behavior;
        self
    }

    pub fn with_default_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().default_delete = behavior;
        self
    }

    /// Mark a claim (by name) as drifted with the given reason.
    pub fn set_drifted(&self, claim_name: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .drifted
            .insert(claim_name.to_string(), reason.to_string());
    }

    /// Register an instance that exists on the provider side without a
    /// corresponding claim, for orphan garbage-collection tests.
    pub fn inject_instance(&self, instance: CreatedInstance) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance.provider_id.clone(), instance);
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn live_instances(&self) -> Vec<CreatedInstance> {
        self.state.lock().unwrap().instances.values().cloned().collect()
    }

    // ── Provider implementation ──────────────────────────────────────

    fn next_provider_id(&self) -> ProviderId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        ProviderId(format!("fake://instance-{n}"))
    }

    /// Resolve the claim's requirements against the catalog the same way a
    /// real provider would: first admissible instance type, cheapest
    /// available offering.
    fn resolve(&self, claim: &NodeClaim) -> Option<(InstanceType, String, String)> {
        let reqs = claim.requirements().ok()?;
        let state = self.state.lock().unwrap();
        let mut best: Option<(InstanceType, String, String, f64)> = None;
        for it in &state.instance_types {
            if !reqs.is_compatible(&it.requirements()) {
                continue;
            }
            for o in it.available_offerings() {
                if !reqs.has(labels::ZONE_LABEL, &o.zone)
                    || !reqs.has(labels::CAPACITY_TYPE_LABEL, &o.capacity_type)
                {
                    continue;
                }
                if best.as_ref().is_none_or(|(_, _, _, p)| o.price_per_hour < *p) {
                    best = Some((
                        it.clone(),
                        o.zone.clone(),
                        o.capacity_type.clone(),
                        o.price_per_hour,
                    ));
                }
            }
        }
        best.map(|(it, zone, ct, _)| (it, zone, ct))
    }

    pub async fn create(&self, claim: &NodeClaim) -> Result<CreatedInstance, CloudProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .create_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_create.clone())
        };

        let claim_name = claim.metadata.name.clone().unwrap_or_default();
        let result = match behavior {
            CreateBehavior::Succeed => self.materialize(claim),
            CreateBehavior::SucceedAfterDelay(d) => {
                tokio::time::sleep(d).await;
                self.materialize(claim)
            }
            CreateBehavior::InsufficientCapacity => {
                match self.resolve(claim) {
                    Some((it, zone, capacity_type)) => {
                        Err(CloudProviderError::InsufficientCapacity {
                            instance_type: it.name,
                            zone,
                            capacity_type,
                        })
                    }
                    None => Err(CloudProviderError::CreationFailed {
                        message: "no admissible instance type".to_string(),
                    }),
                }
            }
            CreateBehavior::CreationFailed(message) => {
                Err(CloudProviderError::CreationFailed { message })
            }
            CreateBehavior::InternalError(msg) => {
                Err(CloudProviderError::Internal(anyhow::anyhow!(msg)))
            }
        };

        let result_provider_id = result.as_ref().ok().map(|i| i.provider_id.clone());
        self.state.lock().unwrap().create_calls.push(CreateCall {
            claim_name,
            result_provider_id,
        });
        result
    }

    fn materialize(&self, claim: &NodeClaim) -> Result<CreatedInstance, CloudProviderError> {
        let (it, zone, capacity_type) =
            self.resolve(claim)
                .ok_or_else(|| CloudProviderError::CreationFailed {
                    message: "no admissible instance type".to_string(),
                })?;
        let provider_id = self.next_provider_id();
        let labels = BTreeMap::from([
            (labels::INSTANCE_TYPE_LABEL.to_string(), it.name.clone()),
            (labels::ARCH_LABEL.to_string(), it.architecture.clone()),
            (labels::OS_LABEL.to_string(), it.os.clone()),
            (labels::ZONE_LABEL.to_string(), zone.clone()),
            (
                labels::CAPACITY_TYPE_LABEL.to_string(),
                capacity_type.clone(),
            ),
            (
                labels::NODE_POOL_LABEL.to_string(),
                claim.spec.node_pool.clone(),
            ),
        ]);
        let instance = CreatedInstance {
            provider_id: provider_id.clone(),
            instance_type: it.name.clone(),
            zone,
            capacity_type,
            image_id: "fake-image-1".to_string(),
            labels,
            capacity: it.capacity.to_list(),
            allocatable: it.allocatable().to_list(),
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(provider_id, instance.clone());
        Ok(instance)
    }

    pub async fn get(
        &self,
        provider_id: &ProviderId,
    ) -> Result<CreatedInstance, CloudProviderError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(provider_id)
            .cloned()
            .ok_or_else(|| CloudProviderError::NotFound(provider_id.clone()))
    }

    pub async fn list(&self) -> Result<Vec<CreatedInstance>, CloudProviderError> {
        Ok(self.live_instances())
    }

    pub async fn delete(&self, provider_id: &ProviderId) -> Result<(), CloudProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .delete_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_delete.clone())
        };

        self.state.lock().unwrap().delete_calls.push(DeleteCall {
            provider_id: provider_id.clone(),
        });

        match behavior {
            DeleteBehavior::Succeed => {
                self.state.lock().unwrap().instances.remove(provider_id);
                Ok(())
            }
            DeleteBehavior::NotFound => Err(CloudProviderError::NotFound(provider_id.clone())),
            DeleteBehavior::Fail(message) => Err(CloudProviderError::CreationFailed { message }),
        }
    }

    pub async fn is_drifted(
        &self,
        claim: &NodeClaim,
    ) -> Result<Option<String>, CloudProviderError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        Ok(self.state.lock().unwrap().drifted.get(&name).cloned())
    }

    pub async fn instance_types(
        &self,
        _pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        Ok(self.state.lock().unwrap().instance_types.clone())
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}
