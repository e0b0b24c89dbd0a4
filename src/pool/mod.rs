//! Pools, containers, and the module registry.
//!
//! A pool is a named, distributed instance of a module; each of its
//! containers is a shard owning a slice of the pool's state plus the lanes
//! feeding it. Modules are linked into the binary and announce themselves
//! through `inventory`; the registry constructs containers from those
//! factories and dispatches node-local tasks onto container lanes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::DomainQuery;
use crate::lane::{Lane, LaneError, LaneGroup};
use crate::task::{ContainerId, MethodId, NodeId, PoolId, Task, TaskPrio};

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur managing pools and running module methods.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool id must not be nil")]
    NilPoolId,

    #[error("Pool {0} already exists")]
    DuplicatePool(PoolId),

    #[error("No module registered under name: {0}")]
    UnknownModule(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(PoolId),

    #[error("Pool {pool} has no local container {container}")]
    UnknownContainer { pool: PoolId, container: ContainerId },

    #[error("Task query is not resolved to a container")]
    UnresolvedQuery,

    #[error("Method {0} is not implemented by this module")]
    UnknownMethod(MethodId),

    #[error("Task payload has the wrong type for method {0}")]
    BadPayload(MethodId),

    #[error(transparent)]
    Lane(#[from] LaneError),

    #[error("Encode failure: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode failure: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Phase of a monitor callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// A replica set is about to fan out; the origin task observes it.
    ReplicaStart,
    /// All replicas finished; fold their outputs into the origin task.
    ReplicaAgg,
    /// A flush sweep is visiting the container.
    Flush,
}

/// Per-container state shared by every module implementation: identity plus
/// the lanes feeding the container.
pub struct ContainerBase {
    pub pool: PoolId,
    pub container: ContainerId,
    pub name: String,
    low_latency: LaneGroup,
    high_latency: LaneGroup,
}

impl ContainerBase {
    pub fn new(
        pool: PoolId,
        container: ContainerId,
        name: String,
        lanes_per_group: u32,
        queue_depth: usize,
    ) -> Self {
        Self {
            pool,
            container,
            name,
            low_latency: LaneGroup::new(pool, container, lanes_per_group, TaskPrio::LowLatency, queue_depth),
            high_latency: LaneGroup::new(pool, container, lanes_per_group, TaskPrio::HighLatency, queue_depth),
        }
    }

    pub fn lane_group(&self, prio: TaskPrio) -> &LaneGroup {
        match prio {
            TaskPrio::LowLatency => &self.low_latency,
            TaskPrio::HighLatency => &self.high_latency,
        }
    }

    /// All lanes of the container, across priorities.
    pub fn all_lanes(&self) -> impl Iterator<Item = &Arc<Lane>> {
        self.low_latency.lanes().iter().chain(self.high_latency.lanes().iter())
    }

    /// Outstanding work across every lane of the container.
    pub fn load(&self) -> usize {
        self.low_latency.load() + self.high_latency.load()
    }
}

/// The contract every module's container implements.
///
/// `run` is the only required method; the rest have defaults that suit
/// modules without replication-aware state or owned payloads.
#[async_trait]
pub trait ContainerModule: Send + Sync {
    fn base(&self) -> &ContainerBase;

    /// The concrete container, for callers that know the module type.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Map a task to one of the container's lanes. The default hashes the
    /// task's domain query so equal queries share a lane.
    fn route(&self, task: &Task) -> Arc<Lane> {
        let group = self.base().lane_group(task.prio);
        Arc::clone(group.by_hash(task.dom_query().routing_hash()))
    }

    /// Execute one method invocation against container state.
    async fn run(&self, method: MethodId, task: &Arc<Task>) -> Result<()>;

    /// Observe scheduling events. The default ignores them.
    async fn monitor(
        &self,
        mode: MonitorMode,
        method: MethodId,
        task: &Arc<Task>,
        replicas: &[Arc<Task>],
    ) -> Result<()> {
        let _ = (mode, method, task, replicas);
        Ok(())
    }

    /// Release task-held resources before the task is freed.
    fn del(&self, method: MethodId, task: &Task) {
        let _ = method;
        task.drop_payload();
    }

    /// Copy a task's input payload into a replica shell. `deep` requests an
    /// owned duplicate of any buffers the task merely references.
    fn copy_start(&self, method: MethodId, from: &Task, to: &Task, deep: bool) -> Result<()>;

    /// Serialize a task's input payload for transfer to another node.
    fn save_start(&self, method: MethodId, task: &Task) -> Result<Vec<u8>>;

    /// Deserialize input bytes into a freshly constructed task shell.
    fn load_start(&self, method: MethodId, task: &Task, bytes: &[u8]) -> Result<()>;

    /// Serialize a completed task's output payload.
    fn save_end(&self, method: MethodId, task: &Task) -> Result<Vec<u8>>;

    /// Apply output bytes back onto the origin task.
    fn load_end(&self, method: MethodId, task: &Task, bytes: &[u8]) -> Result<()>;
}

impl std::fmt::Debug for dyn ContainerModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerModule").finish_non_exhaustive()
    }
}

/// Construct a replica shell of a task: same graph position, pool, method,
/// priority, and wire flags, with its payload copied by the owning module.
pub fn new_copy(
    module: &dyn ContainerModule,
    from: &Arc<Task>,
    query: DomainQuery,
    deep: bool,
) -> Result<Arc<Task>> {
    let to = Task::with_prio(from.node, from.pool, from.method, query, from.prio);
    to.flags.restore(&from.flags.snapshot());
    if !deep {
        // A shallow copy shares buffers; only one owner may free them.
        to.unset_data_owner();
    }
    module.copy_start(from.method, from, &to, deep)?;
    Ok(to)
}

/// A module linked into the binary, discovered through `inventory`.
pub struct RegisteredModule {
    pub name: &'static str,
    pub construct: fn(ContainerBase) -> Arc<dyn ContainerModule>,
}

inventory::collect!(RegisteredModule);

struct PoolEntry {
    name: String,
    module: &'static str,
    /// Stateless instance used for serialization and copy callbacks on
    /// nodes that host no container of the pool.
    proto: Arc<dyn ContainerModule>,
    containers: HashMap<ContainerId, Arc<dyn ContainerModule>>,
}

/// Node-local registry of pools and their resident containers.
pub struct ModuleRegistry {
    node: NodeId,
    lanes_per_group: u32,
    queue_depth: usize,
    factories: HashMap<&'static str, fn(ContainerBase) -> Arc<dyn ContainerModule>>,
    pools: RwLock<HashMap<PoolId, PoolEntry>>,
    names: RwLock<HashMap<String, PoolId>>,
}

impl ModuleRegistry {
    pub fn new(node: NodeId, lanes_per_group: u32, queue_depth: usize) -> Self {
        let mut factories = HashMap::new();
        for module in inventory::iter::<RegisteredModule> {
            factories.insert(module.name, module.construct);
        }
        info!(node, modules = factories.len(), "Loaded module factories");
        Self {
            node,
            lanes_per_group,
            queue_depth,
            factories,
            pools: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Register a pool id under its name; idempotent for the same pair.
    pub async fn register_pool(&self, module: &str, name: &str, pool: PoolId) -> Result<()> {
        if pool.is_nil() {
            return Err(PoolError::NilPoolId);
        }
        let module = *self
            .factories
            .get_key_value(module)
            .map(|(k, _)| k)
            .ok_or_else(|| PoolError::UnknownModule(module.to_string()))?;

        let mut pools = self.pools.write().await;
        if pools.contains_key(&pool) {
            return Err(PoolError::DuplicatePool(pool));
        }
        let construct = self.factories[module];
        let proto = construct(ContainerBase::new(pool, ContainerId::MAX, name.to_string(), 1, 1));
        pools.insert(
            pool,
            PoolEntry {
                name: name.to_string(),
                module,
                proto,
                containers: HashMap::new(),
            },
        );
        self.names.write().await.insert(name.to_string(), pool);
        info!(pool = %pool, name, module, "Registered pool");
        Ok(())
    }

    /// Construct a container of a registered pool on this node and run its
    /// module factory. Returns the new container for lane registration.
    pub async fn create_container(
        &self,
        pool: PoolId,
        container: ContainerId,
    ) -> Result<Arc<dyn ContainerModule>> {
        let mut pools = self.pools.write().await;
        let entry = pools.get_mut(&pool).ok_or(PoolError::UnknownPool(pool))?;
        let construct = self.factories[entry.module];
        let base = ContainerBase::new(
            pool,
            container,
            entry.name.clone(),
            self.lanes_per_group,
            self.queue_depth,
        );
        let module = construct(base);
        entry.containers.insert(container, Arc::clone(&module));
        debug!(pool = %pool, container, "Created container");
        Ok(module)
    }

    pub async fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.names.read().await.get(name).copied()
    }

    pub async fn pool_name(&self, pool: PoolId) -> Option<String> {
        self.pools.read().await.get(&pool).map(|e| e.name.clone())
    }

    /// The pool's stateless prototype, for serialization and copy
    /// callbacks independent of container residency.
    pub async fn get_proto(&self, pool: PoolId) -> Result<Arc<dyn ContainerModule>> {
        let pools = self.pools.read().await;
        pools
            .get(&pool)
            .map(|entry| Arc::clone(&entry.proto))
            .ok_or(PoolError::UnknownPool(pool))
    }

    /// Fetch a locally resident container.
    pub async fn get_container(
        &self,
        pool: PoolId,
        container: ContainerId,
    ) -> Result<Arc<dyn ContainerModule>> {
        let pools = self.pools.read().await;
        let entry = pools.get(&pool).ok_or(PoolError::UnknownPool(pool))?;
        entry
            .containers
            .get(&container)
            .cloned()
            .ok_or(PoolError::UnknownContainer { pool, container })
    }

    /// The locally resident containers of every pool.
    pub async fn local_containers(&self) -> Vec<Arc<dyn ContainerModule>> {
        let pools = self.pools.read().await;
        pools
            .values()
            .flat_map(|entry| entry.containers.values().cloned())
            .collect()
    }

    /// Route a node-local task onto its container's lane.
    ///
    /// The task's domain query must already be resolved to a local container
    /// id; unresolved queries are rejected here rather than misrouted.
    pub async fn dispatch_local(&self, task: Arc<Task>) -> Result<Arc<Lane>> {
        let query = task.dom_query();
        let container = query.container_id().ok_or(PoolError::UnresolvedQuery)?;
        let module = self.get_container(task.pool, container).await?;
        let mut lane = module.route(&task);
        if task.node.depth > 0 && lane.is_active(task.node.root) {
            // The routed lane is executing an ancestor of this sub-task; an
            // ancestor parked on the sub-task would wedge the lane. Steer to
            // a lane not running this graph, preferring another worker.
            let group = module.base().lane_group(task.prio);
            let alt = group
                .lanes()
                .iter()
                .filter(|l| !l.is_active(task.node.root))
                .min_by_key(|l| (l.worker() == lane.worker(), l.load()));
            match alt {
                Some(alt) => {
                    debug!(
                        task = %task.node,
                        from = lane.id(),
                        to = alt.id(),
                        "Rerouted sub-task off its ancestor's lane"
                    );
                    lane = Arc::clone(alt);
                }
                None => warn!(
                    task = %task.node,
                    lane = lane.id(),
                    "Every lane is running this task graph; sub-task may stall its waiter"
                ),
            }
        }
        lane.emplace_yielding(Arc::clone(&task)).await?;
        debug!(
            task = %task.node.root,
            pool = %task.pool,
            container,
            lane = lane.id(),
            "Dispatched local task"
        );
        Ok(lane)
    }

    /// Tear down a pool's local containers, releasing their task resources.
    pub async fn destroy_pool(&self, pool: PoolId) -> Result<()> {
        let mut pools = self.pools.write().await;
        let entry = pools.remove(&pool).ok_or(PoolError::UnknownPool(pool))?;
        self.names.write().await.remove(&entry.name);
        if !entry.containers.is_empty() {
            info!(pool = %pool, containers = entry.containers.len(), "Destroyed pool");
        } else {
            warn!(pool = %pool, "Destroyed pool with no local containers");
        }
        Ok(())
    }

    /// Total outstanding work across every local container's lanes.
    pub async fn total_load(&self) -> usize {
        let pools = self.pools.read().await;
        pools
            .values()
            .flat_map(|entry| entry.containers.values())
            .map(|module| module.base().load())
            .sum()
    }
}

#[cfg(test)]
mod tests;
