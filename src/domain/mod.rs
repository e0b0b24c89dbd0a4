//! Domain query resolution.
//!
//! A `DomainQuery` abstractly names the containers a task must execute on;
//! resolving it against a pool's generation-versioned domain map yields the
//! concrete `(node, local query)` pairs. Resolution is deterministic for a
//! fixed map generation, so updates bump the generation and are applied
//! atomically before dependent tasks are admitted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::task::{ContainerId, NodeId, PoolId};

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

/// Errors that can occur during domain resolution.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Unknown pool: {0}")]
    UnknownPool(PoolId),

    #[error("Pool {pool} has no container {container}")]
    MissingContainer { pool: PoolId, container: ContainerId },

    #[error("Pool {0} has an empty domain map")]
    EmptyDomain(PoolId),
}

/// The subdomain a query selects within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubDomain {
    /// Every container of the pool, cluster-wide.
    GlobalContainers,
    /// The containers resident on the local node.
    LocalContainers,
    /// An explicit container set addressed by id.
    ContainerSet,
}

/// How the query selects containers within its subdomain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selection {
    /// Exactly the container with this id.
    DirectId(ContainerId),
    /// Exactly one container, picked by hashing into the domain.
    DirectHash(u32),
    /// Every node holding any container of the pool.
    Global,
    /// Like `Global`, explicitly marked as a broadcast.
    GlobalBcast,
}

/// A routing descriptor: subdomain kind plus selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainQuery {
    pub sub: SubDomain,
    pub sel: Selection,
    /// The query addresses containers on the local node only.
    pub local: bool,
}

impl DomainQuery {
    /// Address exactly one container by id.
    pub fn direct_id(sub: SubDomain, id: ContainerId) -> Self {
        Self {
            sub,
            sel: Selection::DirectId(id),
            local: matches!(sub, SubDomain::LocalContainers | SubDomain::ContainerSet),
        }
    }

    /// Address exactly one container by hash.
    pub fn direct_hash(sub: SubDomain, hash: u32) -> Self {
        Self {
            sub,
            sel: Selection::DirectHash(hash),
            local: matches!(sub, SubDomain::LocalContainers),
        }
    }

    /// Address every node holding a container of the pool.
    pub fn global(sub: SubDomain) -> Self {
        Self {
            sub,
            sel: Selection::Global,
            local: false,
        }
    }

    /// Broadcast to every node holding a container of the pool.
    pub fn global_bcast() -> Self {
        Self {
            sub: SubDomain::GlobalContainers,
            sel: Selection::GlobalBcast,
            local: false,
        }
    }

    /// A fully resolved, node-local, id-addressed query.
    pub fn local_id(id: ContainerId) -> Self {
        Self {
            sub: SubDomain::ContainerSet,
            sel: Selection::DirectId(id),
            local: true,
        }
    }

    /// True when this query is both local and id-addressed, the two flags
    /// required (with a single-result local resolution) for the fast path
    /// that bypasses replication.
    pub fn is_local_id(&self) -> bool {
        self.local && matches!(self.sel, Selection::DirectId(_))
    }

    /// The container id, when the query is id-addressed.
    pub fn container_id(&self) -> Option<ContainerId> {
        match self.sel {
            Selection::DirectId(id) => Some(id),
            _ => None,
        }
    }

    /// A stable hash of the query, used for lane selection.
    pub fn routing_hash(&self) -> u32 {
        match self.sel {
            Selection::DirectId(id) => id,
            Selection::DirectHash(hash) => hash,
            Selection::Global | Selection::GlobalBcast => 0,
        }
    }
}

impl fmt::Display for DomainQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.sub, self.sel)
    }
}

/// The output of resolution: a concrete node plus the query to apply there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDomainQuery {
    pub node: NodeId,
    pub query: DomainQuery,
}

/// One atomic change to a pool's domain map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainUpdate {
    /// Place (or move) a container on a node.
    Assign { container: ContainerId, node: NodeId },
    /// Remove a container from the map.
    Remove { container: ContainerId },
}

#[derive(Debug, Default)]
struct PoolDomain {
    generation: u64,
    /// Container id -> owning node. BTreeMap keeps hash selection stable
    /// across nodes for a fixed generation.
    containers: BTreeMap<ContainerId, NodeId>,
}

/// Generation-versioned partitioning of every pool's containers onto nodes.
pub struct DomainTable {
    local: NodeId,
    pools: RwLock<HashMap<PoolId, PoolDomain>>,
}

impl DomainTable {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Apply an update list atomically and bump the pool's generation.
    pub async fn update_domains(&self, pool: PoolId, ops: &[DomainUpdate]) -> u64 {
        let mut pools = self.pools.write().await;
        let entry = pools.entry(pool).or_default();
        for op in ops {
            match *op {
                DomainUpdate::Assign { container, node } => {
                    entry.containers.insert(container, node);
                }
                DomainUpdate::Remove { container } => {
                    entry.containers.remove(&container);
                }
            }
        }
        entry.generation += 1;
        info!(
            pool = %pool,
            generation = entry.generation,
            containers = entry.containers.len(),
            "Updated domain map"
        );
        entry.generation
    }

    /// Drop a pool's domain map entirely.
    pub async fn remove_pool(&self, pool: PoolId) {
        let mut pools = self.pools.write().await;
        if pools.remove(&pool).is_none() {
            warn!(pool = %pool, "Removing unknown pool from domain table");
        }
    }

    /// The current generation of a pool's map.
    pub async fn generation(&self, pool: PoolId) -> Result<u64> {
        let pools = self.pools.read().await;
        pools
            .get(&pool)
            .map(|d| d.generation)
            .ok_or(DomainError::UnknownPool(pool))
    }

    /// Number of containers the pool places in the named subdomain.
    pub async fn domain_size(&self, pool: PoolId, sub: SubDomain) -> Result<usize> {
        let pools = self.pools.read().await;
        let dom = pools.get(&pool).ok_or(DomainError::UnknownPool(pool))?;
        Ok(match sub {
            SubDomain::GlobalContainers | SubDomain::ContainerSet => dom.containers.len(),
            SubDomain::LocalContainers => dom
                .containers
                .values()
                .filter(|node| **node == self.local)
                .count(),
        })
    }

    /// The containers of a pool resident on the local node.
    pub async fn local_containers(&self, pool: PoolId) -> Result<Vec<ContainerId>> {
        let pools = self.pools.read().await;
        let dom = pools.get(&pool).ok_or(DomainError::UnknownPool(pool))?;
        Ok(dom
            .containers
            .iter()
            .filter(|(_, node)| **node == self.local)
            .map(|(id, _)| *id)
            .collect())
    }

    /// Resolve a query against the pool's current domain map.
    ///
    /// The returned set is stable for a fixed generation: direct queries
    /// yield exactly one pair, global queries one pair per node holding any
    /// container of the pool.
    pub async fn resolve(&self, pool: PoolId, query: &DomainQuery) -> Result<Vec<ResolvedDomainQuery>> {
        let pools = self.pools.read().await;
        let dom = pools.get(&pool).ok_or(DomainError::UnknownPool(pool))?;

        // The subdomain bounds the candidate set before selection applies:
        // queries over local containers never leave this node.
        let candidates: Vec<(ContainerId, NodeId)> = match query.sub {
            SubDomain::LocalContainers => dom
                .containers
                .iter()
                .filter(|(_, node)| **node == self.local)
                .map(|(c, n)| (*c, *n))
                .collect(),
            SubDomain::GlobalContainers | SubDomain::ContainerSet => {
                dom.containers.iter().map(|(c, n)| (*c, *n)).collect()
            }
        };
        if candidates.is_empty() {
            return Err(DomainError::EmptyDomain(pool));
        }

        let resolved = match query.sel {
            Selection::DirectId(container) => {
                let node = candidates
                    .iter()
                    .find(|(c, _)| *c == container)
                    .map(|(_, n)| *n)
                    .ok_or(DomainError::MissingContainer { pool, container })?;
                vec![ResolvedDomainQuery {
                    node,
                    query: DomainQuery::local_id(container),
                }]
            }
            Selection::DirectHash(hash) => {
                let (container, node) = candidates[hash as usize % candidates.len()];
                vec![ResolvedDomainQuery {
                    node,
                    query: DomainQuery::local_id(container),
                }]
            }
            Selection::Global | Selection::GlobalBcast => {
                // One delivery per node; the per-node query picks the first
                // candidate container so routing stays deterministic.
                let mut per_node: BTreeMap<NodeId, ContainerId> = BTreeMap::new();
                for (container, node) in &candidates {
                    per_node.entry(*node).or_insert(*container);
                }
                per_node
                    .into_iter()
                    .map(|(node, container)| ResolvedDomainQuery {
                        node,
                        query: DomainQuery::local_id(container),
                    })
                    .collect()
            }
        };
        debug!(pool = %pool, query = %query, results = resolved.len(), "Resolved domain query");
        Ok(resolved)
    }

    /// Whether the resolution allows the task to bypass replication: a
    /// single result on the local node with a local, id-addressed query.
    pub fn is_local_fast_path(&self, resolved: &[ResolvedDomainQuery]) -> bool {
        resolved.len() == 1 && resolved[0].node == self.local && resolved[0].query.is_local_id()
    }
}
