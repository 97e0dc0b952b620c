//! ShardRegistry - live health managers for every known shard
//!
//! The registry turns the control catalog's shard list into one
//! [`ConnectionManager`] per shard and picks the "current" shard for
//! operations scoped to the most recently active partition.
//!
//! # Architecture
//!
//! - Managers live in an `RwLock<BTreeMap>`; readers clone the `Arc` out and
//!   release the lock before doing any I/O
//! - Shards are only ever added. A shard missing from a later catalog read
//!   keeps its manager so routing data stays usable
//! - One registry per process, owned by the store and passed by handle
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use sharddb::cache::CacheControl;
//! use sharddb::client::PoolSettings;
//! use sharddb::memory::MemoryCluster;
//! use sharddb::metrics::StoreMetrics;
//! use sharddb::registry::ShardRegistry;
//! use sharddb::types::{ShardDescriptor, ShardId};
//!
//! let cluster = MemoryCluster::new();
//! cluster.add_shard(ShardDescriptor::new(ShardId(1), ("10.0.0.1", 27017), ("192.168.0.1", 27017)));
//!
//! let registry = ShardRegistry::new(
//!     cluster.catalog(),
//!     cluster.connector(),
//!     PoolSettings::default(),
//!     Arc::new(CacheControl::new()),
//!     Arc::new(StoreMetrics::new()),
//! );
//! registry.load_shards().unwrap();
//! assert!(registry.get(ShardId(1)).is_ok());
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::cache::CacheControl;
use crate::client::{Catalog, Connector, PoolSettings};
use crate::error::{Result, StoreError};
use crate::health::{ConnectionManager, EndpointIndex, EndpointState};
use crate::metrics::StoreMetrics;
use crate::types::{ShardDescriptor, ShardId};

/// Per-shard status for listings.
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub descriptor: ShardDescriptor,
    pub endpoint_states: [EndpointState; 2],
    pub pending_rechecks: usize,
}

/// Registry of shards and their connection managers.
pub struct ShardRegistry {
    /// Keyed by shard id; iteration order breaks current-shard ties.
    shards: RwLock<BTreeMap<ShardId, Arc<ConnectionManager>>>,
    /// Endpoint states at the end of the previous load.
    last_seen: Mutex<BTreeMap<ShardId, [EndpointState; 2]>>,
    catalog: Arc<dyn Catalog>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    cache: Arc<CacheControl>,
    metrics: Arc<StoreMetrics>,
}

impl ShardRegistry {
    /// Create an empty registry. Nothing is loaded until [`load_shards`](Self::load_shards).
    pub fn new(
        catalog: Arc<dyn Catalog>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        cache: Arc<CacheControl>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            shards: RwLock::new(BTreeMap::new()),
            last_seen: Mutex::new(BTreeMap::new()),
            catalog,
            connector,
            settings,
            cache,
            metrics,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn cache_control(&self) -> &Arc<CacheControl> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    /// Refresh known shards and register new ones from the catalog.
    ///
    /// Existing managers reconnect first. The catalog is then read; unknown
    /// shards get a new manager, known ones take the latest recency marker
    /// and document count.
    ///
    /// Result caching resumes when the load leaves every endpoint settled
    /// (see [`settle`](Self::settle)) and nothing suspended it meanwhile.
    ///
    /// Returns the number of newly registered shards.
    pub fn load_shards(&self) -> Result<usize> {
        let epoch = self.cache.epoch();
        for manager in self.managers() {
            manager.reconnect();
        }

        let descriptors = self.catalog.shards().map_err(StoreError::Catalog)?;

        let mut added = 0;
        for descriptor in descriptors {
            if let Some(existing) = self.lookup(descriptor.id) {
                existing.refresh_descriptor(&descriptor);
                continue;
            }

            // Connect outside the write lock; readers keep going meanwhile.
            let id = descriptor.id;
            let manager = Arc::new(ConnectionManager::connect(
                descriptor,
                Arc::clone(&self.connector),
                self.settings,
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
            ));

            let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
            if shards.contains_key(&id) {
                // Lost a race with a concurrent load; keep the first.
                continue;
            }
            info!(shard = %id, manager = %manager, "shard registered");
            shards.insert(id, manager);
            added += 1;
        }

        if self.settle() {
            self.cache.resume_since(epoch);
        } else {
            debug!("endpoints still recovering, result caching stays suspended");
        }

        Ok(added)
    }

    /// Record the current endpoint states and report whether they are
    /// settled: each endpoint is available, or disconnected already at the
    /// previous load (or never seen before). Suspect and connecting
    /// endpoints, and ones lost since the previous load, are not settled.
    ///
    /// A shard that stays unreachable over two loads thus stops holding
    /// caching off until it comes back.
    fn settle(&self) -> bool {
        let managers = self.managers();
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut settled = true;
        for manager in managers {
            let states = manager.endpoint_states();
            let before = last_seen.insert(manager.shard(), states);
            for index in EndpointIndex::ALL {
                let state = states[index.as_usize()];
                let ok = match state {
                    EndpointState::Available => true,
                    EndpointState::Disconnected => before
                        .map_or(true, |b| b[index.as_usize()] == EndpointState::Disconnected),
                    EndpointState::Connecting | EndpointState::Suspect => false,
                };
                if !ok {
                    debug!(shard = %manager.shard(), endpoint = %index, ?state, "endpoint not settled");
                    settled = false;
                }
            }
        }
        settled
    }

    fn lookup(&self, shard: ShardId) -> Option<Arc<ConnectionManager>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shard)
            .cloned()
    }

    /// Manager for `shard`.
    pub fn get(&self, shard: ShardId) -> Result<Arc<ConnectionManager>> {
        self.lookup(shard).ok_or(StoreError::UnknownShard(shard))
    }

    /// The shard with the latest recency marker.
    ///
    /// Shards without a marker count as older than any shard with one. Ties
    /// (including "no shard has a marker") go to the lowest shard id.
    pub fn current_shard(&self) -> Option<Arc<ConnectionManager>> {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<&Arc<ConnectionManager>> = None;
        for manager in shards.values() {
            match best {
                Some(b) if manager.last_touched() <= b.last_touched() => {}
                _ => best = Some(manager),
            }
        }
        best.cloned()
    }

    /// Every manager, in shard id order.
    pub fn managers(&self) -> Vec<Arc<ConnectionManager>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every endpoint of every registered shard is available.
    pub fn is_healthy(&self) -> bool {
        self.managers().iter().all(|m| m.is_healthy())
    }

    /// Status of every shard.
    pub fn list(&self) -> Vec<ShardInfo> {
        self.managers()
            .iter()
            .map(|m| ShardInfo {
                descriptor: m.descriptor(),
                endpoint_states: m.endpoint_states(),
                pending_rechecks: m.pending_rechecks().len(),
            })
            .collect()
    }
}
