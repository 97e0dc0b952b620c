//! In-memory cluster: an ephemeral backend for tests, benches and demos.
//!
//! [`MemoryCluster`] holds the documents of every shard and a
//! [`MemoryCatalog`] with shard descriptors, alias records and sources. Both
//! endpoints of a shard serve the same data. Each endpoint address carries
//! [`EndpointFaults`] for fault injection: taking it down, failing the next
//! calls with a chosen error kind, or slowing every call down.
//!
//! ```
//! use sharddb::memory::MemoryCluster;
//! use sharddb::types::{ShardDescriptor, ShardId};
//!
//! let cluster = MemoryCluster::new();
//! cluster.add_shard(ShardDescriptor::new(ShardId(1), ("10.0.0.1", 27017), ("192.168.0.1", 27017)));
//! assert_eq!(cluster.catalog().shard_count(), 1);
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::client::{Catalog, ClientResult, Connector, PoolSettings, ShardConnection, SourceQuery};
use crate::error::{ClientError, ClientErrorKind};
use crate::types::{
    BlockFilter, Document, DocumentId, FieldUpdate, IndirectionRecord, ShardDescriptor, ShardId,
    Source, SourceId,
};

// ── Fault Injection ────────────────────────────────────────────────

/// Failure knobs for one endpoint address (or for the catalog).
#[derive(Default)]
pub struct EndpointFaults {
    /// Refuse connects and fail every call with `ConnectionLost`.
    down: AtomicBool,
    /// Errors returned, in order, by the next calls.
    queued: Mutex<VecDeque<ClientErrorKind>>,
    /// Added to every call.
    latency: RwLock<Duration>,
    connects: AtomicUsize,
    calls: AtomicUsize,
}

impl EndpointFaults {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Fail the next call with `kind`.
    pub fn fail_next(&self, kind: ClientErrorKind) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(kind);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Connections opened to this address so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Calls served (or failed) so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, what: &str) -> ClientResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.is_down() {
            return Err(ClientError::connection_lost(format!("{}: endpoint down", what)));
        }
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match queued {
            Some(kind) => Err(ClientError::new(kind, format!("{}: injected failure", what))),
            None => Ok(()),
        }
    }
}

// ── Shard Data ─────────────────────────────────────────────────────

/// Documents of one shard in insertion (natural) order.
#[derive(Default)]
struct ShardData {
    documents: RwLock<Vec<Document>>,
}

impl ShardData {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Document>> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct ClusterState {
    shards: RwLock<HashMap<ShardId, Arc<ShardData>>>,
    /// address -> (shard, faults)
    endpoints: RwLock<HashMap<String, (ShardId, Arc<EndpointFaults>)>>,
}

/// An in-process set of shards plus their control catalog.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
    catalog: Arc<MemoryCatalog>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard: catalog entry, storage and both endpoint addresses.
    pub fn add_shard(&self, descriptor: ShardDescriptor) {
        self.state
            .shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(descriptor.id)
            .or_default();
        {
            let mut endpoints = self
                .state
                .endpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for address in descriptor.addresses() {
                endpoints
                    .entry(address)
                    .or_insert_with(|| (descriptor.id, Arc::new(EndpointFaults::default())));
            }
        }
        self.catalog.upsert_shard(descriptor);
    }

    /// Store a document on the shard named by `document.shard`.
    ///
    /// Also records a direct alias entry so routing finds it.
    pub fn insert_document(&self, document: Document) {
        self.catalog
            .add_indirection(IndirectionRecord::direct(document.id, document.shard));
        self.insert_document_unindexed(document);
    }

    /// Store a document without touching the alias catalog.
    pub fn insert_document_unindexed(&self, document: Document) {
        let data = Arc::clone(
            self.state
                .shards
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(document.shard)
                .or_default(),
        );
        let mut documents = data.documents.write().unwrap_or_else(PoisonError::into_inner);
        documents.retain(|d| d.id != document.id);
        documents.push(document);
    }

    pub fn document(&self, shard: ShardId, id: &DocumentId) -> Option<Document> {
        let shards = self.state.shards.read().unwrap_or_else(PoisonError::into_inner);
        let data = shards.get(&shard)?;
        let found = data.read().iter().find(|d| d.id == *id).cloned();
        found
    }

    pub fn faults(&self, address: &str) -> Option<Arc<EndpointFaults>> {
        self.state
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .map(|(_, faults)| Arc::clone(faults))
    }

    /// Faults of both endpoints of a shard, public first.
    pub fn shard_faults(&self, shard: ShardId) -> Vec<Arc<EndpointFaults>> {
        let Some(descriptor) = self.catalog.shard(shard) else {
            return Vec::new();
        };
        descriptor
            .addresses()
            .iter()
            .filter_map(|address| self.faults(address))
            .collect()
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.faults(address).map_or(0, |f| f.connects())
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn catalog(&self) -> Arc<MemoryCatalog> {
        Arc::clone(&self.catalog)
    }
}

// ── Connector / Connection ─────────────────────────────────────────

/// Opens [`MemoryConnection`]s to addresses registered in a cluster.
pub struct MemoryConnector {
    state: Arc<ClusterState>,
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        address: &str,
        _settings: &PoolSettings,
    ) -> ClientResult<Arc<dyn ShardConnection>> {
        let (shard, faults) = self
            .state
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .map(|(shard, faults)| (*shard, Arc::clone(faults)))
            .ok_or_else(|| ClientError::connection_lost(format!("unknown host {}", address)))?;
        if faults.is_down() {
            return Err(ClientError::connection_lost(format!("connection refused: {}", address)));
        }
        let data = self
            .state
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shard)
            .cloned()
            .ok_or_else(|| ClientError::connection_lost(format!("no shard behind {}", address)))?;
        faults.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            data,
            faults,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to one in-memory endpoint.
pub struct MemoryConnection {
    data: Arc<ShardData>,
    faults: Arc<EndpointFaults>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check(&self, what: &str) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::connection_lost(format!("{}: connection closed", what)));
        }
        self.faults.check(what)
    }
}

impl ShardConnection for MemoryConnection {
    fn ping(&self) -> ClientResult<()> {
        self.check("ping")
    }

    fn find_by_ids(&self, ids: &[DocumentId], block: BlockFilter) -> ClientResult<Vec<Document>> {
        self.check("find")?;
        let wanted: BTreeSet<&DocumentId> = ids.iter().collect();
        Ok(self
            .data
            .read()
            .iter()
            .filter(|d| wanted.contains(&d.id) && block.matches(d.block))
            .cloned()
            .collect())
    }

    fn find_one(&self, id: &DocumentId, block: BlockFilter) -> ClientResult<Option<Document>> {
        self.check("find_one")?;
        Ok(self
            .data
            .read()
            .iter()
            .find(|d| d.id == *id && block.matches(d.block))
            .cloned())
    }

    fn find_recent(&self, block: BlockFilter, limit: usize) -> ClientResult<Vec<Document>> {
        self.check("find_recent")?;
        Ok(self
            .data
            .read()
            .iter()
            .rev()
            .filter(|d| block.matches(d.block))
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_by_legacy_id(&self, legacy_id: i64) -> ClientResult<Option<Document>> {
        self.check("find_legacy")?;
        Ok(self
            .data
            .read()
            .iter()
            .find(|d| d.legacy_id == Some(legacy_id))
            .cloned())
    }

    fn count(&self) -> ClientResult<u64> {
        self.check("count")?;
        Ok(self.data.read().len() as u64)
    }

    fn update(&self, id: &DocumentId, update: &FieldUpdate) -> ClientResult<bool> {
        self.check("update")?;
        let mut documents = self
            .data
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match documents.iter_mut().find(|d| d.id == *id) {
            Some(doc) => {
                doc.apply(update)
                    .map_err(|e| ClientError::query(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Catalog ────────────────────────────────────────────────────────

/// In-memory control catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    shards: RwLock<Vec<ShardDescriptor>>,
    indirections: RwLock<HashMap<DocumentId, IndirectionRecord>>,
    /// Raw source documents keyed by id.
    sources: RwLock<HashMap<i64, Map<String, Value>>>,
    image_servers: RwLock<HashMap<ShardId, Map<String, Value>>>,
    stats: RwLock<HashMap<ShardId, Map<String, Value>>>,
    faults: EndpointFaults,
    indirection_queries: AtomicUsize,
    shard_queries: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a shard descriptor.
    pub fn upsert_shard(&self, descriptor: ShardDescriptor) {
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        shards.retain(|s| s.id != descriptor.id);
        shards.push(descriptor);
    }

    /// Drop a shard descriptor from the catalog (storage is untouched).
    pub fn remove_shard(&self, id: ShardId) {
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id != id);
    }

    pub fn shard(&self, id: ShardId) -> Option<ShardDescriptor> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn add_indirection(&self, record: IndirectionRecord) {
        self.indirections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);
    }

    pub fn set_image_server(&self, shard: ShardId, record: Map<String, Value>) {
        self.image_servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard, record);
    }

    pub fn set_shard_stats(&self, shard: ShardId, record: Map<String, Value>) {
        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard, record);
    }

    pub fn faults(&self) -> &EndpointFaults {
        &self.faults
    }

    /// Alias lookups served so far (single and batched).
    pub fn indirection_queries(&self) -> usize {
        self.indirection_queries.load(Ordering::SeqCst)
    }

    pub fn shard_queries(&self) -> usize {
        self.shard_queries.load(Ordering::SeqCst)
    }

    pub fn raw_source(&self, id: SourceId) -> Option<Map<String, Value>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.0)
            .cloned()
    }

    fn filtered_sources(&self, query: &SourceQuery) -> ClientResult<Vec<Source>> {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched = Vec::new();
        for raw in sources.values() {
            let source = decode_source(raw)?;
            if query.matches(&source) {
                matched.push(source);
            }
        }
        matched.sort_by(|a, b| a.domain.cmp(&b.domain).then(a.id.cmp(&b.id)));
        let skip = query.skip.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(skip).take(limit).collect())
    }
}

fn decode_source(raw: &Map<String, Value>) -> ClientResult<Source> {
    serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|e| ClientError::query(format!("malformed source: {}", e)))
}

fn source_key(fields: &Map<String, Value>) -> ClientResult<i64> {
    fields
        .get("_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| ClientError::query("source without integer _id"))
}

impl Catalog for MemoryCatalog {
    fn shards(&self) -> ClientResult<Vec<ShardDescriptor>> {
        self.shard_queries.fetch_add(1, Ordering::SeqCst);
        self.faults.check("shards")?;
        let mut shards = self.shards.read().unwrap_or_else(PoisonError::into_inner).clone();
        // Most recently touched first; never-touched shards last.
        shards.sort_by(|a, b| b.last_touched.cmp(&a.last_touched));
        Ok(shards)
    }

    fn indirection(&self, id: &DocumentId) -> ClientResult<Option<IndirectionRecord>> {
        self.indirection_queries.fetch_add(1, Ordering::SeqCst);
        self.faults.check("indirection")?;
        Ok(self
            .indirections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn indirections(&self, ids: &[DocumentId]) -> ClientResult<Vec<IndirectionRecord>> {
        self.indirection_queries.fetch_add(1, Ordering::SeqCst);
        self.faults.check("indirections")?;
        let records = self.indirections.read().unwrap_or_else(PoisonError::into_inner);
        let unique: BTreeSet<&DocumentId> = ids.iter().collect();
        Ok(unique.into_iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    fn source(&self, id: SourceId) -> ClientResult<Option<Source>> {
        self.faults.check("source")?;
        self.raw_source(id).as_ref().map(decode_source).transpose()
    }

    fn sources(&self, query: &SourceQuery) -> ClientResult<Vec<Source>> {
        self.faults.check("sources")?;
        self.filtered_sources(query)
    }

    fn count_sources(&self, query: &SourceQuery) -> ClientResult<usize> {
        self.faults.check("count_sources")?;
        Ok(self.filtered_sources(query)?.len())
    }

    fn insert_source(&self, fields: Map<String, Value>) -> ClientResult<()> {
        self.faults.check("insert_source")?;
        let key = source_key(&fields)?;
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if sources.contains_key(&key) {
            return Err(ClientError::query(format!("duplicate source id {}", key)));
        }
        sources.insert(key, fields);
        Ok(())
    }

    fn update_source(&self, id: SourceId, update: &FieldUpdate) -> ClientResult<bool> {
        self.faults.check("update_source")?;
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let Some(raw) = sources.get_mut(&id.0) else {
            return Ok(false);
        };
        for (key, value) in &update.set {
            if key != "_id" {
                raw.insert(key.clone(), value.clone());
            }
        }
        for key in &update.unset {
            raw.remove(key);
        }
        Ok(true)
    }

    fn remove_source(&self, id: SourceId) -> ClientResult<bool> {
        self.faults.check("remove_source")?;
        Ok(self
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0)
            .is_some())
    }

    fn source_groups(&self) -> ClientResult<BTreeSet<String>> {
        self.faults.check("source_groups")?;
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let mut groups = BTreeSet::new();
        for raw in sources.values() {
            groups.extend(decode_source(raw)?.groups);
        }
        Ok(groups)
    }

    fn image_server(&self, shard: ShardId) -> ClientResult<Option<Map<String, Value>>> {
        self.faults.check("image_server")?;
        Ok(self
            .image_servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shard)
            .cloned())
    }

    fn shard_stats(&self, shard: ShardId) -> ClientResult<Option<Map<String, Value>>> {
        self.faults.check("shard_stats")?;
        Ok(self
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shard)
            .cloned())
    }
}
