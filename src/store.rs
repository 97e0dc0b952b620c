//! DocumentStore - the data-access facade
//!
//! Owns the shard registry, the router, the fan-out engine and the result
//! caches, and exposes the read/write operations request handlers use.
//! Construct one per process and share it by reference.
//!
//! Read paths degrade: a shard missing the fan-out deadline only shrinks
//! the result, and cached reads answer with their fallback while a shard
//! is unreachable. Write paths fail loudly: they always go to the shard's
//! master endpoint, with no failover.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::cache::{CacheControl, TtlCache};
use crate::client::{Catalog, Connector, SourceQuery};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::fanout::FanoutEngine;
use crate::health::ScopeOutcome;
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::registry::ShardRegistry;
use crate::routing::{buckets_from_pairs, Router};
use crate::sources;
use crate::types::{
    BlockFilter, Document, DocumentId, DocumentUpdate, FieldUpdate, ShardDescriptor, ShardId,
    Source, SourceId,
};

/// Fields a document update may never set.
const IDENTITY_FIELDS: [&str; 2] = ["_id", "s"];

pub struct DocumentStore {
    config: StoreConfig,
    catalog: Arc<dyn Catalog>,
    registry: Arc<ShardRegistry>,
    router: Router,
    engine: FanoutEngine,
    metrics: Arc<StoreMetrics>,

    recent: TtlCache<(), Vec<Document>>,
    shard_list: TtlCache<(), Vec<ShardDescriptor>>,
    source_by_id: TtlCache<SourceId, Option<Source>>,
    source_lists: TtlCache<SourceQuery, Vec<Source>>,
    groups: TtlCache<(), BTreeSet<String>>,
    image_servers: TtlCache<ShardId, Option<Map<String, Value>>>,
    stats: TtlCache<ShardId, Option<Map<String, Value>>>,
}

impl DocumentStore {
    /// Build the store and load the shard list.
    ///
    /// Shards whose endpoints are down at startup are still registered and
    /// retried on every [`refresh`](Self::refresh).
    pub fn open(
        config: StoreConfig,
        catalog: Arc<dyn Catalog>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let control = Arc::new(CacheControl::new());
        let metrics = Arc::new(StoreMetrics::new());
        let registry = Arc::new(ShardRegistry::new(
            Arc::clone(&catalog),
            connector,
            config.pool_settings(),
            Arc::clone(&control),
            Arc::clone(&metrics),
        ));
        let shards = registry.load_shards()?;
        info!(shards, "document store opened");

        let recent = TtlCache::new(
            "recent_documents",
            Some(config.recent_ttl()),
            Arc::clone(&control),
            Arc::clone(&metrics),
        );
        let shard_list = TtlCache::new("shards", None, Arc::clone(&control), Arc::clone(&metrics));
        let source_by_id = TtlCache::new("source", None, Arc::clone(&control), Arc::clone(&metrics));
        let source_lists = TtlCache::new("sources", None, Arc::clone(&control), Arc::clone(&metrics));
        let groups = TtlCache::new("source_groups", None, Arc::clone(&control), Arc::clone(&metrics));
        let image_servers = TtlCache::new("image_server", None, Arc::clone(&control), Arc::clone(&metrics));
        let stats = TtlCache::new("shard_stats", None, Arc::clone(&control), Arc::clone(&metrics));

        Ok(Self {
            router: Router::new(Arc::clone(&catalog)),
            engine: FanoutEngine::new(Arc::clone(&registry)),
            config,
            catalog,
            registry,
            metrics,
            recent,
            shard_list,
            source_by_id,
            source_lists,
            groups,
            image_servers,
            stats,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reconnect known shards and pick up new ones. Driven periodically by
    /// the embedding application.
    pub fn refresh(&self) -> Result<usize> {
        let added = self.registry.load_shards()?;
        self.shard_list.clear();
        self.image_servers.clear();
        self.stats.clear();
        Ok(added)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Look up one document, resolving its shard through the alias catalog.
    pub fn get_document(&self, id: &DocumentId, block: BlockFilter) -> Result<Option<Document>> {
        match self.router.resolve_one(id)? {
            Some(route) => self.get_document_on(&route.id, route.shard, block),
            None => Ok(None),
        }
    }

    /// Look up one document on a known shard.
    ///
    /// A silently failed call (endpoint just invalidated) reads as absent.
    pub fn get_document_on(
        &self,
        id: &DocumentId,
        shard: ShardId,
        block: BlockFilter,
    ) -> Result<Option<Document>> {
        let manager = self.registry.get(shard)?;
        let outcome = manager.with_connection(|conn| conn.find_one(id, block))?;
        Ok(outcome.into_option().flatten())
    }

    /// Documents for `ids` across every shard that answers in time.
    pub fn get_documents(&self, ids: &[DocumentId], block: BlockFilter) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let buckets = self.router.resolve_many(ids)?;
        self.engine.fetch(&buckets, block, self.config.fanout_timeout())
    }

    /// Like [`get_documents`](Self::get_documents) for ids whose shard is
    /// already known; skips the alias catalog.
    pub fn get_documents_on(
        &self,
        pairs: &[(DocumentId, ShardId)],
        block: BlockFilter,
    ) -> Result<Vec<Document>> {
        let buckets = buckets_from_pairs(pairs);
        self.engine.fetch(&buckets, block, self.config.fanout_timeout())
    }

    /// Newest actively served documents on the current shard.
    ///
    /// Memoized for `recent_ttl`; empty while the current shard is
    /// unreachable.
    pub fn recent_documents(&self) -> Result<Vec<Document>> {
        self.recent.get_or_fallback((), Vec::new(), || {
            let Some(manager) = self.registry.current_shard() else {
                return Ok(Vec::new());
            };
            let limit = self.config.recent_limit;
            let outcome =
                manager.with_connection(|conn| conn.find_recent(BlockFilter::Served, limit))?;
            Ok(outcome.into_option().unwrap_or_default())
        })
    }

    /// Translate an old sequential id into a document id.
    ///
    /// Anything but plain digits is `None`, as is an id nobody holds.
    pub fn legacy_document_id(&self, old: &str) -> Result<Option<DocumentId>> {
        if old.is_empty() || !old.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        let Ok(legacy) = old.parse::<i64>() else {
            return Ok(None);
        };
        let manager = self.registry.get(self.config.legacy_shard)?;
        let outcome = manager.with_connection(|conn| conn.find_by_legacy_id(legacy))?;
        Ok(outcome.into_option().flatten().map(|doc| doc.id))
    }

    /// Apply `data` (with `_id`, optionally `s`) as set fields and `remove`
    /// as unset fields. See [`apply_update`](Self::apply_update).
    pub fn update_document(&self, data: Map<String, Value>, remove: &[String]) -> Result<()> {
        let update = DocumentUpdate::from_fields(data, remove)?;
        self.apply_update(update)
    }

    /// Write a field update to the document's shard master.
    ///
    /// Without a shard hint the shard is found with an unfiltered lookup. A
    /// document nobody can locate is a caller bug and fails with
    /// `UnroutableDocument`. Any outcome other than a matched write fails
    /// with `WriteFailed`.
    pub fn apply_update(&self, mut update: DocumentUpdate) -> Result<()> {
        let id = update.id;
        let shard = match update.shard {
            Some(shard) => shard,
            None => match self.get_document(&id, BlockFilter::Any)? {
                Some(doc) => doc.shard,
                None => {
                    error!(id = %id, fields = ?update.fields, "update for a document that cannot be located");
                    return Err(StoreError::UnroutableDocument(id));
                }
            },
        };

        for field in IDENTITY_FIELDS {
            update.fields.set.remove(field);
        }

        let manager = self.registry.get(shard)?;
        let fields = &update.fields;
        let outcome = manager.with_master(|conn| conn.update(&id, fields))?;
        match outcome {
            ScopeOutcome::Success(true) => {
                debug!(id = %id, shard = %shard, "document updated");
                Ok(())
            }
            ScopeOutcome::Success(false) => Err(StoreError::WriteFailed {
                shard,
                reason: format!("document {} not found on shard", id),
            }),
            ScopeOutcome::SoftFailure | ScopeOutcome::HardFailure => Err(StoreError::WriteFailed {
                shard,
                reason: "master endpoint unreachable".to_string(),
            }),
        }
    }

    /// Total documents, from the shard catalog's counters.
    pub fn count_documents(&self) -> Result<u64> {
        Ok(self.shards()?.iter().map(|s| s.document_count).sum())
    }

    /// Shard descriptors, memoized until the next refresh.
    pub fn shards(&self) -> Result<Vec<ShardDescriptor>> {
        self.shard_list.get_or_try_insert_with((), || {
            self.catalog.shards().map_err(StoreError::Catalog)
        })
    }

    /// Image host record of `shard`, memoized until the next refresh.
    pub fn image_server(&self, shard: ShardId) -> Result<Option<Map<String, Value>>> {
        self.image_servers.get_or_try_insert_with(shard, || {
            self.catalog.image_server(shard).map_err(StoreError::Catalog)
        })
    }

    /// Search statistics of `shard`, memoized until the next refresh.
    pub fn shard_stats(&self, shard: ShardId) -> Result<Option<Map<String, Value>>> {
        self.stats.get_or_try_insert_with(shard, || {
            self.catalog.shard_stats(shard).map_err(StoreError::Catalog)
        })
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub fn get_source(&self, id: SourceId) -> Result<Option<Source>> {
        self.source_by_id.get_or_try_insert_with(id, || {
            self.catalog.source(id).map_err(StoreError::Catalog)
        })
    }

    pub fn get_sources(&self, query: &SourceQuery) -> Result<Vec<Source>> {
        self.source_lists.get_or_try_insert_with(query.clone(), || {
            self.catalog.sources(query).map_err(StoreError::Catalog)
        })
    }

    pub fn count_sources(&self, query: &SourceQuery) -> Result<usize> {
        self.catalog.count_sources(query).map_err(StoreError::Catalog)
    }

    /// Every group tag used by any source.
    pub fn source_groups(&self) -> Result<BTreeSet<String>> {
        self.groups.get_or_try_insert_with((), || {
            self.catalog.source_groups().map_err(StoreError::Catalog)
        })
    }

    /// Insert a source after coercing its fields. `_id` is mandatory.
    pub fn create_source(&self, data: Map<String, Value>) -> Result<SourceId> {
        let raw_id = data.get("_id").ok_or_else(|| StoreError::InvalidField {
            field: "_id".to_string(),
            reason: "missing".to_string(),
        })?;
        let id = sources::source_id(raw_id)?;
        let fields = sources::coerce_fields(data)?;

        self.catalog.insert_source(fields).map_err(StoreError::Catalog)?;
        self.clear_source_caches();
        info!(source = %id, "source created");
        Ok(id)
    }

    /// Set the fields of `data` and unset `remove` on the source named by
    /// `data["_id"]`. Returns whether a source matched.
    pub fn update_source(&self, mut data: Map<String, Value>, remove: &[String]) -> Result<bool> {
        let raw_id = data.remove("_id").ok_or_else(|| StoreError::InvalidField {
            field: "_id".to_string(),
            reason: "missing".to_string(),
        })?;
        let id = sources::source_id(&raw_id)?;

        let mut update = FieldUpdate::from_fields(data, remove);
        update.set = sources::coerce_fields(update.set)?;

        let matched = self
            .catalog
            .update_source(id, &update)
            .map_err(StoreError::Catalog)?;
        self.clear_source_caches();
        Ok(matched)
    }

    pub fn remove_source(&self, id: SourceId) -> Result<bool> {
        let removed = self.catalog.remove_source(id).map_err(StoreError::Catalog)?;
        self.clear_source_caches();
        Ok(removed)
    }

    fn clear_source_caches(&self) {
        self.source_by_id.clear();
        self.source_lists.clear();
        self.groups.clear();
    }
}
