//! Seams to the underlying database client.
//!
//! The store never speaks a wire protocol itself. Shard collections are
//! reached through [`ShardConnection`] handles produced by a [`Connector`],
//! and the control database through a [`Catalog`]. Any client that maps its
//! failures onto [`ClientErrorKind`](crate::error::ClientErrorKind) can be
//! plugged in; [`crate::memory`] provides an in-process one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::types::{
    BlockFilter, Document, DocumentId, FieldUpdate, IndirectionRecord, ShardDescriptor, ShardId,
    Source, SourceId,
};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Connection parameters handed to the client for every endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum connections the client keeps open per endpoint.
    pub pool_size: usize,
    /// Socket-level timeout for a single round trip.
    pub network_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 20,
            network_timeout: Duration::from_secs(3),
        }
    }
}

/// Opens connections to shard endpoints.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        address: &str,
        settings: &PoolSettings,
    ) -> ClientResult<Arc<dyn ShardConnection>>;
}

/// Handle to one shard replica.
///
/// Send + Sync required: one handle per endpoint is shared by every unit of
/// work, so the client must pool internally (sized by `pool_size`).
pub trait ShardConnection: Send + Sync {
    /// Cheap liveness probe.
    fn ping(&self) -> ClientResult<()>;

    /// Documents whose id is in `ids`, in the collection's natural order.
    fn find_by_ids(&self, ids: &[DocumentId], block: BlockFilter) -> ClientResult<Vec<Document>>;

    fn find_one(&self, id: &DocumentId, block: BlockFilter) -> ClientResult<Option<Document>>;

    /// Newest documents first.
    fn find_recent(&self, block: BlockFilter, limit: usize) -> ClientResult<Vec<Document>>;

    fn find_by_legacy_id(&self, legacy_id: i64) -> ClientResult<Option<Document>>;

    fn count(&self) -> ClientResult<u64>;

    /// Apply set/unset semantics to one document. Returns whether it matched.
    fn update(&self, id: &DocumentId, update: &FieldUpdate) -> ClientResult<bool>;

    /// Release client resources. The handle must not be used afterwards.
    fn close(&self) {}
}

/// Group restriction on a source listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum GroupFilter {
    #[default]
    Any,
    /// Sources tagged with this group.
    One(String),
    /// Sources tagged with at least one of these groups.
    AnyOf(Vec<String>),
    /// Sources tagged with every one of these groups.
    AllOf(Vec<String>),
}

impl GroupFilter {
    pub fn matches(&self, source: &Source) -> bool {
        match self {
            GroupFilter::Any => true,
            GroupFilter::One(group) => source.has_group(group),
            GroupFilter::AnyOf(groups) => groups.iter().any(|g| source.has_group(g)),
            GroupFilter::AllOf(groups) => groups.iter().all(|g| source.has_group(g)),
        }
    }
}

/// Filter, sort and paging options for source listings.
///
/// Results are sorted by domain. `blocked: Some(false)` (the default)
/// matches sources with a missing or zero block flag, `None` matches all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceQuery {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub blocked: Option<bool>,
    pub group: GroupFilter,
}

impl Default for SourceQuery {
    fn default() -> Self {
        Self {
            skip: None,
            limit: None,
            blocked: Some(false),
            group: GroupFilter::Any,
        }
    }
}

impl SourceQuery {
    pub fn matches(&self, source: &Source) -> bool {
        let blocked_ok = match self.blocked {
            None => true,
            Some(flag) => source.is_blocked() == flag,
        };
        blocked_ok && self.group.matches(source)
    }
}

/// The control database: shard list, alias records and reference data.
pub trait Catalog: Send + Sync {
    /// Every shard descriptor, most recently touched first.
    fn shards(&self) -> ClientResult<Vec<ShardDescriptor>>;

    fn indirection(&self, id: &DocumentId) -> ClientResult<Option<IndirectionRecord>>;

    /// Records for every id in `ids` that has one. Order is unspecified.
    fn indirections(&self, ids: &[DocumentId]) -> ClientResult<Vec<IndirectionRecord>>;

    fn source(&self, id: SourceId) -> ClientResult<Option<Source>>;

    fn sources(&self, query: &SourceQuery) -> ClientResult<Vec<Source>>;

    /// Count honouring `skip`/`limit`.
    fn count_sources(&self, query: &SourceQuery) -> ClientResult<usize>;

    fn insert_source(&self, fields: Map<String, Value>) -> ClientResult<()>;

    fn update_source(&self, id: SourceId, update: &FieldUpdate) -> ClientResult<bool>;

    fn remove_source(&self, id: SourceId) -> ClientResult<bool>;

    fn source_groups(&self) -> ClientResult<BTreeSet<String>>;

    /// Record of the host serving `shard`'s preview images.
    fn image_server(&self, shard: ShardId) -> ClientResult<Option<Map<String, Value>>>;

    /// Search statistics kept for `shard`.
    fn shard_stats(&self, shard: ShardId) -> ClientResult<Option<Map<String, Value>>>;
}
