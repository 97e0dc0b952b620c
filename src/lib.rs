//! sharddb - data access for a document corpus split across shards
//!
//! Documents live on independent shards, each reachable through a public
//! replica and an internal master. A control catalog lists the shards, maps
//! document ids to shards (with optional one-hop redirects) and holds
//! reference data about content sources.
//!
//! - [`health`]: per-shard endpoint liveness, recovery and scoped access
//! - [`registry`]: one health manager per catalogued shard
//! - [`routing`]: id to shard resolution through the alias catalog
//! - [`fanout`]: parallel multi-shard reads under a deadline
//! - [`cache`]: memoization with fallback while shards are unreachable
//! - [`store`]: the facade tying it together
//!
//! The database client is abstracted behind [`client`]; [`memory`] is an
//! in-process implementation.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod routing;
pub mod sources;
pub mod store;
pub mod types;

pub use client::{Catalog, Connector, GroupFilter, PoolSettings, ShardConnection, SourceQuery};
pub use config::StoreConfig;
pub use error::{ClientError, ClientErrorKind, Result, StoreError};
pub use health::{ConnectionManager, EndpointIndex, EndpointState, ScopeOutcome};
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use registry::ShardRegistry;
pub use routing::{Route, Router, ShardBuckets};
pub use store::DocumentStore;
pub use types::{
    BlockFilter, Document, DocumentId, DocumentUpdate, FieldUpdate, IndirectionRecord,
    ShardDescriptor, ShardId, Source, SourceId,
};
