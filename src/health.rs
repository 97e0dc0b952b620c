//! ConnectionManager - per-shard endpoint health and recovery
//!
//! Every shard is reachable through two endpoints: the public replica
//! (tried first) and the internal master (last, and the only target for
//! writes). The manager keeps one client handle per endpoint alive despite
//! flaky networks, so callers never deal with reconnection themselves.
//!
//! # Endpoint lifecycle
//!
//! ```text
//! Disconnected --reconnect()--> Connecting --ok--> Available
//!      ^                             |
//!      +------------fail-------------+
//!
//! Available --soft invalidate--> Suspect --recheck ok--> Available (same handle)
//!                                   |
//!                                   +--recheck hard-fails--> Disconnected
//!
//! Available --hard invalidate--> Disconnected (handle closed and dropped)
//! ```
//!
//! There is no terminal state: endpoints are retried on every `reconnect()`.
//!
//! # Scoped access
//!
//! [`ConnectionManager::acquire`] hands out an [`EndpointLease`] on the
//! first available endpoint; [`ConnectionManager::acquire_master`] always
//! leases the master. [`EndpointLease::run`] consumes the lease, executes
//! the operation and classifies network failures into a [`ScopeOutcome`],
//! invalidating the endpoint on the way. Query errors still propagate.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::cache::CacheControl;
use crate::client::{ClientResult, Connector, PoolSettings, ShardConnection};
use crate::error::{ClientErrorKind, Result, StoreError};
use crate::metrics::StoreMetrics;
use crate::types::{ShardDescriptor, ShardId};

/// Position of an endpoint within its shard: public first, master last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointIndex {
    Public = 0,
    /// The internal endpoint; writes always go here.
    Master = 1,
}

impl EndpointIndex {
    /// Every endpoint in preference order.
    pub const ALL: [EndpointIndex; 2] = [EndpointIndex::Public, EndpointIndex::Master];

    pub fn as_usize(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EndpointIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndpointIndex::Public => "public",
            EndpointIndex::Master => "master",
        })
    }
}

// ── Endpoint ───────────────────────────────────────────────────────

/// Liveness state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Disconnected = 0,
    Connecting = 1,
    Available = 2,
    /// Soft failure observed; handle kept, waiting for a liveness recheck.
    Suspect = 3,
}

impl EndpointState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Available,
            3 => Self::Suspect,
            _ => Self::Disconnected,
        }
    }
}

/// One network address of a shard replica.
pub struct Endpoint {
    address: String,
    /// Read on every query, written on failures only; lock-free.
    state: AtomicU8,
    connection: RwLock<Option<Arc<dyn ShardConnection>>>,
    /// Leases currently held on this endpoint.
    leases: AtomicUsize,
}

impl Endpoint {
    fn new(address: String) -> Self {
        Self {
            address,
            state: AtomicU8::new(EndpointState::Disconnected as u8),
            connection: RwLock::new(None),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_available(&self) -> bool {
        self.state() == EndpointState::Available
    }

    /// Current client handle, if one exists.
    pub fn connection(&self) -> Option<Arc<dyn ShardConnection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of leases currently held.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: EndpointState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn install(&self, connection: Arc<dyn ShardConnection>) {
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = Some(connection);
    }

    /// Drop the handle, closing it. Leases already holding a clone keep it.
    fn tear_down(&self) {
        let old = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = old {
            conn.close();
        }
    }
}

// ── Scope Outcome ──────────────────────────────────────────────────

/// Result of an operation run through an [`EndpointLease`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeOutcome<T> {
    Success(T),
    /// Transient network failure; endpoint queued for recheck.
    SoftFailure,
    /// Connection unusable; endpoint torn down.
    HardFailure,
}

impl<T> ScopeOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ScopeOutcome::Success(_))
    }

    /// The value, or None when the call silently failed.
    pub fn into_option(self) -> Option<T> {
        match self {
            ScopeOutcome::Success(v) => Some(v),
            _ => None,
        }
    }
}

// ── Lease ──────────────────────────────────────────────────────────

/// Scoped access to one endpoint's connection.
///
/// Consumed by [`run`](Self::run); dropping it releases the endpoint.
pub struct EndpointLease<'a> {
    manager: &'a ConnectionManager,
    index: EndpointIndex,
    connection: Option<Arc<dyn ShardConnection>>,
}

impl<'a> EndpointLease<'a> {
    fn new(manager: &'a ConnectionManager, index: EndpointIndex) -> Self {
        let endpoint = manager.endpoint(index);
        endpoint.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            manager,
            index,
            connection: endpoint.connection(),
        }
    }

    pub fn endpoint_index(&self) -> EndpointIndex {
        self.index
    }

    pub fn address(&self) -> &str {
        self.manager.endpoint(self.index).address()
    }

    /// Run `op` on the leased connection and classify its failure.
    ///
    /// Network failures invalidate the endpoint and come back as
    /// `SoftFailure`/`HardFailure`. Query errors are returned as
    /// [`StoreError::Query`].
    pub fn run<T, F>(self, op: F) -> Result<ScopeOutcome<T>>
    where
        F: FnOnce(&dyn ShardConnection) -> ClientResult<T>,
    {
        let shard = self.manager.shard;
        let Some(conn) = self.connection.as_deref() else {
            warn!(shard = %shard, endpoint = self.address(), "endpoint has no connection");
            return Ok(ScopeOutcome::HardFailure);
        };

        match op(conn) {
            Ok(value) => Ok(ScopeOutcome::Success(value)),
            Err(e) => match e.kind {
                ClientErrorKind::Transient => {
                    warn!(shard = %shard, endpoint = self.address(), error = %e,
                        "transient failure, endpoint queued for recheck");
                    self.manager.invalidate(self.index, false);
                    Ok(ScopeOutcome::SoftFailure)
                }
                ClientErrorKind::ConnectionLost => {
                    error!(shard = %shard, endpoint = self.address(), error = %e,
                        "connection failure, endpoint torn down");
                    self.manager.invalidate(self.index, true);
                    Ok(ScopeOutcome::HardFailure)
                }
                ClientErrorKind::Query => Err(StoreError::Query { shard, source: e }),
            },
        }
    }
}

impl Drop for EndpointLease<'_> {
    fn drop(&mut self) {
        self.manager
            .endpoint(self.index)
            .leases
            .fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Connection Manager ─────────────────────────────────────────────

/// Health manager for the two endpoints of one shard.
pub struct ConnectionManager {
    shard: ShardId,
    /// Addresses never change after construction; recency and counts may.
    descriptor: RwLock<ShardDescriptor>,
    /// Public first, master last.
    endpoints: [Endpoint; 2],
    /// Endpoints awaiting a liveness recheck. Mutated from any caller's
    /// failure path.
    pending_recheck: Mutex<BTreeSet<EndpointIndex>>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    cache: Arc<CacheControl>,
    metrics: Arc<StoreMetrics>,
}

impl ConnectionManager {
    /// Create a manager with every endpoint disconnected.
    pub fn new(
        descriptor: ShardDescriptor,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        cache: Arc<CacheControl>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let [public, internal] = descriptor.addresses();
        Self {
            shard: descriptor.id,
            descriptor: RwLock::new(descriptor),
            endpoints: [Endpoint::new(public), Endpoint::new(internal)],
            pending_recheck: Mutex::new(BTreeSet::new()),
            connector,
            settings,
            cache,
            metrics,
        }
    }

    /// Create a manager and make a first connection attempt.
    pub fn connect(
        descriptor: ShardDescriptor,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
        cache: Arc<CacheControl>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let manager = Self::new(descriptor, connector, settings, cache, metrics);
        manager.reconnect();
        manager
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn descriptor(&self) -> ShardDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_touched(&self) -> Option<DateTime<Utc>> {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_touched
    }

    /// Take the mutable parts (recency marker, document count) of a newer
    /// catalog read. Addresses are kept as first loaded.
    pub fn refresh_descriptor(&self, latest: &ShardDescriptor) {
        let mut current = self.descriptor.write().unwrap_or_else(PoisonError::into_inner);
        current.last_touched = latest.last_touched;
        current.document_count = latest.document_count;
    }

    pub fn endpoint(&self, index: EndpointIndex) -> &Endpoint {
        &self.endpoints[index.as_usize()]
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn endpoint_states(&self) -> [EndpointState; 2] {
        [self.endpoints[0].state(), self.endpoints[1].state()]
    }

    /// True when every endpoint is available.
    pub fn is_healthy(&self) -> bool {
        self.endpoints.iter().all(Endpoint::is_available)
    }

    pub fn pending_rechecks(&self) -> Vec<EndpointIndex> {
        self.pending_recheck
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Bring endpoints back.
    ///
    /// Phase 1 opens a fresh connection for every disconnected endpoint.
    /// Phase 2 probes every endpoint queued for recheck: success restores
    /// it with the same handle, a hard failure tears it down for phase 1 of
    /// the next call, a transient failure leaves it queued.
    pub fn reconnect(&self) {
        for endpoint in &self.endpoints {
            if !endpoint.transition(EndpointState::Disconnected, EndpointState::Connecting) {
                continue;
            }
            match self.connector.connect(&endpoint.address, &self.settings) {
                Ok(conn) => {
                    endpoint.install(conn);
                    endpoint.set_state(EndpointState::Available);
                    self.metrics.record_connect(true);
                    info!(shard = %self.shard, endpoint = %endpoint.address,
                        "connection established");
                }
                Err(e) => {
                    endpoint.set_state(EndpointState::Disconnected);
                    self.metrics.record_connect(false);
                    warn!(shard = %self.shard, endpoint = %endpoint.address, error = %e,
                        "unable to connect");
                }
            }
        }

        for index in self.pending_rechecks() {
            let endpoint = self.endpoint(index);
            let probe = endpoint.connection().map(|conn| conn.ping());

            // State change and queue removal happen under the queue lock so a
            // concurrent invalidate() can't leave a Suspect endpoint unqueued.
            let mut pending = self
                .pending_recheck
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match probe {
                // Torn down meanwhile; phase 1 of the next call rebuilds it.
                None => {
                    pending.remove(&index);
                }
                Some(Ok(())) => {
                    endpoint.transition(EndpointState::Suspect, EndpointState::Available);
                    pending.remove(&index);
                    self.metrics.record_recheck(true);
                    info!(shard = %self.shard, endpoint = %endpoint.address, "connection check ok");
                }
                Some(Err(e)) if e.kind == ClientErrorKind::ConnectionLost => {
                    // Handle out before the state flip, so a concurrent
                    // reconnect() never installs one that gets torn down here.
                    endpoint.tear_down();
                    endpoint.set_state(EndpointState::Disconnected);
                    pending.remove(&index);
                    self.metrics.record_recheck(false);
                    warn!(shard = %self.shard, endpoint = %endpoint.address, error = %e,
                        "connection check failed, connection dropped");
                }
                Some(Err(e)) => {
                    self.metrics.record_recheck(false);
                    warn!(shard = %self.shard, endpoint = %endpoint.address, error = %e,
                        "connection check still failing");
                }
            }
        }
    }

    /// Record a failure observed on the `index` endpoint.
    ///
    /// Soft: the endpoint leaves the available set and is queued for a
    /// recheck, keeping its handle. Hard: the handle is closed and dropped
    /// so the next `reconnect()` builds a new one. Either way result caching
    /// is suspended.
    pub fn invalidate(&self, index: EndpointIndex, hard: bool) {
        self.cache.suspend();
        self.metrics.record_invalidation(hard);

        let endpoint = self.endpoint(index);
        let mut pending = self
            .pending_recheck
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if hard {
            // A Connecting or Disconnected endpoint already lost the failing
            // handle; the one being installed must survive.
            if matches!(endpoint.state(), EndpointState::Available | EndpointState::Suspect) {
                endpoint.tear_down();
                endpoint.set_state(EndpointState::Disconnected);
            }
            pending.remove(&index);
        } else {
            endpoint.transition(EndpointState::Available, EndpointState::Suspect);
            pending.insert(index);
        }
        debug!(shard = %self.shard, endpoint = %endpoint.address, hard, "endpoint invalidated");
    }

    /// Lease the first available endpoint, public before master.
    pub fn acquire(&self) -> Result<EndpointLease<'_>> {
        for index in EndpointIndex::ALL {
            if self.endpoint(index).is_available() {
                return Ok(EndpointLease::new(self, index));
            }
        }
        self.cache.suspend();
        Err(StoreError::NoEndpointAvailable { shard: self.shard })
    }

    /// Lease the master endpoint regardless of its liveness.
    pub fn acquire_master(&self) -> EndpointLease<'_> {
        EndpointLease::new(self, EndpointIndex::Master)
    }

    /// `acquire()` then `run(op)`.
    pub fn with_connection<T, F>(&self, op: F) -> Result<ScopeOutcome<T>>
    where
        F: FnOnce(&dyn ShardConnection) -> ClientResult<T>,
    {
        self.acquire()?.run(op)
    }

    /// `acquire_master()` then `run(op)`.
    pub fn with_master<T, F>(&self, op: F) -> Result<ScopeOutcome<T>>
    where
        F: FnOnce(&dyn ShardConnection) -> ClientResult<T>,
    {
        self.acquire_master().run(op)
    }
}

impl fmt::Display for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<shard {} {} {}>",
            self.shard, self.endpoints[0].address, self.endpoints[1].address
        )
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for endpoint in &self.endpoints {
            endpoint.tear_down();
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("shard", &self.shard)
            .field("states", &self.endpoint_states())
            .field("pending_recheck", &self.pending_rechecks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::memory::MemoryCluster;
    use crate::types::{BlockFilter, Document, DocumentId};
    use std::thread;

    fn descriptor(id: u32) -> ShardDescriptor {
        ShardDescriptor::new(ShardId(id), ("public", 1000 + id as u16), ("internal", 2000 + id as u16))
    }

    struct Fixture {
        cluster: MemoryCluster,
        cache: Arc<CacheControl>,
        metrics: Arc<StoreMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let cluster = MemoryCluster::new();
            cluster.add_shard(descriptor(1));
            Self {
                cluster,
                cache: Arc::new(CacheControl::new()),
                metrics: Arc::new(StoreMetrics::new()),
            }
        }

        fn manager(&self) -> ConnectionManager {
            ConnectionManager::connect(
                descriptor(1),
                self.cluster.connector(),
                PoolSettings::default(),
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
            )
        }

        fn public(&self) -> String {
            descriptor(1).public_address()
        }

        fn master(&self) -> String {
            descriptor(1).internal_address()
        }
    }

    fn same_connection(a: &Arc<dyn ShardConnection>, b: &Arc<dyn ShardConnection>) -> bool {
        std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
    }

    // ============================================================================
    // Reconnect
    // ============================================================================

    #[test]
    fn test_new_manager_starts_disconnected() {
        let fx = Fixture::new();
        let manager = ConnectionManager::new(
            descriptor(1),
            fx.cluster.connector(),
            PoolSettings::default(),
            Arc::clone(&fx.cache),
            Arc::clone(&fx.metrics),
        );
        assert_eq!(manager.endpoint_states(), [EndpointState::Disconnected; 2]);
        assert!(manager.endpoint(EndpointIndex::Public).connection().is_none());
        assert_eq!(fx.cluster.connect_count(&fx.public()), 0);
    }

    #[test]
    fn test_connect_makes_endpoints_available() {
        let fx = Fixture::new();
        let manager = fx.manager();
        assert_eq!(manager.endpoint_states(), [EndpointState::Available; 2]);
        assert!(manager.is_healthy());
        assert_eq!(fx.metrics.snapshot().connections_established, 2);
    }

    #[test]
    fn test_reconnect_twice_creates_no_duplicate_connections() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let before = manager.endpoint(EndpointIndex::Public).connection().unwrap();

        manager.reconnect();
        manager.reconnect();

        assert_eq!(fx.cluster.connect_count(&fx.public()), 1);
        assert_eq!(fx.cluster.connect_count(&fx.master()), 1);
        assert_eq!(manager.endpoint_states(), [EndpointState::Available; 2]);
        let after = manager.endpoint(EndpointIndex::Public).connection().unwrap();
        assert!(same_connection(&before, &after));
    }

    #[test]
    fn test_refused_endpoint_retried_on_next_reconnect() {
        let fx = Fixture::new();
        fx.cluster.faults(&fx.public()).unwrap().set_down(true);

        let manager = fx.manager();
        assert_eq!(
            manager.endpoint_states(),
            [EndpointState::Disconnected, EndpointState::Available]
        );
        assert_eq!(fx.metrics.snapshot().connect_failures, 1);

        fx.cluster.faults(&fx.public()).unwrap().set_down(false);
        manager.reconnect();
        assert!(manager.is_healthy());
    }

    // ============================================================================
    // Invalidation
    // ============================================================================

    #[test]
    fn test_soft_invalidate_then_recheck_keeps_connection() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let before = manager.endpoint(EndpointIndex::Public).connection().unwrap();

        manager.invalidate(EndpointIndex::Public, false);
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Suspect);
        assert_eq!(manager.pending_rechecks(), vec![EndpointIndex::Public]);
        assert!(!fx.cache.is_enabled());

        manager.reconnect();
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Available);
        assert!(manager.pending_rechecks().is_empty());
        let after = manager.endpoint(EndpointIndex::Public).connection().unwrap();
        assert!(same_connection(&before, &after));
        assert_eq!(fx.cluster.connect_count(&fx.public()), 1);
    }

    #[test]
    fn test_soft_invalidate_with_transient_recheck_stays_queued() {
        let fx = Fixture::new();
        let manager = fx.manager();

        manager.invalidate(EndpointIndex::Public, false);
        fx.cluster
            .faults(&fx.public())
            .unwrap()
            .fail_next(ClientErrorKind::Transient);
        manager.reconnect();

        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Suspect);
        assert_eq!(manager.pending_rechecks(), vec![EndpointIndex::Public]);

        manager.reconnect();
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Available);
    }

    #[test]
    fn test_soft_invalidate_with_hard_recheck_rebuilds() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let before = manager.endpoint(EndpointIndex::Public).connection().unwrap();

        manager.invalidate(EndpointIndex::Public, false);
        fx.cluster
            .faults(&fx.public())
            .unwrap()
            .fail_next(ClientErrorKind::ConnectionLost);
        manager.reconnect();
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Disconnected);
        assert!(manager.endpoint(EndpointIndex::Public).connection().is_none());
        assert!(manager.pending_rechecks().is_empty());

        manager.reconnect();
        let after = manager.endpoint(EndpointIndex::Public).connection().unwrap();
        assert!(!same_connection(&before, &after));
        assert_eq!(fx.cluster.connect_count(&fx.public()), 2);
    }

    #[test]
    fn test_hard_invalidate_forces_new_connection() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let before = manager.endpoint(EndpointIndex::Public).connection().unwrap();

        manager.invalidate(EndpointIndex::Public, true);
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Disconnected);
        assert!(manager.endpoint(EndpointIndex::Public).connection().is_none());
        assert!(manager.pending_rechecks().is_empty());

        manager.reconnect();
        let after = manager.endpoint(EndpointIndex::Public).connection().unwrap();
        assert!(!same_connection(&before, &after));
        assert_eq!(fx.cluster.connect_count(&fx.public()), 2);
        assert_eq!(fx.metrics.snapshot().hard_invalidations, 1);
    }

    // ============================================================================
    // Scoped Access
    // ============================================================================

    #[test]
    fn test_acquire_prefers_public_endpoint() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let lease = manager.acquire().unwrap();
        assert_eq!(lease.endpoint_index(), EndpointIndex::Public);
    }

    #[test]
    fn test_acquire_falls_back_to_master() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.invalidate(EndpointIndex::Public, false);

        let lease = manager.acquire().unwrap();
        assert_eq!(lease.endpoint_index(), EndpointIndex::Master);
    }

    #[test]
    fn test_acquire_without_available_endpoint() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.invalidate(EndpointIndex::Public, true);
        manager.invalidate(EndpointIndex::Master, false);

        let result = manager.acquire().map(|lease| lease.address().to_string());
        match result {
            Err(StoreError::NoEndpointAvailable { shard }) => assert_eq!(shard, ShardId(1)),
            other => panic!("expected NoEndpointAvailable, got {:?}", other),
        }
        assert!(!fx.cache.is_enabled());
    }

    #[test]
    fn test_acquire_master_ignores_liveness() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.invalidate(EndpointIndex::Master, false);

        let lease = manager.acquire_master();
        assert_eq!(lease.endpoint_index(), EndpointIndex::Master);
        let outcome = lease.run(|conn| conn.count()).unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn test_lease_released_after_run() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let lease = manager.acquire().unwrap();
        assert_eq!(manager.endpoint(EndpointIndex::Public).active_leases(), 1);
        let _ = lease.run(|conn| conn.ping()).unwrap();
        assert_eq!(manager.endpoint(EndpointIndex::Public).active_leases(), 0);
    }

    #[test]
    fn test_run_classifies_transient_as_soft() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let outcome: ScopeOutcome<()> = manager
            .with_connection(|_| Err(ClientError::transient("autoreconnect")))
            .unwrap();
        assert_eq!(outcome, ScopeOutcome::SoftFailure);
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Suspect);
        assert!(manager.endpoint(EndpointIndex::Public).connection().is_some());
        assert_eq!(manager.pending_rechecks(), vec![EndpointIndex::Public]);
    }

    #[test]
    fn test_run_classifies_connection_lost_as_hard() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let outcome: ScopeOutcome<()> = manager
            .with_connection(|_| Err(ClientError::connection_lost("reset by peer")))
            .unwrap();
        assert_eq!(outcome, ScopeOutcome::HardFailure);
        assert_eq!(manager.endpoint(EndpointIndex::Public).state(), EndpointState::Disconnected);
        assert!(manager.endpoint(EndpointIndex::Public).connection().is_none());
    }

    #[test]
    fn test_run_propagates_query_errors() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let result: Result<ScopeOutcome<()>> =
            manager.with_connection(|_| Err(ClientError::query("bad filter")));
        assert!(matches!(result, Err(StoreError::Query { .. })));
        assert!(manager.is_healthy());
    }

    #[test]
    fn test_run_against_real_connection() {
        let fx = Fixture::new();
        let id = DocumentId::from_bytes([1; 12]);
        fx.cluster.insert_document(Document::new(id, ShardId(1)));
        let manager = fx.manager();

        let found = manager
            .with_connection(|conn| conn.find_one(&id, BlockFilter::Served))
            .unwrap()
            .into_option()
            .flatten();
        assert_eq!(found.map(|d| d.id), Some(id));
    }

    #[test]
    fn test_master_without_connection_is_hard_failure() {
        let fx = Fixture::new();
        let manager = fx.manager();
        manager.invalidate(EndpointIndex::Master, true);

        let outcome = manager.with_master(|conn| conn.count()).unwrap();
        assert_eq!(outcome, ScopeOutcome::HardFailure);
    }

    #[test]
    fn test_refresh_descriptor_keeps_addresses() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let mut latest = descriptor(1).with_last_touched(Utc::now());
        latest.public_host = "elsewhere".to_string();
        latest.document_count = 42;

        manager.refresh_descriptor(&latest);
        let current = manager.descriptor();
        assert_eq!(current.public_host, "public");
        assert_eq!(current.document_count, 42);
        assert!(manager.last_touched().is_some());
    }

    #[test]
    fn test_concurrent_invalidations() {
        let fx = Fixture::new();
        let manager = Arc::new(fx.manager());
        let mut handles = vec![];

        for i in 0..8 {
            let m = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                m.invalidate(EndpointIndex::ALL[i % 2], false);
                m.reconnect();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        manager.reconnect();
        assert!(manager.is_healthy());
        assert!(manager.pending_rechecks().is_empty());
    }

    #[test]
    fn test_hard_invalidations_racing_reconnect_keep_handles() {
        let fx = Fixture::new();
        let manager = Arc::new(fx.manager());
        let mut handles = vec![];

        for i in 0..8 {
            let m = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    if i % 2 == 0 {
                        m.invalidate(EndpointIndex::ALL[i % 4 / 2], true);
                    } else {
                        m.reconnect();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        manager.reconnect();
        for index in EndpointIndex::ALL {
            let endpoint = manager.endpoint(index);
            assert_eq!(endpoint.state(), EndpointState::Available);
            assert!(endpoint.connection().is_some(), "{} endpoint lost its handle", index);
        }
    }

    #[test]
    fn test_drop_closes_connections() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let public = manager.endpoint(EndpointIndex::Public).connection().unwrap();
        let master = manager.endpoint(EndpointIndex::Master).connection().unwrap();
        assert!(public.ping().is_ok());

        drop(manager);
        assert_eq!(public.ping().unwrap_err().kind, ClientErrorKind::ConnectionLost);
        assert_eq!(master.ping().unwrap_err().kind, ClientErrorKind::ConnectionLost);
    }

    #[test]
    fn test_endpoint_index_order() {
        assert_eq!(EndpointIndex::ALL[0], EndpointIndex::Public);
        assert_eq!(EndpointIndex::Master.as_usize(), 1);
        assert_eq!(EndpointIndex::Master.to_string(), "master");
    }
}
