//! Parallel multi-shard reads under a deadline.
//!
//! One worker thread per shard runs the lookup through that shard's
//! connection manager and sends its result over a channel. The caller
//! collects until every worker has answered or the deadline passes,
//! whichever comes first. Workers still running at the deadline are
//! abandoned, not cancelled: each owns an `Arc` of its manager, so the
//! connection stays valid after the caller has moved on, and a late result
//! is dropped with the channel.
//!
//! A single-shard read runs on the caller's thread and reports errors like
//! a direct lookup would. In a multi-shard read a failing shard only makes
//! the result partial.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::health::{ConnectionManager, ScopeOutcome};
use crate::registry::ShardRegistry;
use crate::routing::ShardBuckets;
use crate::types::{BlockFilter, Document, DocumentId, ShardId};

/// What one worker sends back.
type UnitResult = (ShardId, Result<ScopeOutcome<Vec<Document>>>);

/// Runs bucketed lookups across shards.
pub struct FanoutEngine {
    registry: Arc<ShardRegistry>,
}

impl FanoutEngine {
    pub fn new(registry: Arc<ShardRegistry>) -> Self {
        Self { registry }
    }

    /// Documents for every bucket, from whichever shards answer in time.
    ///
    /// No order across shards; within a shard the database's natural order
    /// is kept.
    pub fn fetch(
        &self,
        buckets: &ShardBuckets,
        block: BlockFilter,
        timeout: Duration,
    ) -> Result<Vec<Document>> {
        match buckets.len() {
            0 => Ok(Vec::new()),
            1 => {
                let Some((&shard, ids)) = buckets.iter().next() else {
                    return Ok(Vec::new());
                };
                self.fetch_single(shard, ids, block)
            }
            _ => Ok(self.fetch_parallel(buckets, block, timeout)),
        }
    }

    /// Lookup on one shard, on the caller's thread.
    pub fn fetch_single(
        &self,
        shard: ShardId,
        ids: &[DocumentId],
        block: BlockFilter,
    ) -> Result<Vec<Document>> {
        self.registry.metrics().record_single_shard();
        let manager = self.registry.get(shard)?;
        let outcome = manager.with_connection(|conn| conn.find_by_ids(ids, block))?;
        Ok(outcome.into_option().unwrap_or_default())
    }

    fn fetch_parallel(
        &self,
        buckets: &ShardBuckets,
        block: BlockFilter,
        timeout: Duration,
    ) -> Vec<Document> {
        let started = Instant::now();
        let deadline = started + timeout;
        let (tx, rx) = crossbeam_channel::unbounded::<UnitResult>();

        let mut spawned = 0;
        for (&shard, ids) in buckets {
            let manager = match self.registry.get(shard) {
                Ok(m) => m,
                Err(e) => {
                    warn!(shard = %shard, error = %e, "skipping shard in fan-out");
                    continue;
                }
            };
            let ids = ids.clone();
            let tx = tx.clone();
            let spawn = thread::Builder::new()
                .name(format!("fanout-{}", shard))
                .spawn(move || {
                    let result = run_unit(&manager, &ids, block);
                    // Receiver is gone once the caller's deadline passed.
                    let _ = tx.send((shard, result));
                });
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => warn!(shard = %shard, error = %e, "failed to spawn fan-out worker"),
            }
        }
        drop(tx);

        let mut documents = Vec::new();
        let mut received = 0;
        let mut answered = 0;
        while received < spawned {
            match rx.recv_deadline(deadline) {
                Ok((shard, result)) => {
                    received += 1;
                    match result {
                        Ok(ScopeOutcome::Success(docs)) => {
                            answered += 1;
                            debug!(shard = %shard, count = docs.len(), "shard answered");
                            documents.extend(docs);
                        }
                        Ok(_) => debug!(shard = %shard, "shard call failed silently"),
                        Err(e) => warn!(shard = %shard, error = %e, "shard lookup failed"),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        pending = spawned - received,
                        timeout_ms = timeout.as_millis() as u64,
                        "fan-out deadline reached, returning partial result"
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.registry
            .metrics()
            .record_fanout(buckets.len(), answered, elapsed_ms);
        documents
    }
}

fn run_unit(
    manager: &ConnectionManager,
    ids: &[DocumentId],
    block: BlockFilter,
) -> Result<ScopeOutcome<Vec<Document>>> {
    match manager.with_connection(|conn| conn.find_by_ids(ids, block)) {
        Err(StoreError::NoEndpointAvailable { shard }) => {
            debug!(shard = %shard, "no endpoint available for fan-out unit");
            Ok(ScopeOutcome::HardFailure)
        }
        other => other,
    }
}
