//! Document id to shard routing through the alias catalog.
//!
//! An alias record maps a raw id to the shard holding it and, optionally,
//! to a different canonical id. Redirects are followed exactly one hop; a
//! target that redirects again is a data-integrity violation and is
//! rejected rather than chased.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error};

use crate::client::Catalog;
use crate::error::{Result, StoreError};
use crate::types::{DocumentId, IndirectionRecord, ShardId};

/// Canonical ids grouped by the shard holding them.
pub type ShardBuckets = BTreeMap<ShardId, Vec<DocumentId>>;

/// Where a document lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// Id to look up on the shard.
    pub id: DocumentId,
    pub shard: ShardId,
}

/// Resolves document ids against the alias catalog.
pub struct Router {
    catalog: Arc<dyn Catalog>,
}

impl Router {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Route for `id`, or `None` when the catalog doesn't know it.
    pub fn resolve_one(&self, id: &DocumentId) -> Result<Option<Route>> {
        let Some(record) = self.catalog.indirection(id).map_err(StoreError::Catalog)? else {
            return Ok(None);
        };

        if let Some(target) = redirect_target(&record) {
            let chained = self
                .catalog
                .indirection(&target)
                .map_err(StoreError::Catalog)?
                .is_some_and(|r| redirect_target(&r).is_some());
            if chained {
                error!(id = %id, target = %target, "redirect target redirects again");
                return Err(StoreError::RedirectChain { id: *id, target });
            }
        }

        Ok(Some(Route {
            id: record.canonical_id(),
            shard: record.shard,
        }))
    }

    /// Bucket `ids` by shard with one catalog query.
    ///
    /// Unknown ids are left out. Ids whose redirect target redirects again
    /// are logged and left out. A second, batched catalog query validates
    /// redirect targets when any are present. Within a bucket, ids keep
    /// their input order, duplicates removed.
    pub fn resolve_many(&self, ids: &[DocumentId]) -> Result<ShardBuckets> {
        if ids.is_empty() {
            return Ok(ShardBuckets::new());
        }

        let records: HashMap<DocumentId, IndirectionRecord> = self
            .catalog
            .indirections(ids)
            .map_err(StoreError::Catalog)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let targets: Vec<DocumentId> = records.values().filter_map(redirect_target).collect();
        let chained: HashSet<DocumentId> = if targets.is_empty() {
            HashSet::new()
        } else {
            self.catalog
                .indirections(&targets)
                .map_err(StoreError::Catalog)?
                .iter()
                .filter(|r| redirect_target(r).is_some())
                .map(|r| r.id)
                .collect()
        };

        let mut buckets = ShardBuckets::new();
        let mut seen = HashSet::new();
        for id in ids {
            let Some(record) = records.get(id) else {
                continue;
            };
            if let Some(target) = redirect_target(record) {
                if chained.contains(&target) {
                    error!(id = %id, target = %target, "redirect target redirects again, id dropped");
                    continue;
                }
            }
            let canonical = record.canonical_id();
            if seen.insert((record.shard, canonical)) {
                buckets.entry(record.shard).or_default().push(canonical);
            }
        }

        debug!(requested = ids.len(), found = seen.len(), shards = buckets.len(), "ids resolved");
        Ok(buckets)
    }
}

/// Redirect target of a record, ignoring self-references.
fn redirect_target(record: &IndirectionRecord) -> Option<DocumentId> {
    record.target.filter(|t| *t != record.id)
}

/// Buckets built from ids whose shard the caller already knows.
pub fn buckets_from_pairs(pairs: &[(DocumentId, ShardId)]) -> ShardBuckets {
    let mut buckets = ShardBuckets::new();
    let mut seen = HashSet::new();
    for &(id, shard) in pairs {
        if seen.insert((shard, id)) {
            buckets.entry(shard).or_default().push(id);
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCatalog;
    use proptest::prelude::*;

    fn id(b: u8) -> DocumentId {
        DocumentId::from_bytes([b; 12])
    }

    fn router(records: &[IndirectionRecord]) -> (Router, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new());
        for r in records {
            catalog.add_indirection(r.clone());
        }
        (Router::new(catalog.clone()), catalog)
    }

    // ============================================================================
    // Single Lookups
    // ============================================================================

    #[test]
    fn test_resolve_direct_record() {
        let (router, _) = router(&[IndirectionRecord::direct(id(1), ShardId(5))]);
        let route = router.resolve_one(&id(1)).unwrap().unwrap();
        assert_eq!(route, Route { id: id(1), shard: ShardId(5) });
    }

    #[test]
    fn test_resolve_redirect_record() {
        let (router, _) = router(&[IndirectionRecord::redirect(id(1), ShardId(5), id(2))]);
        let route = router.resolve_one(&id(1)).unwrap().unwrap();
        assert_eq!(route, Route { id: id(2), shard: ShardId(5) });
    }

    #[test]
    fn test_resolve_absent_is_none() {
        let (router, _) = router(&[]);
        assert!(router.resolve_one(&id(1)).unwrap().is_none());
    }

    #[test]
    fn test_resolve_redirect_to_direct_target() {
        let (router, _) = router(&[
            IndirectionRecord::redirect(id(1), ShardId(5), id(2)),
            IndirectionRecord::direct(id(2), ShardId(5)),
        ]);
        assert_eq!(router.resolve_one(&id(1)).unwrap().unwrap().id, id(2));
    }

    #[test]
    fn test_resolve_rejects_redirect_chain() {
        let (router, _) = router(&[
            IndirectionRecord::redirect(id(1), ShardId(5), id(2)),
            IndirectionRecord::redirect(id(2), ShardId(5), id(3)),
        ]);
        match router.resolve_one(&id(1)) {
            Err(StoreError::RedirectChain { id: from, target }) => {
                assert_eq!(from, id(1));
                assert_eq!(target, id(2));
            }
            other => panic!("expected RedirectChain, got {:?}", other),
        }
    }

    #[test]
    fn test_self_redirect_is_direct() {
        let (router, catalog) = router(&[IndirectionRecord::redirect(id(1), ShardId(2), id(1))]);
        assert_eq!(router.resolve_one(&id(1)).unwrap().unwrap().id, id(1));
        assert_eq!(catalog.indirection_queries(), 1);
    }

    #[test]
    fn test_catalog_failure_surfaces() {
        let (router, catalog) = router(&[]);
        catalog.faults().set_down(true);
        assert!(matches!(router.resolve_one(&id(1)), Err(StoreError::Catalog(_))));
        assert!(matches!(router.resolve_many(&[id(1)]), Err(StoreError::Catalog(_))));
    }

    // ============================================================================
    // Batch Lookups
    // ============================================================================

    #[test]
    fn test_resolve_many_buckets_by_shard() {
        let (router, catalog) = router(&[
            IndirectionRecord::direct(id(1), ShardId(1)),
            IndirectionRecord::direct(id(2), ShardId(2)),
            IndirectionRecord::direct(id(3), ShardId(1)),
        ]);
        let buckets = router.resolve_many(&[id(3), id(2), id(1), id(9)]).unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&ShardId(1)], vec![id(3), id(1)]);
        assert_eq!(buckets[&ShardId(2)], vec![id(2)]);
        // No redirects: exactly one catalog round trip
        assert_eq!(catalog.indirection_queries(), 1);
    }

    #[test]
    fn test_resolve_many_empty_skips_catalog() {
        let (router, catalog) = router(&[]);
        assert!(router.resolve_many(&[]).unwrap().is_empty());
        assert_eq!(catalog.indirection_queries(), 0);
    }

    #[test]
    fn test_resolve_many_redirects_and_dedup() {
        let (router, catalog) = router(&[
            IndirectionRecord::redirect(id(1), ShardId(1), id(2)),
            IndirectionRecord::direct(id(2), ShardId(1)),
        ]);
        let buckets = router.resolve_many(&[id(1), id(2), id(1)]).unwrap();
        assert_eq!(buckets[&ShardId(1)], vec![id(2)]);
        assert_eq!(catalog.indirection_queries(), 2);
    }

    #[test]
    fn test_resolve_many_drops_redirect_chain() {
        let (router, _) = router(&[
            IndirectionRecord::redirect(id(1), ShardId(1), id(2)),
            IndirectionRecord::redirect(id(2), ShardId(1), id(3)),
            IndirectionRecord::direct(id(4), ShardId(1)),
        ]);
        let buckets = router.resolve_many(&[id(1), id(4)]).unwrap();
        assert_eq!(buckets[&ShardId(1)], vec![id(4)]);
    }

    #[test]
    fn test_buckets_from_pairs() {
        let buckets = buckets_from_pairs(&[
            (id(1), ShardId(2)),
            (id(2), ShardId(1)),
            (id(1), ShardId(2)),
        ]);
        assert_eq!(buckets[&ShardId(2)], vec![id(1)]);
        assert_eq!(buckets[&ShardId(1)], vec![id(2)]);
    }

    // ============================================================================
    // Properties
    // ============================================================================

    proptest! {
        #[test]
        fn prop_pairs_bucketed_under_their_shard(
            pairs in prop::collection::vec((any::<[u8; 12]>(), 0u32..8), 0..64)
        ) {
            let pairs: Vec<(DocumentId, ShardId)> = pairs
                .into_iter()
                .map(|(b, s)| (DocumentId::from_bytes(b), ShardId(s)))
                .collect();
            let buckets = buckets_from_pairs(&pairs);

            for (id, shard) in &pairs {
                prop_assert!(buckets[shard].contains(id));
            }
            let distinct: HashSet<_> = pairs.iter().collect();
            let total: usize = buckets.values().map(Vec::len).sum();
            prop_assert_eq!(total, distinct.len());
        }

        #[test]
        fn prop_direct_records_resolve_to_own_shard(
            entries in prop::collection::hash_map(any::<[u8; 12]>(), 0u32..8, 0..32)
        ) {
            let records: Vec<IndirectionRecord> = entries
                .iter()
                .map(|(b, s)| IndirectionRecord::direct(DocumentId::from_bytes(*b), ShardId(*s)))
                .collect();
            let (router, _) = router(&records);
            let ids: Vec<DocumentId> = records.iter().map(|r| r.id).collect();

            let buckets = router.resolve_many(&ids).unwrap();
            let expected = buckets_from_pairs(
                &records.iter().map(|r| (r.id, r.shard)).collect::<Vec<_>>(),
            );
            prop_assert_eq!(buckets, expected);
        }
    }
}
