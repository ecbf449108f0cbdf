// Copyright 2025-2026 Maurice S. Barnum
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::Error;
use crate::ErrorKind;
use crate::OverlappingRangesData;
use crate::PartitionKey;
use crate::Result;
use crate::RoutingError;
use crate::transport::Transport;

/// Exclusive upper bound of the hashed key space.  Ranges cover `[0, KEY_SPACE_END)`.
pub const KEY_SPACE_END: u64 = 1 << 32;

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(i64);

impl PartitionId {
    pub const fn new(val: i64) -> Self {
        Self(val)
    }

    pub const fn is_invalid(self) -> bool {
        self.0 < 0
    }
}

impl From<i64> for PartitionId {
    #[inline]
    fn from(val: i64) -> Self {
        Self(val)
    }
}

impl From<PartitionId> for i64 {
    #[inline]
    fn from(my: PartitionId) -> Self {
        my.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash a partition key into the routing key space
#[inline]
pub fn hash_partition_key(key: &PartitionKey) -> u32 {
    let h = xxh3_64(key.as_str().as_bytes());
    (h & 0xffff_ffff) as u32
}

/// A half-open slice `[low, high)` of the hashed key space owned by one partition.
///
/// `parents` lists the partitions this one was split from, oldest first.  It lets session
/// tokens and feed cursors recorded against a retired partition carry over to its children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionKeyRange {
    pub id: PartitionId,
    pub low: u64,
    pub high: u64,
    pub parents: Vec<PartitionId>,
}

impl PartitionKeyRange {
    pub fn new(id: PartitionId, low: u64, high: u64) -> Self {
        Self {
            id,
            low,
            high,
            parents: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parents(mut self, parents: Vec<PartitionId>) -> Self {
        self.parents = parents;
        self
    }

    #[inline]
    pub fn contains(&self, hash: u64) -> bool {
        self.low <= hash && hash < self.high
    }

    #[inline]
    pub fn overlaps(&self, low: u64, high: u64) -> bool {
        self.low < high && low < self.high
    }

    /// The part of `[low, high)` this range owns, if any
    pub fn clip(&self, low: u64, high: u64) -> Option<(u64, u64)> {
        self.overlaps(low, high)
            .then(|| (self.low.max(low), self.high.min(high)))
    }

    pub fn descends_from(&self, id: PartitionId) -> bool {
        self.parents.contains(&id)
    }
}

impl fmt::Display for PartitionKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:#x}, {:#x})", self.id, self.low, self.high)
    }
}

/// A validated, versioned snapshot of the partition layout of one container.
#[derive(Debug, Default)]
pub struct PartitionMap {
    version: u64,
    ranges: Vec<PartitionKeyRange>,
    // index into `ranges`
    by_id: HashMap<PartitionId, usize>,
}

impl PartitionMap {
    fn empty(version: u64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Build a map from ranges in any order.  The ranges must tile `[0, KEY_SPACE_END)` exactly.
    pub fn build(version: u64, mut ranges: Vec<PartitionKeyRange>) -> Result<Self> {
        ranges.sort_unstable_by_key(|r| (r.low, r.high));
        let by_id = Self::index(&ranges)?;
        Self::validate(&ranges)?;

        Ok(Self {
            version,
            ranges,
            by_id,
        })
    }

    // Position of each id in `ranges`.  Ids must be unique and non-negative.
    fn index(
        ranges: &[PartitionKeyRange],
    ) -> std::result::Result<HashMap<PartitionId, usize>, RoutingError> {
        let mut by_id = HashMap::with_capacity(ranges.len());
        for (i, r) in ranges.iter().enumerate() {
            if r.low >= r.high {
                return Err(RoutingError::EmptyRange(r.id));
            }
            if r.id.is_invalid() {
                return Err(RoutingError::DuplicatePartitionId(r.id));
            }
            match by_id.entry(r.id) {
                Entry::Occupied(_) => return Err(RoutingError::DuplicatePartitionId(r.id)),
                Entry::Vacant(v) => {
                    v.insert(i);
                }
            }
        }
        Ok(by_id)
    }

    fn validate(ranges: &[PartitionKeyRange]) -> std::result::Result<(), RoutingError> {
        let (first, last) = match (ranges.first(), ranges.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(RoutingError::NoRanges),
        };

        if first.low != 0 {
            return Err(RoutingError::MissingStart { low: first.low });
        }
        if last.high != KEY_SPACE_END {
            return Err(RoutingError::MissingEnd {
                high: last.high,
                expected: KEY_SPACE_END,
            });
        }

        for pair in ranges.windows(2) {
            let (p, r) = (&pair[0], &pair[1]);
            if r.low < p.high {
                let overlap = OverlappingRangesData {
                    range1_low: p.low,
                    range1_high: p.high,
                    range2_low: r.low,
                    range2_high: r.high,
                };
                return Err(RoutingError::OverlappingRanges(Box::new(overlap)));
            }
            if r.low > p.high {
                return Err(RoutingError::Gap {
                    end: p.high,
                    next_start: r.low,
                });
            }
        }

        Ok(())
    }

    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Ranges in key space order
    pub fn ranges(&self) -> &[PartitionKeyRange] {
        &self.ranges
    }

    /// The range owning `hash`.  Only `None` on an empty map.
    pub fn resolve_hash(&self, hash: u64) -> Option<&PartitionKeyRange> {
        let i = self.ranges.partition_point(|r| r.high <= hash);
        self.ranges.get(i).filter(|r| r.contains(hash))
    }

    pub fn resolve(&self, key: &PartitionKey) -> Option<&PartitionKeyRange> {
        self.resolve_hash(u64::from(hash_partition_key(key)))
    }

    pub fn get(&self, id: PartitionId) -> Option<&PartitionKeyRange> {
        self.by_id.get(&id).and_then(|&i| self.ranges.get(i))
    }

    /// Ranges intersecting `[low, high)`, in key space order
    pub fn overlapping(&self, low: u64, high: u64) -> impl Iterator<Item = &PartitionKeyRange> {
        let start = self.ranges.partition_point(|r| r.high <= low);
        self.ranges[start..]
            .iter()
            .take_while(move |r| r.low < high)
    }
}

/// Maps partition keys to the partition currently owning them.
///
/// Lookups read a lock-free snapshot.  Refreshes are serialised and deduplicated: callers pass
/// the version they found stale, and a refresh that someone else already completed is skipped.
pub struct Router {
    container: Arc<str>,
    transport: Arc<dyn Transport>,
    map: ArcSwap<PartitionMap>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("container", &self.container)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub(crate) fn new(container: Arc<str>, transport: Arc<dyn Transport>) -> Self {
        Self {
            container,
            transport,
            map: ArcSwap::from_pointee(PartitionMap::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// The current snapshot, possibly empty if nothing was loaded yet.  The layout is volatile:
    /// callers must be prepared for it to be stale by the time it is used.
    pub fn current(&self) -> Arc<PartitionMap> {
        self.map.load_full()
    }

    pub fn version(&self) -> u64 {
        self.map.load().version()
    }

    /// Drop the cached ranges if they are still at `stale_version`, so the next lookup fetches a
    /// fresh map.  Returns false when a newer map is already in place.
    pub fn invalidate(&self, stale_version: u64) -> bool {
        let current = self.map.load();
        if current.is_empty() || current.version() != stale_version {
            return false;
        }
        let empty = Arc::new(PartitionMap::empty(stale_version));
        let prev = self.map.compare_and_swap(&*current, empty);
        if !Arc::ptr_eq(&*prev, &*current) {
            return false;
        }
        debug!(container = %self.container, version = stale_version, "partition map invalidated");
        true
    }

    /// The current snapshot, loading it first if needed
    pub async fn loaded(&self) -> Result<Arc<PartitionMap>> {
        let current = self.current();
        if current.is_empty() {
            return self.refresh(current.version()).await;
        }
        Ok(current)
    }

    pub async fn resolve(&self, key: &PartitionKey) -> Result<PartitionKeyRange> {
        let map = self.loaded().await?;
        map.resolve(key)
            .cloned()
            .ok_or_else(|| Error::routing(format!("no partition for key {key}")))
    }

    /// Drop the snapshot at `stale_version` and fetch a new one from the store.
    ///
    /// Returns without fetching when the snapshot is already newer than `stale_version`.
    /// A failed fetch leaves the previous snapshot in place.
    pub async fn refresh(&self, stale_version: u64) -> Result<Arc<PartitionMap>> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current();
        if !current.is_empty() && current.version() > stale_version {
            debug!(
                container = %self.container,
                version = current.version(),
                "partition map already refreshed"
            );
            return Ok(current);
        }

        let rsp = self
            .transport
            .partition_map(&self.container)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound
                | ErrorKind::Malformed
                | ErrorKind::Cancelled
                | ErrorKind::RoutingUnavailable => e,
                _ => Error::routing(e),
            });
        let rsp = match rsp {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!(container = %self.container, ?e, "partition map refresh failed");
                return Err(e);
            }
        };

        let map = PartitionMap::build(rsp.version, rsp.ranges)?;
        if map.version() < current.version() {
            warn!(
                container = %self.container,
                current = current.version(),
                received = map.version(),
                "ignoring older partition map"
            );
            return Ok(current);
        }

        info!(
            container = %self.container,
            version = map.version(),
            partitions = map.len(),
            "partition map refreshed"
        );
        let map = Arc::new(map);
        self.map.store(Arc::clone(&map));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn r(id: i64, low: u64, high: u64) -> PartitionKeyRange {
        PartitionKeyRange::new(PartitionId::new(id), low, high)
    }

    fn even_map(n: u64) -> PartitionMap {
        let step = KEY_SPACE_END / n;
        let ranges = (0..n)
            .map(|i| {
                let high = if i + 1 == n { KEY_SPACE_END } else { (i + 1) * step };
                #[allow(clippy::cast_possible_wrap)]
                r(i as i64, i * step, high)
            })
            .collect();
        PartitionMap::build(1, ranges).unwrap()
    }

    #[test]
    fn test_build_rejects_overlaps() {
        let err = PartitionMap::build(1, vec![r(0, 0, 10), r(1, 5, KEY_SPACE_END)]).unwrap_err();
        assert_eq!(ErrorKind::RoutingUnavailable, err.kind());
        assert!(err.to_string().contains("overlaps"), "{err}");
    }

    #[test]
    fn test_build_rejects_gaps_and_holes() {
        let cases = [
            vec![],
            vec![r(0, 1, KEY_SPACE_END)],
            vec![r(0, 0, 100)],
            vec![r(0, 0, 100), r(1, 101, KEY_SPACE_END)],
            vec![r(0, 0, 100), r(0, 100, KEY_SPACE_END)],
            vec![r(0, 0, 0), r(1, 0, KEY_SPACE_END)],
        ];
        for ranges in cases {
            let desc = format!("{ranges:?}");
            assert!(PartitionMap::build(1, ranges).is_err(), "{desc}");
        }
    }

    #[test]
    fn test_build_sorts_input() {
        let map = PartitionMap::build(
            3,
            vec![r(2, 200, KEY_SPACE_END), r(0, 0, 100), r(1, 100, 200)],
        )
        .unwrap();
        let ids: Vec<i64> = map.ranges().iter().map(|r| r.id.into()).collect();
        assert_eq!(vec![0, 1, 2], ids);
        assert_eq!(3, map.version());
        assert_eq!(Some(100), map.get(PartitionId::new(1)).map(|r| r.low));
    }

    #[test]
    fn test_resolve_boundaries() {
        let map = PartitionMap::build(
            1,
            vec![r(0, 0, 100), r(1, 100, 200), r(2, 200, KEY_SPACE_END)],
        )
        .unwrap();
        assert_eq!(PartitionId::new(0), map.resolve_hash(0).unwrap().id);
        assert_eq!(PartitionId::new(0), map.resolve_hash(99).unwrap().id);
        assert_eq!(PartitionId::new(1), map.resolve_hash(100).unwrap().id);
        assert_eq!(PartitionId::new(2), map.resolve_hash(200).unwrap().id);
        assert_eq!(
            PartitionId::new(2),
            map.resolve_hash(KEY_SPACE_END - 1).unwrap().id
        );
        assert!(map.resolve_hash(KEY_SPACE_END).is_none());
    }

    #[test]
    fn test_resolve_key_is_stable() {
        let map = even_map(4);
        let key = PartitionKey::from("Sweets");
        let expected = u64::from(hash_partition_key(&key));
        let range = map.resolve(&key).unwrap();
        assert!(range.contains(expected));
        assert_eq!(range.id, map.resolve(&PartitionKey::from("Sweets")).unwrap().id);
    }

    #[test]
    fn test_overlapping() {
        let map = even_map(4);
        let step = KEY_SPACE_END / 4;
        let ids: Vec<i64> = map
            .overlapping(step - 1, 2 * step + 1)
            .map(|r| r.id.into())
            .collect();
        assert_eq!(vec![0, 1, 2], ids);

        let ids: Vec<i64> = map.overlapping(step, 2 * step).map(|r| r.id.into()).collect();
        assert_eq!(vec![1], ids);

        assert_eq!(4, map.overlapping(0, KEY_SPACE_END).count());
    }

    #[test]
    fn test_clip() {
        let range = r(0, 100, 200);
        assert_eq!(Some((100, 150)), range.clip(0, 150));
        assert_eq!(Some((120, 200)), range.clip(120, 1000));
        assert_eq!(None, range.clip(200, 300));
        assert_eq!(None, range.clip(0, 100));
    }

    fn router(partitions: usize) -> (MemoryStore, Router) {
        let store = MemoryStore::new();
        store.create_container("c", partitions).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(store.clone());
        (store, Router::new(Arc::from("c"), transport))
    }

    #[test]
    fn test_get_by_sparse_ids() {
        let map = PartitionMap::build(
            1,
            vec![r(7, 0, 100), r(1_000_000, 100, 200), r(3, 200, KEY_SPACE_END)],
        )
        .unwrap();
        assert_eq!(Some(100), map.get(PartitionId::new(1_000_000)).map(|r| r.low));
        assert_eq!(Some(200), map.get(PartitionId::new(3)).map(|r| r.low));
        assert!(map.get(PartitionId::new(0)).is_none());

        let err = PartitionMap::build(1, vec![r(-1, 0, KEY_SPACE_END)]).unwrap_err();
        assert_eq!(ErrorKind::RoutingUnavailable, err.kind());
    }

    #[test_log::test(tokio::test)]
    async fn test_invalidate_refetches_on_next_lookup() {
        let (store, router) = router(2);
        let key = PartitionKey::from("Sweets");
        let map = router.loaded().await.unwrap();
        assert_eq!(1, store.partition_map_requests());

        assert!(!router.invalidate(map.version() + 1));
        assert!(!router.current().is_empty());

        assert!(router.invalidate(map.version()));
        assert!(router.current().is_empty());
        assert!(!router.invalidate(map.version()));

        let range = router.resolve(&key).await.unwrap();
        assert_eq!(map.resolve(&key), Some(&range));
        assert_eq!(2, store.partition_map_requests());
        router.resolve(&key).await.unwrap();
        assert_eq!(2, store.partition_map_requests());
    }

    #[test_log::test(tokio::test)]
    async fn test_refresh_is_deduplicated() {
        let (store, router) = router(1);
        let stale = router.loaded().await.unwrap();
        store.split_partition("c", PartitionId::new(0)).unwrap();

        let (a, b) = tokio::join!(
            router.refresh(stale.version()),
            router.refresh(stale.version())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(2, a.len());
        assert!(a.version() > stale.version());
        assert_eq!(2, store.partition_map_requests());

        // a stale invalidation after the refresh leaves the new map alone
        assert!(!router.invalidate(stale.version()));
        assert_eq!(a.version(), router.version());
    }
}
