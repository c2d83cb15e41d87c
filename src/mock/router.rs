// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::region::KeyLocation;
use crate::region::RegionId;
use crate::region::RegionRouter;
use crate::region::RegionVerId;
use crate::store::RegionError;
use crate::Key;
use crate::Result;

/// The authoritative region layout of the mock store.
///
/// Regions cover the whole key space without gaps. Splitting bumps the version of the split
/// region, so requests addressed with the old version are rejected.
#[derive(Debug)]
pub struct MockCluster {
    regions: Mutex<Vec<KeyLocation>>,
    next_id: AtomicU64,
}

impl MockCluster {
    pub fn new() -> Arc<MockCluster> {
        let first = RegionVerId {
            id: 1,
            conf_ver: 1,
            ver: 1,
        };
        Arc::new(MockCluster {
            regions: Mutex::new(vec![KeyLocation::new(first, Key::EMPTY, Key::EMPTY)]),
            next_id: AtomicU64::new(2),
        })
    }

    pub fn with_splits(split_keys: impl IntoIterator<Item = impl Into<Key>>) -> Arc<MockCluster> {
        let cluster = MockCluster::new();
        for key in split_keys {
            cluster.split(key);
        }
        cluster
    }

    /// Split the region containing `key` so that a new region starts at `key`.
    ///
    /// Returns the id of the new region, or `None` if a region already starts at `key`.
    pub fn split(&self, key: impl Into<Key>) -> Option<RegionId> {
        let key = key.into();
        let mut regions = self.regions.lock().unwrap();
        let pos = regions.iter().position(|r| r.contains(&key))?;
        if regions[pos].start_key == key {
            return None;
        }
        let old = regions[pos].clone();
        let ver = old.region.ver + 1;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        regions[pos] = KeyLocation::new(
            RegionVerId {
                ver,
                ..old.region
            },
            old.start_key,
            key.clone(),
        );
        regions.insert(
            pos + 1,
            KeyLocation::new(
                RegionVerId {
                    id,
                    conf_ver: 1,
                    ver,
                },
                key,
                old.end_key,
            ),
        );
        Some(id)
    }

    pub fn locate(&self, key: &Key) -> KeyLocation {
        let regions = self.regions.lock().unwrap();
        regions
            .iter()
            .find(|r| r.contains(key))
            .cloned()
            .unwrap_or_else(|| regions[0].clone())
    }

    pub fn regions(&self) -> Vec<KeyLocation> {
        self.regions.lock().unwrap().clone()
    }

    /// The region error a store would answer a request for `keys` addressed to `region` with.
    pub fn check_epoch(&self, region: RegionVerId, keys: &[Key]) -> Option<RegionError> {
        let regions = self.regions.lock().unwrap();
        let Some(current) = regions.iter().find(|r| r.region.id == region.id) else {
            return Some(RegionError::RegionNotFound {
                region_id: region.id,
            });
        };
        if current.region != region {
            return Some(RegionError::EpochNotMatch {
                current_regions: regions.iter().map(|r| r.region).collect(),
            });
        }
        keys.iter()
            .find(|key| !current.contains(key))
            .map(|key| RegionError::KeyNotInRegion {
                key: key.clone(),
                region_id: region.id,
            })
    }
}

/// A region router with a cache that goes stale when the cluster splits.
#[derive(Debug)]
pub struct MockRouter {
    cluster: Arc<MockCluster>,
    cache: Mutex<Vec<KeyLocation>>,
    misses: AtomicUsize,
}

impl MockRouter {
    pub fn new(cluster: Arc<MockCluster>) -> MockRouter {
        MockRouter {
            cluster,
            cache: Mutex::new(Vec::new()),
            misses: AtomicUsize::new(0),
        }
    }

    /// How many lookups had to go to the cluster.
    pub fn cache_misses(&self) -> usize {
        self.misses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegionRouter for MockRouter {
    async fn locate_key(&self, key: &Key) -> Result<KeyLocation> {
        if let Some(loc) = self
            .cache
            .lock()
            .unwrap()
            .iter()
            .find(|loc| loc.contains(key))
        {
            return Ok(loc.clone());
        }
        self.misses.fetch_add(1, Ordering::SeqCst);
        let loc = self.cluster.locate(key);
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|cached| cached.region.id != loc.region.id);
        cache.push(loc.clone());
        Ok(loc)
    }

    async fn invalidate_region(&self, region: RegionVerId) {
        self.cache
            .lock()
            .unwrap()
            .retain(|cached| cached.region.id != region.id);
    }

    async fn split_regions(&self, split_keys: Vec<Key>, _scatter: bool) -> Result<Vec<RegionId>> {
        Ok(split_keys
            .into_iter()
            .filter_map(|key| self.cluster.split(key))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_bumps_version_and_rejects_old_epoch() {
        let cluster = MockCluster::new();
        let before = cluster.locate(&Key::from("x"));
        let new_id = cluster.split("m").unwrap();
        assert_eq!(cluster.split("m"), None);

        let left = cluster.locate(&Key::from("a"));
        let right = cluster.locate(&Key::from("x"));
        assert_eq!(left.region.id, before.region.id);
        assert_eq!(left.region.ver, before.region.ver + 1);
        assert_eq!(right.region.id, new_id);
        assert_eq!(right.start_key, Key::from("m"));

        assert!(matches!(
            cluster.check_epoch(before.region, &[Key::from("a")]),
            Some(RegionError::EpochNotMatch { .. })
        ));
        assert!(matches!(
            cluster.check_epoch(left.region, &[Key::from("z")]),
            Some(RegionError::KeyNotInRegion { .. })
        ));
        assert_eq!(cluster.check_epoch(right.region, &[Key::from("z")]), None);
    }

    #[tokio::test]
    async fn router_cache_goes_stale_until_invalidated() {
        let cluster = MockCluster::new();
        let router = MockRouter::new(cluster.clone());
        let stale = router.locate_key(&Key::from("z")).await.unwrap();
        cluster.split("m");

        assert_eq!(router.locate_key(&Key::from("z")).await.unwrap(), stale);
        assert_eq!(router.cache_misses(), 1);

        router.invalidate_region(stale.region).await;
        let fresh = router.locate_key(&Key::from("z")).await.unwrap();
        assert_ne!(fresh.region, stale.region);
        assert_eq!(router.cache_misses(), 2);
    }
}
