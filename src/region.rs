// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;
use derive_new::new;

use crate::Error;
use crate::Key;
use crate::Result;

pub type RegionId = u64;

/// The ID and version information of a region.
///
/// A region that has been split or merged gets a new `ver`; requests addressed to an older
/// version are rejected by the store with a region error.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Default, Debug)]
pub struct RegionVerId {
    pub id: RegionId,
    pub conf_ver: u64,
    pub ver: u64,
}

/// The region owning a key and the key range `[start_key, end_key)` it covers.
///
/// An empty `end_key` means the region extends to the end of the key space.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct KeyLocation {
    pub region: RegionVerId,
    pub start_key: Key,
    pub end_key: Key,
}

impl KeyLocation {
    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.start_key && (self.end_key.is_empty() || key < &self.end_key)
    }
}

/// Maps keys to the regions that currently own them.
///
/// Answers may be stale. A stale answer shows up as a region error from the store, after which
/// the caller invalidates the region and asks again.
#[async_trait]
pub trait RegionRouter: Send + Sync + 'static {
    async fn locate_key(&self, key: &Key) -> Result<KeyLocation>;

    /// Drop any cached knowledge of `region`.
    async fn invalidate_region(&self, region: RegionVerId);

    /// The store rejected a request to `region` and reported the regions it currently has.
    ///
    /// Returns `true` once the cache is refreshed and the request can be retried right away,
    /// `false` if the store is behind this router and the caller should back off first.
    async fn on_epoch_not_match(
        &self,
        region: RegionVerId,
        current_regions: &[RegionVerId],
    ) -> bool {
        let store_is_behind = current_regions
            .iter()
            .filter(|r| r.id == region.id)
            .any(|r| r.conf_ver < region.conf_ver || r.ver < region.ver);
        if store_is_behind {
            return false;
        }
        self.invalidate_region(region).await;
        !current_regions.is_empty()
    }

    /// Group sorted `keys` into runs owned by the same region, preserving order.
    async fn group_keys_by_region(&self, keys: &[Key]) -> Result<Vec<(RegionVerId, Vec<Key>)>> {
        let mut groups: Vec<(RegionVerId, Vec<Key>)> = Vec::new();
        let mut location: Option<KeyLocation> = None;
        for key in keys {
            match &location {
                Some(loc) if loc.contains(key) => {}
                _ => {
                    let loc = self.locate_key(key).await?;
                    groups.push((loc.region, Vec::new()));
                    location = Some(loc);
                }
            }
            if let Some((_, group)) = groups.last_mut() {
                group.push(key.clone());
            }
        }
        Ok(groups)
    }

    /// Split regions at `split_keys` and return the ids of the new regions.
    async fn split_regions(&self, split_keys: Vec<Key>, scatter: bool) -> Result<Vec<RegionId>> {
        let _ = (split_keys, scatter);
        Err(Error::StringError(
            "region split is not supported by this router".to_owned(),
        ))
    }

    async fn wait_scatter_region_finish(&self, region_id: RegionId) -> Result<()> {
        let _ = region_id;
        Ok(())
    }
}
