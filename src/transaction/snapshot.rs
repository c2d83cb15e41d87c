// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use crate::Key;
use crate::Result;
use crate::Value;

/// Reads committed data as of a timestamp.
///
/// A snapshot read at `version` sees writes committed before `version` and ignores later ones.
/// The transaction overlays its write buffer on top of it.
#[async_trait]
pub trait Snapshot: Send + Sync + 'static {
    async fn get(&self, key: &Key, version: u64) -> Result<Option<Value>>;

    /// Read several keys, returning only the ones that exist.
    async fn batch_get(&self, keys: &[Key], version: u64) -> Result<Vec<(Key, Value)>> {
        let mut res = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key, version).await? {
                res.push((key.clone(), value));
            }
        }
        Ok(res)
    }
}
