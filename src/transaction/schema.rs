// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Hooks into schema versioning, consulted between prewrite and commit.

use async_trait::async_trait;

use super::mutations::MutationSet;
use crate::Result;

/// A schema change affecting tables the transaction wrote to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelatedSchemaChange {
    pub latest_version: i64,
    pub table_ids: Vec<i64>,
    /// Whether the transaction's mutations can be rewritten to match the new schema.
    pub amendable: bool,
}

#[async_trait]
pub trait SchemaChecker: Send + Sync + 'static {
    /// Check whether the schema moved on from `start_version` as of `check_ts`.
    ///
    /// Returns `Ok(None)` when nothing related changed.
    async fn check_by_version(
        &self,
        check_ts: u64,
        start_version: i64,
    ) -> Result<Option<RelatedSchemaChange>>;
}

#[async_trait]
pub trait SchemaAmender: Send + Sync + 'static {
    /// Compute the mutations to add so `mutations` are valid under `change`.
    ///
    /// Added mutations flagged as pessimistic locks are locked before being prewritten.
    async fn amend(
        &self,
        start_version: i64,
        change: &RelatedSchemaChange,
        mutations: &MutationSet,
    ) -> Result<MutationSet>;
}
