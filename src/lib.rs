// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

//! This crate provides the transactional half of a client for [TiKV](https://github.com/tikv/tikv),
//! a distributed, transactional key-value database written in Rust.
//!
//! Transactions follow the Percolator protocol. Reads see a snapshot at the transaction's start
//! timestamp and writes are buffered locally. At commit time every written key is prewritten
//! (locked, with the value staged) and then the primary key is committed. The transaction is
//! committed exactly when its primary is; the other keys (secondaries) are committed in the
//! background and anyone meeting their locks resolves them through the primary.
//!
//! The crate does not talk to a cluster by itself. A [`TransactionClient`] is built from the
//! collaborators a transaction needs, each behind a trait:
//!
//! - [`KvClient`](store::KvClient) sends the transactional RPCs to one region,
//! - [`RegionRouter`](region::RegionRouter) maps keys to regions,
//! - [`TimestampOracle`] hands out timestamps,
//! - [`LockResolver`](transaction::LockResolver) cleans up locks of other transactions,
//! - [`Snapshot`](transaction::Snapshot) reads committed data.
//!
//! With the `test-util` feature the [`mock`] module provides in-memory versions of all of them.
//!
//! ## Optimistic and pessimistic transactions
//!
//! An optimistic transaction takes no locks until it commits, and finds write conflicts during
//! prewrite. A pessimistic transaction locks every key it writes (or reads with
//! [`get_for_update`](Transaction::get_for_update)) right away, so conflicts surface at the
//! statement and the commit only fails in exceptional cases.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use tikv_txn::{TransactionClient, Result};
//! # async fn example(txn_client: TransactionClient) -> Result<()> {
//! let mut txn = txn_client.begin_optimistic().await?;
//! txn.put("key".to_owned(), "value".to_owned()).await?;
//! let _value = txn.get("key".to_owned()).await?;
//! txn.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Since this crate provides an async API, you need an async runtime (Tokio-only).

#![allow(clippy::field_reassign_with_default)]

pub mod region;
pub mod store;
#[doc(hidden)]
pub mod transaction;

mod backoffer;
mod common;
mod config;
mod kv;
mod stats;
mod timestamp;
mod util;

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(feature = "test-util", allow(dead_code))]
pub mod mock;

#[doc(inline)]
pub use common::DeadlockError;
#[doc(inline)]
pub use common::Error;
#[doc(inline)]
pub use common::KeyExistsError;
#[doc(inline)]
pub use common::Result;
#[doc(inline)]
pub use common::WriteConflictError;
#[doc(inline)]
pub use config::BackoffBudget;
#[doc(inline)]
pub use config::TxnConfig;

#[doc(inline)]
pub use crate::kv::key_hash;
#[doc(inline)]
pub use crate::kv::Key;
#[doc(inline)]
pub use crate::kv::Value;
#[doc(inline)]
pub use crate::timestamp::compose_ts;
#[doc(inline)]
pub use crate::timestamp::extract_logical;
#[doc(inline)]
pub use crate::timestamp::extract_physical;
#[doc(inline)]
pub use crate::timestamp::get_physical;
#[doc(inline)]
pub use crate::timestamp::time_to_ts;
#[doc(inline)]
pub use crate::timestamp::TimestampOracle;
#[doc(inline)]
pub use crate::timestamp::MAX_COMMIT_TS_SKEW;
#[doc(inline)]
pub use crate::transaction::CheckLevel;
#[doc(inline)]
pub use crate::transaction::Client as TransactionClient;
#[doc(inline)]
pub use crate::transaction::CommitDetails;
#[doc(inline)]
pub use crate::transaction::LockCtx;
#[doc(inline)]
pub use crate::transaction::Transaction;
#[doc(inline)]
pub use crate::transaction::TransactionKind;
#[doc(inline)]
pub use crate::transaction::TransactionOptions;
