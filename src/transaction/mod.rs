// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Transactional related functionality.
//!
//! Using the [`TransactionClient`](crate::TransactionClient) you can utilize TiKV's transactional
//! interface.
//!
//! This interface offers SQL-like transactions on top of the raw interface.
//!
//! **Warning:** It is not advisable to use both raw and transactional functionality in the same
//! keyspace.

pub use self::client::Client;
pub use self::committer::CommitDetails;
pub use self::hooks::FaultAction;
pub use self::hooks::FaultHooks;
pub use self::hooks::NoopHooks;
pub use self::hooks::RpcKind;
pub use self::key_flags::FlagsOp;
pub use self::key_flags::KeyFlags;
pub use self::lock_ctx::LockCtx;
pub use self::lock_ctx::ReturnedValue;
pub use self::lock_ctx::LOCK_ALWAYS_WAIT;
pub use self::lock_ctx::LOCK_NO_WAIT;
pub use self::lock_resolver::LockResolver;
pub use self::lock_resolver::ResolvedLocks;
pub use self::mutations::key_size;
pub use self::mutations::key_value_size;
pub use self::mutations::split_into_batches;
pub use self::mutations::BatchMutations;
pub use self::mutations::GroupedMutations;
pub use self::mutations::MutationSet;
pub use self::schema::RelatedSchemaChange;
pub use self::schema::SchemaAmender;
pub use self::schema::SchemaChecker;
pub use self::snapshot::Snapshot;
pub use self::transaction::CheckLevel;
pub use self::transaction::Transaction;
pub use self::transaction::TransactionKind;
pub use self::transaction::TransactionOptions;

mod action;
mod batch_executor;
mod buffer;
mod client;
mod committer;
mod hooks;
mod key_flags;
mod lock_ctx;
mod lock_resolver;
mod mutations;
mod schema;
mod snapshot;
#[allow(clippy::module_inception)]
mod transaction;
mod ttl_manager;
