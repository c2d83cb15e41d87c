// Copyright 2018 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt;
use std::result;

use thiserror::Error;

use crate::backoffer::BackofferError;
use crate::kv::HexRepr;
use crate::store;
use crate::store::RegionError;

/// A write conflict returned by the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteConflictError {
    pub start_ts: u64,
    pub conflict_ts: u64,
    pub conflict_commit_ts: u64,
    pub key: Vec<u8>,
    pub primary: Vec<u8>,
}

impl From<store::WriteConflict> for WriteConflictError {
    fn from(conflict: store::WriteConflict) -> Self {
        Self {
            start_ts: conflict.start_ts,
            conflict_ts: conflict.conflict_ts,
            conflict_commit_ts: conflict.conflict_commit_ts,
            key: conflict.key.into(),
            primary: conflict.primary.into(),
        }
    }
}

impl fmt::Display for WriteConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start_ts={}, conflict_ts={}, conflict_commit_ts={}, key={}",
            self.start_ts,
            self.conflict_ts,
            self.conflict_commit_ts,
            HexRepr(&self.key)
        )
    }
}

/// A uniqueness violation, e.g. `Insert` on a key that already has a value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyExistsError {
    pub key: Vec<u8>,
}

impl fmt::Display for KeyExistsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key={}", HexRepr(&self.key))
    }
}

/// A deadlock reported by the store's deadlock detector.
///
/// `deadlock_key_hash` is the hash of the key whose wait closed the cycle. When it
/// belongs to the keys the failing transaction holds or is locking, the statement can
/// be retried once the rollback it triggered has finished, and `is_retryable` is set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeadlockError {
    pub lock_ts: u64,
    pub lock_key: Vec<u8>,
    pub deadlock_key_hash: u64,
    pub wait_chain: Vec<store::WaitForEntry>,
    pub is_retryable: bool,
}

impl From<store::Deadlock> for DeadlockError {
    fn from(deadlock: store::Deadlock) -> Self {
        Self {
            lock_ts: deadlock.lock_ts,
            lock_key: deadlock.lock_key.into(),
            deadlock_key_hash: deadlock.deadlock_key_hash,
            wait_chain: deadlock.wait_chain,
            is_retryable: false,
        }
    }
}

impl fmt::Display for DeadlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock_ts={}, lock_key={}, deadlock_key_hash={}, wait_chain_len={}, retryable={}",
            self.lock_ts,
            HexRepr(&self.lock_key),
            self.deadlock_key_hash,
            self.wait_chain.len(),
            self.is_retryable
        )
    }
}

/// An error originating from the transaction client or its collaborators.
#[derive(Debug, Error)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    /// Duplicate key insertion happens.
    #[error("Duplicate key insertion")]
    DuplicateKeyInsertion,
    /// Write conflict returned by the store.
    #[error("Write conflict: {0}")]
    WriteConflict(WriteConflictError),
    /// Deadlock returned by the store.
    #[error("Deadlock: {0}")]
    Deadlock(DeadlockError),
    /// Key already exists (e.g. Insert on an existing key).
    #[error("Key already exists: {0}")]
    KeyExists(KeyExistsError),
    /// Retryable error returned by the store.
    #[error("Retryable error: {message}")]
    Retryable { message: String },
    /// The store aborts the transaction with a reason.
    #[error("Store aborts txn: {message}")]
    TxnAborted { message: String },
    /// The lock to commit is gone, the transaction was rolled back by someone else.
    #[error("Txn lock not found, start_ts={start_ts}, key={}", HexRepr(.key))]
    TxnLockNotFound { start_ts: u64, key: Vec<u8> },
    /// The store keeps rejecting commit timestamps and the skew is beyond any sane clock drift.
    #[error(
        "2PC min_commit_ts is too large, min_commit_ts={min_commit_ts}, attempted_commit_ts={attempted_commit_ts}"
    )]
    CommitTsExpired {
        start_ts: u64,
        attempted_commit_ts: u64,
        min_commit_ts: u64,
    },
    /// The commit timestamp is not larger than the start timestamp.
    #[error("Invalid transaction tso with start_ts={start_ts} while commit_ts={commit_ts}")]
    InvalidTxnTso { start_ts: u64, commit_ts: u64 },
    /// The transaction lived longer than the configured maximum.
    #[error("Txn takes too much time, start_ts={start_ts}, commit_ts={commit_ts}")]
    TxnTakesTooLong { start_ts: u64, commit_ts: u64 },
    /// Aggregated size of the mutations is larger than the limit.
    #[error("Transaction is too large, size: {size}, limit: {limit}")]
    TxnTooLarge { size: usize, limit: usize },
    /// A single key-value entry is larger than the limit.
    #[error("Entry too large, key={}, size: {size}, limit: {limit}", HexRepr(.key))]
    EntryTooLarge {
        key: Vec<u8>,
        size: usize,
        limit: usize,
    },
    /// The schema changed since the transaction started and the change could not be amended.
    #[error("Schema changed: {message}")]
    SchemaChanged { message: String },
    /// Waited for a pessimistic lock longer than the caller allowed.
    #[error("Lock wait timeout")]
    LockWaitTimeout,
    /// A pessimistic lock is held by others and the caller asked not to wait.
    #[error("Lock acquired failed and no wait is set")]
    LockAcquireFailAndNoWaitSet,
    /// The TTL manager outlived the max transaction TTL, pessimistic locks may be gone.
    #[error("TTL manager has timed out, pessimistic locks may expire, please commit or rollback this transaction")]
    LockExpired,
    /// The transaction was killed while waiting for locks.
    #[error("Query execution was interrupted")]
    QueryInterrupted,
    /// Will raise this error when using a pessimistic txn only operation on an optimistic txn
    #[error("Invalid operation for this type of transaction")]
    InvalidTransactionType,
    /// It's not allowed to perform operations in a transaction after it has been committed or rolled back.
    #[error("Cannot read or write data after any attempt to commit or roll back the transaction")]
    OperationAfterCommitError,
    /// Errors caused by changes of region information
    #[error("Region error: {0}")]
    RegionError(Box<RegionError>),
    /// The request never reached the store, or its response was lost.
    #[error("Transport error: {message}")]
    Transport { message: String },
    /// Whether the transaction is committed or not is undetermined
    #[error("Whether the transaction is committed or not is undetermined: {0}")]
    UndeterminedError(Box<Error>),
    /// Retries ran out of backoff budget.
    #[error("Backoff failed: {0}")]
    Backoff(#[from] BackofferError),
    /// Wraps `crate::store::KeyError`
    #[error("{0:?}")]
    KeyError(Box<store::KeyError>),
    /// Can't join tokio tasks
    #[error("Failed to join tokio tasks")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("{}", message)]
    InternalError { message: String },
    #[error("{0}")]
    StringError(String),
}

impl From<RegionError> for Error {
    fn from(e: RegionError) -> Error {
        Error::RegionError(Box::new(e))
    }
}

impl From<store::KeyError> for Error {
    fn from(mut e: store::KeyError) -> Error {
        if let Some(conflict) = e.conflict.take() {
            return Error::WriteConflict(conflict.into());
        }
        if !e.retryable.is_empty() {
            return Error::Retryable {
                message: std::mem::take(&mut e.retryable),
            };
        }
        if let Some(exist) = e.already_exist.take() {
            return Error::KeyExists(KeyExistsError {
                key: exist.key.into(),
            });
        }
        if let Some(deadlock) = e.deadlock.take() {
            return Error::Deadlock(deadlock.into());
        }
        if !e.abort.is_empty() {
            return Error::TxnAborted {
                message: std::mem::take(&mut e.abort),
            };
        }
        if let Some(not_found) = e.txn_lock_not_found.take() {
            return Error::TxnLockNotFound {
                start_ts: not_found.start_ts,
                key: not_found.key.into(),
            };
        }

        Error::KeyError(Box::new(e))
    }
}

/// A result holding an [`Error`](enum@Error).
pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn is_write_conflict(&self) -> bool {
        match self {
            Error::WriteConflict(_) => true,
            Error::UndeterminedError(inner) => inner.is_write_conflict(),
            _ => false,
        }
    }

    pub fn is_deadlock(&self) -> bool {
        match self {
            Error::Deadlock(_) => true,
            Error::UndeterminedError(inner) => inner.is_deadlock(),
            _ => false,
        }
    }

    /// The deadlock payload, if this is a deadlock that may be retried.
    pub fn retryable_deadlock(&self) -> Option<&DeadlockError> {
        match self {
            Error::Deadlock(deadlock) if deadlock.is_retryable => Some(deadlock),
            _ => None,
        }
    }

    pub fn is_key_exists(&self) -> bool {
        match self {
            Error::KeyExists(_) => true,
            Error::UndeterminedError(inner) => inner.is_key_exists(),
            _ => false,
        }
    }

    pub fn is_undetermined(&self) -> bool {
        matches!(self, Error::UndeterminedError(_))
    }

    pub fn is_region_error(&self) -> bool {
        matches!(self, Error::RegionError(_))
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! internal_err {
    ($e:expr) => ({
        $crate::Error::InternalError {
            message: format!("[{}:{}]: {}", file!(), line!(),  $e)
        }
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::internal_err!(format!($f, $($arg),+))
    });
}
