// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use log::debug;
use log::info;

use super::committer::Services;
use super::hooks::FaultHooks;
use super::hooks::NoopHooks;
use super::lock_resolver::LockResolver;
use super::schema::SchemaAmender;
use super::schema::SchemaChecker;
use super::snapshot::Snapshot;
use super::transaction::Transaction;
use super::transaction::TransactionOptions;
use crate::backoffer::Backoffer;
use crate::config::TxnConfig;
use crate::region::RegionRouter;
use crate::store::KvClient;
use crate::timestamp::get_timestamp_with_retry;
use crate::timestamp::TimestampOracle;
use crate::Result;

/// The transactional client, used to begin [`Transaction`]s.
///
/// The client does not own a connection. It is built from the collaborators a transaction talks
/// to: the store RPC client, the region router, the timestamp oracle, the lock resolver and the
/// snapshot reader. Cloning a client is cheap; clones share those collaborators.
///
/// # Examples
///
/// ```rust,no_run
/// # use tikv_txn::{Result, TransactionClient};
/// # async fn example(client: TransactionClient) -> Result<()> {
/// let mut txn = client.begin_pessimistic().await?;
/// txn.put("key".to_owned(), "value".to_owned()).await?;
/// txn.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    services: Services,
}

impl Client {
    /// Create a client with the default [`TxnConfig`] and no schema hooks.
    pub fn new(
        kv: Arc<dyn KvClient>,
        router: Arc<dyn RegionRouter>,
        oracle: Arc<dyn TimestampOracle>,
        resolver: Arc<dyn LockResolver>,
        snapshot: Arc<dyn Snapshot>,
    ) -> Client {
        Client {
            services: Services {
                kv,
                router,
                oracle,
                resolver,
                snapshot,
                schema_checker: None,
                schema_amender: None,
                hooks: Arc::new(NoopHooks),
                config: Arc::new(TxnConfig::default()),
            },
        }
    }

    /// Set the configuration of transactions begun by the returned client.
    #[must_use]
    pub fn with_config(&self, config: TxnConfig) -> Self {
        let mut cloned = self.clone();
        cloned.services.config = Arc::new(config);
        cloned
    }

    /// Check the schema version of transactions before they commit.
    ///
    /// Only transactions with a [schema version](Transaction::set_schema_version) are checked.
    #[must_use]
    pub fn with_schema_checker(&self, checker: Arc<dyn SchemaChecker>) -> Self {
        let mut cloned = self.clone();
        cloned.services.schema_checker = Some(checker);
        cloned
    }

    /// Let pessimistic transactions amend their mutations when the schema changed in an
    /// amendable way.
    #[must_use]
    pub fn with_schema_amender(&self, amender: Arc<dyn SchemaAmender>) -> Self {
        let mut cloned = self.clone();
        cloned.services.schema_amender = Some(amender);
        cloned
    }

    #[must_use]
    pub fn with_fault_hooks(&self, hooks: Arc<dyn FaultHooks>) -> Self {
        let mut cloned = self.clone();
        cloned.services.hooks = hooks;
        cloned
    }

    pub fn config(&self) -> &TxnConfig {
        &self.services.config
    }

    /// Begin a new optimistic transaction.
    ///
    /// Once committed, the transaction checks for write conflicts during prewrite. Writes are
    /// buffered until then and no locks are taken.
    pub async fn begin_optimistic(&self) -> Result<Transaction> {
        debug!("creating new optimistic transaction");
        self.begin_with_options(TransactionOptions::new_optimistic())
            .await
    }

    /// Begin a new pessimistic transaction.
    ///
    /// Every write locks its key on the store before it is buffered.
    pub async fn begin_pessimistic(&self) -> Result<Transaction> {
        debug!("creating new pessimistic transaction");
        self.begin_with_options(TransactionOptions::new_pessimistic())
            .await
    }

    /// Begin a new transaction with the given options.
    pub async fn begin_with_options(&self, options: TransactionOptions) -> Result<Transaction> {
        let start_ts = self.current_timestamp().await?;
        Ok(self.begin_with_start_timestamp(start_ts, options))
    }

    /// Begin a transaction reading at `start_ts`.
    ///
    /// The timestamp must have been allocated by the oracle the client uses.
    pub fn begin_with_start_timestamp(
        &self,
        start_ts: u64,
        options: TransactionOptions,
    ) -> Transaction {
        info!(
            "begin transaction, start_ts: {}, pessimistic: {}",
            start_ts,
            options.is_pessimistic()
        );
        Transaction::new(start_ts, self.services.clone(), options)
    }

    /// Retrieve the current timestamp from the oracle, retrying transient failures.
    pub async fn current_timestamp(&self) -> Result<u64> {
        let mut bo = Backoffer::new(self.services.config.backoff.tso_ms);
        get_timestamp_with_retry(self.services.oracle.as_ref(), &mut bo).await
    }
}
