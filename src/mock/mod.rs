// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! Various mock versions of the various clients and other objects.
//!
//! The goal is to be able to test functionality independently of the rest of the system, in
//! particular without requiring a TiKV or PD server, or RPC layer.

mod deadlock_detector;
mod oracle;
mod router;
mod store;

use std::sync::Arc;

pub use self::oracle::MockOracle;
pub use self::router::MockCluster;
pub use self::router::MockRouter;
pub use self::store::MockStore;
pub use self::store::RpcRecord;
use crate::transaction::Client;

/// A cluster, a store on top of it, a caching router and an oracle.
pub struct MockEnv {
    pub cluster: Arc<MockCluster>,
    pub store: Arc<MockStore>,
    pub router: Arc<MockRouter>,
    pub oracle: Arc<MockOracle>,
}

impl MockEnv {
    pub fn new(cluster: Arc<MockCluster>, oracle: MockOracle) -> MockEnv {
        MockEnv {
            store: Arc::new(MockStore::new(cluster.clone())),
            router: Arc::new(MockRouter::new(cluster.clone())),
            oracle: Arc::new(oracle),
            cluster,
        }
    }

    /// A single region and a wall clock oracle.
    pub fn single_region() -> MockEnv {
        MockEnv::new(MockCluster::new(), MockOracle::new())
    }

    /// A client with default configuration talking to this environment.
    pub fn client(&self) -> Client {
        Client::new(
            self.store.clone(),
            self.router.clone(),
            self.oracle.clone(),
            self.store.clone(),
            self.store.clone(),
        )
    }
}
