// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Detached tasks spawned on behalf of a transaction.
///
/// Nothing on the commit path waits for these. They are kept so tests (and callers shutting
/// down) can observe that asynchronous secondary commits, rollbacks and heartbeats have finished.
#[derive(Clone, Default)]
pub(crate) struct BackgroundTasks {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
    pub(crate) fn push(&self, handle: JoinHandle<()>) {
        match self.handles.lock() {
            Ok(mut handles) => {
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            // A poisoned set only loses the ability to wait; the task still runs.
            Err(_) => drop(handle),
        }
    }

    fn take(&self) -> Vec<JoinHandle<()>> {
        match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        match self.handles.lock() {
            Ok(handles) => handles.iter().filter(|h| !h.is_finished()).count(),
            Err(_) => 0,
        }
    }

    /// Wait for every task registered so far, including those registered while waiting.
    pub(crate) async fn wait(&self) {
        loop {
            let handles = self.take();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}
