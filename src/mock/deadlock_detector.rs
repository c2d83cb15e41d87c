// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Mutex;

/// The wait-for graph of the mock store's pessimistic lock waiters.
#[derive(Debug, Default)]
pub(crate) struct DeadlockDetector {
    wait_for: Mutex<HashMap<u64, Vec<WaitEdge>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitEdge {
    txn: u64,
    key_hash: u64,
}

impl DeadlockDetector {
    /// Record that `txn` waits for `wait_for_txn` on `key_hash`.
    ///
    /// If the edge would close a cycle it is not recorded, and the hash of the key the cycle
    /// runs back through is returned instead.
    pub(crate) fn detect(&self, txn: u64, wait_for_txn: u64, key_hash: u64) -> Result<(), u64> {
        let mut graph = self.wait_for.lock().unwrap();
        if let Some(hash) = find_cycle(&graph, txn, wait_for_txn) {
            return Err(hash);
        }
        let edge = WaitEdge {
            txn: wait_for_txn,
            key_hash,
        };
        let edges = graph.entry(txn).or_default();
        if !edges.contains(&edge) {
            edges.push(edge);
        }
        Ok(())
    }

    /// Forget everything `txn` waits for.
    pub(crate) fn clean_up(&self, txn: u64) {
        self.wait_for.lock().unwrap().remove(&txn);
    }

    pub(crate) fn clean_up_wait_for(&self, txn: u64, wait_for_txn: u64, key_hash: u64) {
        let mut graph = self.wait_for.lock().unwrap();
        if let Some(edges) = graph.get_mut(&txn) {
            edges.retain(|e| {
                *e != WaitEdge {
                    txn: wait_for_txn,
                    key_hash,
                }
            });
            if edges.is_empty() {
                graph.remove(&txn);
            }
        }
    }
}

fn find_cycle(graph: &HashMap<u64, Vec<WaitEdge>>, source: u64, from: u64) -> Option<u64> {
    for edge in graph.get(&from)? {
        if edge.txn == source {
            return Some(edge.key_hash);
        }
        if let Some(hash) = find_cycle(graph, source, edge.txn) {
            return Some(hash);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn two_txns_locking_in_opposite_order() {
        let detector = DeadlockDetector::default();
        // 10 holds a and waits for b held by 20.
        detector.detect(10, 20, 0xb).unwrap();
        // 20 now waits for a; the cycle runs back through b.
        assert_eq!(detector.detect(20, 10, 0xa), Err(0xb));

        detector.clean_up_wait_for(10, 20, 0xb);
        detector.detect(20, 10, 0xa).unwrap();
        assert_eq!(detector.detect(10, 20, 0xb), Err(0xa));

        detector.clean_up(20);
        detector.detect(10, 20, 0xb).unwrap();
    }

    #[test]
    fn longer_cycles_are_found() {
        let detector = DeadlockDetector::default();
        detector.detect(1, 2, 100).unwrap();
        detector.detect(2, 3, 200).unwrap();
        assert_eq!(detector.detect(3, 1, 300), Err(200));
        // Duplicate edges are not recorded twice.
        detector.detect(1, 2, 100).unwrap();
        detector.clean_up_wait_for(1, 2, 100);
        detector.detect(3, 1, 300).unwrap();
    }
}
