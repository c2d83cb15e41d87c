// Copyright 2026 TiKV Project Authors. Licensed under Apache-2.0.

//! The committer's columnar mutation set, and its partition into per-region batches.

use crate::region::RegionRouter;
use crate::region::RegionVerId;
use crate::store::Op;
use crate::Key;
use crate::Result;
use crate::Value;

/// Mutations stored as parallel columns, indexed consistently.
///
/// The committer keeps the set sorted by key; grouping by region relies on it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationSet {
    ops: Vec<Op>,
    keys: Vec<Key>,
    values: Vec<Value>,
    is_pessimistic_lock: Vec<bool>,
}

impl MutationSet {
    pub fn new() -> MutationSet {
        MutationSet::default()
    }

    pub fn with_capacity(capacity: usize) -> MutationSet {
        MutationSet {
            ops: Vec::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            is_pessimistic_lock: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, op: Op, key: Key, value: Value, is_pessimistic_lock: bool) {
        self.ops.push(op);
        self.keys.push(key);
        self.values.push(value);
        self.is_pessimistic_lock.push(is_pessimistic_lock);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn op(&self, i: usize) -> Op {
        self.ops[i]
    }

    pub fn key(&self, i: usize) -> &Key {
        &self.keys[i]
    }

    pub fn value(&self, i: usize) -> &Value {
        &self.values[i]
    }

    pub fn is_pessimistic_lock(&self, i: usize) -> bool {
        self.is_pessimistic_lock[i]
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Total bytes of keys and values.
    pub fn size(&self) -> usize {
        self.keys
            .iter()
            .zip(&self.values)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    /// A copy of the mutations in `[from, to)`.
    pub fn sub_range(&self, from: usize, to: usize) -> MutationSet {
        MutationSet {
            ops: self.ops[from..to].to_vec(),
            keys: self.keys[from..to].to_vec(),
            values: self.values[from..to].to_vec(),
            is_pessimistic_lock: self.is_pessimistic_lock[from..to].to_vec(),
        }
    }

    /// Append `other` and restore key order.
    pub fn merge(&mut self, other: MutationSet) {
        if other.is_empty() {
            return;
        }
        let sorted = self.keys.last().map_or(true, |last| last < &other.keys[0])
            && other.keys.windows(2).all(|w| w[0] <= w[1]);
        self.ops.extend(other.ops);
        self.keys.extend(other.keys);
        self.values.extend(other.values);
        self.is_pessimistic_lock.extend(other.is_pessimistic_lock);
        if !sorted {
            self.sort();
        }
    }

    fn sort(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.keys[a].cmp(&self.keys[b]));
        let mut sorted = MutationSet::with_capacity(self.len());
        for i in order {
            sorted.push(
                self.ops[i],
                std::mem::take(&mut self.keys[i]),
                std::mem::take(&mut self.values[i]),
                self.is_pessimistic_lock[i],
            );
        }
        *self = sorted;
    }

    /// A copy without the mutations of kind `op`.
    pub fn without_op(&self, op: Op) -> MutationSet {
        let mut res = MutationSet::with_capacity(self.len());
        for i in 0..self.len() {
            if self.ops[i] != op {
                res.push(
                    self.ops[i],
                    self.keys[i].clone(),
                    self.values[i].clone(),
                    self.is_pessimistic_lock[i],
                );
            }
        }
        res
    }

    /// Partition the (sorted) set by the regions currently owning its keys, preserving order.
    pub async fn group_by_region(&self, router: &dyn RegionRouter) -> Result<Vec<GroupedMutations>> {
        let groups = router.group_keys_by_region(&self.keys).await?;
        let mut start = 0;
        let mut res = Vec::with_capacity(groups.len());
        for (region, keys) in groups {
            let end = start + keys.len();
            res.push(GroupedMutations {
                region,
                mutations: self.sub_range(start, end),
            });
            start = end;
        }
        Ok(res)
    }
}

/// The mutations owned by one region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupedMutations {
    pub region: RegionVerId,
    pub mutations: MutationSet,
}

/// A size-bounded slice of one region's mutations, the unit of a single RPC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMutations {
    pub region: RegionVerId,
    pub mutations: MutationSet,
    pub is_primary: bool,
}

/// The size of an entry as counted against the batch limit of prewrite.
pub fn key_value_size(key: &Key, value: &Value) -> usize {
    key.len() + value.len()
}

/// The size of an entry for actions that send keys only.
pub fn key_size(key: &Key, _value: &Value) -> usize {
    key.len()
}

/// Collects batches across region groups and remembers which one holds the primary key.
pub(crate) struct BatchBuilder<'a> {
    primary_key: &'a Key,
    primary_idx: Option<usize>,
    batches: Vec<BatchMutations>,
}

impl<'a> BatchBuilder<'a> {
    pub(crate) fn new(primary_key: &'a Key) -> Self {
        BatchBuilder {
            primary_key,
            primary_idx: None,
            batches: Vec::new(),
        }
    }

    /// Cut `group` into batches whose accumulated `size_fn` stays within `limit`.
    ///
    /// An entry larger than `limit` gets a batch of its own.
    pub(crate) fn append_by_size(
        &mut self,
        group: GroupedMutations,
        size_fn: fn(&Key, &Value) -> usize,
        limit: usize,
    ) {
        let mutations = &group.mutations;
        let mut start = 0;
        let mut size = 0;
        for i in 0..mutations.len() {
            let entry_size = size_fn(mutations.key(i), mutations.value(i));
            if i > start && size + entry_size > limit {
                self.push(group.region, mutations.sub_range(start, i));
                start = i;
                size = 0;
            }
            size += entry_size;
            if self.primary_idx.is_none() && mutations.key(i) == self.primary_key {
                self.primary_idx = Some(self.batches.len());
            }
        }
        if start < mutations.len() {
            self.push(group.region, mutations.sub_range(start, mutations.len()));
        }
    }

    fn push(&mut self, region: RegionVerId, mutations: MutationSet) {
        self.batches.push(BatchMutations {
            region,
            mutations,
            is_primary: false,
        });
    }

    /// The batches, with the primary batch (if any) moved to the front.
    pub(crate) fn finish(mut self) -> Vec<BatchMutations> {
        if let Some(idx) = self.primary_idx {
            let mut primary = self.batches.remove(idx);
            primary.is_primary = true;
            self.batches.insert(0, primary);
        }
        self.batches
    }
}

/// Split one region's mutations into batches, moving the one holding `primary_key` to the front.
pub fn split_into_batches(
    group: GroupedMutations,
    primary_key: &Key,
    size_fn: fn(&Key, &Value) -> usize,
    limit: usize,
) -> Vec<BatchMutations> {
    let mut builder = BatchBuilder::new(primary_key);
    builder.append_by_size(group, size_fn, limit);
    builder.finish()
}
