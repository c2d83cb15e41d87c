// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;

use super::key_flags::FlagsOp;
use super::key_flags::KeyFlags;
use crate::Key;
use crate::Value;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct BufferEntry {
    /// `None` when only flags were recorded for the key. An empty value is a deletion.
    value: Option<Value>,
    flags: KeyFlags,
}

/// The local write overlay of a transaction, ordered by key.
#[derive(Clone, Debug, Default)]
pub(crate) struct MemBuffer {
    entries: BTreeMap<Key, BufferEntry>,
}

/// The buffered state of a key as seen by reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BufferedValue {
    /// The key is not written by this transaction; read through to the snapshot.
    NotBuffered,
    Deleted,
    Value(Value),
}

impl MemBuffer {
    pub(crate) fn get(&self, key: &Key) -> BufferedValue {
        match self.entries.get(key).and_then(|e| e.value.as_ref()) {
            None => BufferedValue::NotBuffered,
            Some(v) if v.is_empty() => BufferedValue::Deleted,
            Some(v) => BufferedValue::Value(v.clone()),
        }
    }

    pub(crate) fn has_write(&self, key: &Key) -> bool {
        self.entries.get(key).is_some_and(|e| e.value.is_some())
    }

    pub(crate) fn put(&mut self, key: Key, value: Value) {
        self.entries.entry(key).or_default().value = Some(value);
    }

    /// Write `value` and remember the key is expected not to exist yet.
    pub(crate) fn insert(&mut self, key: Key, value: Value) {
        let entry = self.entries.entry(key).or_default();
        entry.value = Some(value);
        entry.flags = entry.flags.apply(FlagsOp::SetPresumeKeyNotExists);
    }

    pub(crate) fn delete(&mut self, key: Key) {
        self.entries.entry(key).or_default().value = Some(Value::new());
    }

    pub(crate) fn flags(&self, key: &Key) -> KeyFlags {
        self.entries.get(key).map(|e| e.flags).unwrap_or_default()
    }

    pub(crate) fn update_flags(&mut self, key: Key, op: FlagsOp) {
        let entry = self.entries.entry(key).or_default();
        entry.flags = entry.flags.apply(op);
    }

    /// Every buffered key in order, with its value (if written) and flags.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Key, Option<&Value>, KeyFlags)> {
        self.entries
            .iter()
            .map(|(k, e)| (k, e.value.as_ref(), e.flags))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_distinguish_deleted_from_missing() {
        let mut buffer = MemBuffer::default();
        buffer.put(Key::from("a"), b"1".to_vec());
        buffer.delete(Key::from("b"));
        buffer.update_flags(Key::from("c"), FlagsOp::SetLocked { value_exists: true });

        assert_eq!(buffer.get(&Key::from("a")), BufferedValue::Value(b"1".to_vec()));
        assert_eq!(buffer.get(&Key::from("b")), BufferedValue::Deleted);
        assert_eq!(buffer.get(&Key::from("c")), BufferedValue::NotBuffered);
        assert!(!buffer.has_write(&Key::from("c")));
        assert!(buffer.flags(&Key::from("c")).has_locked());

        let keys: Vec<_> = buffer.iter().map(|(k, _, _)| k.clone()).collect();
        assert_eq!(keys, vec![Key::from("a"), Key::from("b"), Key::from("c")]);
    }

    #[test]
    fn insert_marks_presume_not_exists() {
        let mut buffer = MemBuffer::default();
        buffer.insert(Key::from("k"), b"v".to_vec());
        assert!(buffer.flags(&Key::from("k")).has_presume_key_not_exists());
        buffer.put(Key::from("k"), b"w".to_vec());
        assert!(buffer.flags(&Key::from("k")).has_presume_key_not_exists());
    }
}
