// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.
use std::fmt;

mod key;

pub use key::Key;

/// The value part of a key/value pair. An empty value in the write buffer marks a deletion.
pub type Value = Vec<u8>;

/// The hash the store's deadlock detector reports for a key.
pub fn key_hash(key: &[u8]) -> u64 {
    u64::from(crc32fast::hash(key))
}

pub(crate) struct HexRepr<'a>(pub &'a [u8]);

impl fmt::Display for HexRepr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
