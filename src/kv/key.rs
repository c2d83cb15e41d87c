// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::borrow::Borrow;
use std::fmt;

#[allow(unused_imports)]
#[cfg(test)]
use proptest::arbitrary::any_with;
#[allow(unused_imports)]
#[cfg(test)]
use proptest::collection::size_range;
#[cfg(test)]
use proptest_derive::Arbitrary;

use super::HexRepr;

const _PROPTEST_KEY_MAX: usize = 64;

/// The key part of a key/value pair.
///
/// Keys are an ordered sequence of bytes. The region router partitions the key space by
/// comparing keys byte-wise, and the committer sorts mutations by key before grouping them.
///
/// # Examples
/// ```rust
/// use tikv_txn::Key;
///
/// let from_str = Key::from("TiKV");
/// let from_vec = Key::from(b"TiKV".to_vec());
/// assert_eq!(from_str, from_vec);
/// assert_eq!(Into::<Vec<u8>>::into(from_str), b"TiKV".to_vec());
/// ```
#[derive(Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(transparent)]
pub struct Key(
    #[cfg_attr(
        test,
        proptest(strategy = "any_with::<Vec<u8>>((size_range(1.._PROPTEST_KEY_MAX), ()))")
    )]
    pub(crate) Vec<u8>,
);

impl Key {
    /// The empty key.
    pub const EMPTY: Self = Key(Vec::new());

    /// Return whether the key is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key(v)
    }
}

impl From<String> for Key {
    fn from(v: String) -> Key {
        Key(v.into_bytes())
    }
}

impl From<&'static str> for Key {
    fn from(v: &'static str) -> Key {
        Key(v.as_bytes().to_vec())
    }
}

impl From<Key> for Vec<u8> {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl<'a> From<&'a Key> for &'a [u8] {
    fn from(key: &'a Key) -> Self {
        &key.0
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Key {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({})", HexRepr(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_bytewise() {
        let mut keys = vec![Key::from("b"), Key::from("ab"), Key::from("a"), Key::EMPTY];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::EMPTY, Key::from("a"), Key::from("ab"), Key::from("b")]
        );
        assert_eq!(format!("{:?}", Key::from("a")), "Key(61)");
    }
}
