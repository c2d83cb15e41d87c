//! Per-key transaction metadata (flags).
//!
//! Flags live next to the value in the transaction's write buffer. They decide which mutation a
//! buffered key turns into at commit time and how pessimistic lock bookkeeping treats the key.

/// Per-key metadata associated with a transaction key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeyFlags(u16);

impl KeyFlags {
    const PRESUME_KEY_NOT_EXISTS: u16 = 1 << 0;
    const PREWRITE_ONLY: u16 = 1 << 1;
    const LOCKED: u16 = 1 << 2;
    const LOCKED_VALUE_EXISTS: u16 = 1 << 3;

    /// Returns whether the key is presumed to not exist.
    pub fn has_presume_key_not_exists(self) -> bool {
        self.0 & Self::PRESUME_KEY_NOT_EXISTS != 0
    }

    /// Returns whether the key is prewrite-only (excluded from the commit phase).
    pub fn has_prewrite_only(self) -> bool {
        self.0 & Self::PREWRITE_ONLY != 0
    }

    /// Returns whether the key holds a pessimistic lock of this transaction.
    pub fn has_locked(self) -> bool {
        self.0 & Self::LOCKED != 0
    }

    /// Returns whether the value was seen to exist when the key was locked.
    pub fn has_locked_value_exists(self) -> bool {
        self.0 & Self::LOCKED_VALUE_EXISTS != 0
    }

    /// Apply a flag operation.
    #[must_use]
    pub fn apply(mut self, op: FlagsOp) -> Self {
        match op {
            FlagsOp::SetPresumeKeyNotExists => self.0 |= Self::PRESUME_KEY_NOT_EXISTS,
            FlagsOp::DelPresumeKeyNotExists => self.0 &= !Self::PRESUME_KEY_NOT_EXISTS,
            FlagsOp::SetPrewriteOnly => self.0 |= Self::PREWRITE_ONLY,
            FlagsOp::SetLocked { value_exists } => {
                self.0 |= Self::LOCKED;
                if value_exists {
                    self.0 |= Self::LOCKED_VALUE_EXISTS;
                } else {
                    self.0 &= !Self::LOCKED_VALUE_EXISTS;
                }
            }
        }
        self
    }
}

/// An operation that mutates [`KeyFlags`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagsOp {
    SetPresumeKeyNotExists,
    DelPresumeKeyNotExists,
    SetPrewriteOnly,
    SetLocked { value_exists: bool },
}
