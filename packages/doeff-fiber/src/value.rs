//! Machine words stored in stack segments and heap blocks.
//!
//! A word is one of three things:
//! - an immediate integer (low bit set),
//! - a reference to a heap block (reserved high tag, word aligned),
//! - a raw control word such as a saved return address or a stack offset.
//!
//! The collector only ever relocates block references; raw control words are
//! copied verbatim when a stack grows or is cloned.

use std::fmt;

use crate::ids::BlockId;

const BLOCK_TAG: u64 = 0x0001_0000_0000_0000;
const BLOCK_MASK: u64 = 0xFFFF_0000_0000_0007;

/// A single machine word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Value(u64);

impl Value {
    /// The all-zero word. Not an integer and not a reference.
    pub const NULL: Value = Value(0);

    /// Immediate `0`. Used as `none` in parent links.
    pub const UNIT: Value = Value::int(0);

    pub const fn int(n: i64) -> Self {
        Value(((n as u64) << 1) | 1)
    }

    pub fn block(id: BlockId) -> Self {
        Value(BLOCK_TAG | ((id.0 as u64) << 3))
    }

    pub const fn from_raw(bits: u64) -> Self {
        Value(bits)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_int(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn as_int(self) -> Option<i64> {
        if self.is_int() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    pub fn is_block(self) -> bool {
        self.0 & BLOCK_MASK == BLOCK_TAG
    }

    pub fn as_block(self) -> Option<BlockId> {
        if self.is_block() {
            Some(BlockId(((self.0 & !BLOCK_TAG) >> 3) as u32))
        } else {
            None
        }
    }

    pub fn is_unit(self) -> bool {
        self == Value::UNIT
    }
}

impl From<BlockId> for Value {
    fn from(id: BlockId) -> Self {
        Value::block(id)
    }
}

impl From<Option<BlockId>> for Value {
    fn from(id: Option<BlockId>) -> Self {
        id.map(Value::block).unwrap_or(Value::UNIT)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.as_int() {
            write!(f, "Int({n})")
        } else if let Some(id) = self.as_block() {
            write!(f, "Block({})", id.0)
        } else {
            write!(f, "Raw({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_encoding() {
        assert_eq!(Value::int(42).as_int(), Some(42));
        assert_eq!(Value::int(-7).as_int(), Some(-7));
        assert!(Value::UNIT.is_int());
        assert!(Value::UNIT.is_unit());
        assert!(!Value::int(42).is_block());
    }

    #[test]
    fn test_block_encoding() {
        let v = Value::block(BlockId::from_index(1234));
        assert!(v.is_block());
        assert!(!v.is_int());
        assert_eq!(v.as_block(), Some(BlockId::from_index(1234)));
    }

    #[test]
    fn test_raw_control_words_are_neither() {
        let retaddr = Value::from_raw(0x4000_1230);
        assert!(!retaddr.is_int());
        assert!(!retaddr.is_block());
        assert!(!Value::NULL.is_block());
        assert_eq!(format!("{:?}", retaddr), "Raw(0x40001230)");
    }

    #[test]
    fn test_option_block_conversion() {
        assert_eq!(Value::from(None::<BlockId>), Value::UNIT);
        let id = BlockId::from_index(3);
        assert_eq!(Value::from(Some(id)).as_block(), Some(id));
    }
}
