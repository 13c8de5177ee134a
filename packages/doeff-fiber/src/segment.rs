//! Stack segments: the growable word regions fibers run on.
//!
//! A segment is addressed from its high end. The stack pointer is a
//! non-positive word offset from `high`; the used region is
//! `[high + stack_pointer, high)`. All word access goes through bounds-checked
//! accessors keyed by those offsets.

use crate::ids::{BlockId, DomainId};
use crate::value::Value;

/// Fixed context-save footprint reserved on every fiber on top of the
/// requested capacity.
pub const STACK_CONTEXT_WORDS: usize = 16;

/// Metadata words accounted to every segment: stack pointer, dirty owner,
/// three handlers and the parent link.
pub const STACK_HEADER_WORDS: usize = 6;

#[derive(Debug, Clone)]
pub struct StackSegment {
    sp: isize,
    dirty_owner: Option<DomainId>,
    pub handle_value: Value,
    pub handle_exception: Value,
    pub handle_effect: Value,
    parent: Value,
    words: Vec<Value>,
}

impl StackSegment {
    pub fn new(
        capacity: usize,
        handle_value: Value,
        handle_exception: Value,
        handle_effect: Value,
    ) -> Self {
        StackSegment {
            sp: 0,
            dirty_owner: None,
            handle_value,
            handle_exception,
            handle_effect,
            parent: Value::UNIT,
            words: vec![Value::NULL; capacity],
        }
    }

    /// Segment with zeroed handlers, as used for a domain's main stack.
    pub fn bare(capacity: usize) -> Self {
        Self::new(capacity, Value::int(0), Value::int(0), Value::int(0))
    }

    /// Words between base and high.
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Size of the managed block, metadata included.
    pub fn wosize(&self) -> usize {
        self.capacity() + STACK_HEADER_WORDS
    }

    pub fn stack_pointer(&self) -> isize {
        self.sp
    }

    pub fn set_stack_pointer(&mut self, sp: isize) {
        assert!(
            sp <= 0 && sp.unsigned_abs() <= self.capacity(),
            "stack pointer {sp} outside segment of {} words",
            self.capacity()
        );
        self.sp = sp;
    }

    pub fn used_words(&self) -> usize {
        self.sp.unsigned_abs()
    }

    pub fn headroom(&self) -> usize {
        self.capacity() - self.used_words()
    }

    /// Absolute word index of a high-relative offset, if it is inside the
    /// segment.
    pub fn index_of(&self, offset: isize) -> Option<usize> {
        if offset < 0 && offset.unsigned_abs() <= self.capacity() {
            Some(self.capacity() - offset.unsigned_abs())
        } else {
            None
        }
    }

    pub fn word(&self, offset: isize) -> Option<Value> {
        self.index_of(offset).map(|idx| self.words[idx])
    }

    pub fn word_mut(&mut self, offset: isize) -> Option<&mut Value> {
        let idx = self.index_of(offset)?;
        self.words.get_mut(idx)
    }

    pub fn set_word(&mut self, offset: isize, value: Value) {
        match self.word_mut(offset) {
            Some(slot) => *slot = value,
            None => panic!(
                "word offset {offset} outside segment of {} words",
                self.capacity()
            ),
        }
    }

    pub fn used_region(&self) -> &[Value] {
        &self.words[self.capacity() - self.used_words()..]
    }

    pub fn used_region_mut(&mut self) -> &mut [Value] {
        let start = self.capacity() - self.used_words();
        &mut self.words[start..]
    }

    /// All words by absolute index, base first.
    pub(crate) fn words_mut(&mut self) -> &mut [Value] {
        &mut self.words
    }

    /// Copy `src`'s used region to the same high-relative offset in `self`.
    pub fn copy_used_from(&mut self, src: &StackSegment) {
        let used = src.used_words();
        assert!(
            used <= self.capacity(),
            "cannot copy {used} used words into a segment of {} words",
            self.capacity()
        );
        let start = self.capacity() - used;
        self.words[start..].copy_from_slice(src.used_region());
    }

    /// Copy the stack pointer, handlers and parent link. The dirty owner is
    /// never copied.
    pub fn copy_metadata_from(&mut self, src: &StackSegment) {
        self.set_stack_pointer(src.sp);
        self.handle_value = src.handle_value;
        self.handle_exception = src.handle_exception;
        self.handle_effect = src.handle_effect;
        self.parent = src.parent;
    }

    /// Full copy of the allocated content. The copy starts clean.
    pub fn deep_copy(&self) -> StackSegment {
        StackSegment {
            dirty_owner: None,
            ..self.clone()
        }
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent.as_block()
    }

    pub fn set_parent(&mut self, parent: Option<BlockId>) {
        self.parent = Value::from(parent);
    }

    pub fn parent_value(&self) -> Value {
        self.parent
    }

    pub fn dirty_owner(&self) -> Option<DomainId> {
        self.dirty_owner
    }

    pub(crate) fn set_dirty_owner(&mut self, owner: Option<DomainId>) {
        self.dirty_owner = owner;
    }

    /// Handler and parent slots in scan order.
    pub fn metadata_slots_mut(&mut self) -> [&mut Value; 4] {
        [
            &mut self.handle_value,
            &mut self.handle_exception,
            &mut self.handle_effect,
            &mut self.parent,
        ]
    }

    /// Zero the control fields of a segment that has been replaced.
    pub fn retire(&mut self) {
        self.sp = 0;
        self.dirty_owner = None;
        self.handle_value = Value::int(0);
        self.handle_exception = Value::int(0);
        self.handle_effect = Value::int(0);
        self.parent = Value::UNIT;
    }

    pub fn is_retired(&self) -> bool {
        self.sp == 0
            && self.dirty_owner.is_none()
            && self.handle_value == Value::int(0)
            && self.handle_exception == Value::int(0)
            && self.handle_effect == Value::int(0)
            && self.parent.is_unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, used: usize) -> StackSegment {
        let mut seg = StackSegment::new(capacity, Value::int(1), Value::int(2), Value::int(3));
        seg.set_stack_pointer(-(used as isize));
        for (i, slot) in seg.used_region_mut().iter_mut().enumerate() {
            *slot = Value::int(i as i64);
        }
        seg
    }

    #[test]
    fn test_segment_creation() {
        let seg = StackSegment::bare(32);
        assert_eq!(seg.capacity(), 32);
        assert_eq!(seg.wosize(), 32 + STACK_HEADER_WORDS);
        assert_eq!(seg.stack_pointer(), 0);
        assert!(seg.parent().is_none());
        assert!(seg.dirty_owner().is_none());
        assert!(seg.used_region().is_empty());
    }

    #[test]
    fn test_word_offsets_are_high_relative() {
        let mut seg = StackSegment::bare(8);
        seg.set_word(-1, Value::int(10));
        seg.set_word(-8, Value::int(80));
        assert_eq!(seg.index_of(-1), Some(7));
        assert_eq!(seg.index_of(-8), Some(0));
        assert_eq!(seg.word(-1), Some(Value::int(10)));
        assert_eq!(seg.word(-8), Some(Value::int(80)));
        assert_eq!(seg.word(0), None);
        assert_eq!(seg.word(-9), None);
    }

    #[test]
    #[should_panic(expected = "outside segment")]
    fn test_set_word_out_of_bounds_panics() {
        let mut seg = StackSegment::bare(4);
        seg.set_word(-5, Value::int(1));
    }

    #[test]
    #[should_panic(expected = "stack pointer")]
    fn test_stack_pointer_out_of_bounds_panics() {
        let mut seg = StackSegment::bare(4);
        seg.set_stack_pointer(-5);
    }

    #[test]
    fn test_copy_used_preserves_high_relative_layout() {
        let src = filled(8, 5);
        let mut dst = StackSegment::bare(16);
        dst.copy_used_from(&src);
        dst.copy_metadata_from(&src);

        assert_eq!(dst.stack_pointer(), -5);
        assert_eq!(dst.used_region(), src.used_region());
        for offset in -5..0 {
            assert_eq!(dst.word(offset), src.word(offset));
        }
        assert_eq!(dst.handle_effect, Value::int(3));
    }

    #[test]
    fn test_deep_copy_starts_clean() {
        let mut seg = filled(8, 3);
        seg.set_dirty_owner(Some(DomainId::from_raw(9)));
        seg.set_parent(Some(BlockId::from_index(4)));

        let copy = seg.deep_copy();
        assert!(copy.dirty_owner().is_none());
        assert_eq!(copy.parent(), Some(BlockId::from_index(4)));
        assert_eq!(copy.used_region(), seg.used_region());
    }

    #[test]
    fn test_retire_zeroes_control_fields() {
        let mut seg = filled(8, 3);
        seg.set_dirty_owner(Some(DomainId::from_raw(1)));
        seg.set_parent(Some(BlockId::from_index(2)));
        assert!(!seg.is_retired());

        seg.retire();
        assert!(seg.is_retired());
        assert_eq!(seg.stack_pointer(), 0);
        assert!(seg.parent().is_none());
    }
}
