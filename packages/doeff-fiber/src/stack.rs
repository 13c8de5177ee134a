//! Stack manager: allocating, growing and switching the stacks a domain runs
//! on.
//!
//! The domain's [`StackRegisters`] hold the live stack pointer of the current
//! segment. [`Domain::save_stack`] writes it back into the segment (and marks
//! an old segment dirty, since stack writes have no barrier);
//! [`Domain::load_stack`] installs a segment into the registers.

use crate::dirty::dirty_stack;
use crate::domain::{Domain, StackRegisters};
use crate::error::{RaiseResult, RuntimeError};
use crate::fiber_debug_log;
use crate::frame_table::{FIBER_EXN_HANDLER, FIBER_VAL_HANDLER, WORD_BYTES};
use crate::heap::{AllocPath, Heap, Object};
use crate::ids::BlockId;
use crate::scan::StackLayout;
use crate::segment::{StackSegment, STACK_CONTEXT_WORDS};
use crate::value::Value;

/// Word pushed under every bytecode fiber, read by the interpreter as the
/// bottom trap frame.
pub const TRAP_SENTINEL: Value = Value::int(1);

fn kbytes(words: usize) -> usize {
    words * WORD_BYTES / 1024
}

impl Domain {
    // === Allocation ===

    /// Allocate a bootstrap root segment. Never triggers a collection.
    pub fn alloc_main_stack(
        &self,
        heap: &mut Heap,
        init_words: usize,
    ) -> Result<BlockId, RuntimeError> {
        let stack = heap.alloc(
            Object::Stack(StackSegment::bare(init_words)),
            AllocPath::NoTrigger,
        )?;
        log::debug!("Allocate main stack {stack} of {init_words} words");
        Ok(stack)
    }

    pub fn init_main_stack(&mut self, heap: &mut Heap) -> Result<BlockId, RuntimeError> {
        let stack = self.alloc_main_stack(heap, self.config().init_stack_words)?;
        self.load_stack(heap, stack);
        Ok(stack)
    }

    /// Allocate a fiber with the configured initial size.
    pub fn alloc_stack(
        &mut self,
        heap: &mut Heap,
        handle_value: Value,
        handle_exception: Value,
        handle_effect: Value,
    ) -> RaiseResult<BlockId> {
        let initial = self.config().fiber_stack_words;
        self.alloc_stack_with(heap, initial, handle_value, handle_exception, handle_effect)
    }

    /// Allocate a fiber with `initial_words` of headroom on top of the fixed
    /// context footprint. The fiber has no parent and starts clean.
    pub fn alloc_stack_with(
        &mut self,
        heap: &mut Heap,
        initial_words: usize,
        handle_value: Value,
        handle_exception: Value,
        handle_effect: Value,
    ) -> RaiseResult<BlockId> {
        let capacity = STACK_CONTEXT_WORDS + initial_words;
        let mut seg = StackSegment::new(capacity, handle_value, handle_exception, handle_effect);
        match self.layout() {
            StackLayout::Bytecode => {
                seg.set_word(-1, TRAP_SENTINEL);
                seg.set_stack_pointer(-1);
            }
            StackLayout::Native(_) => {
                seg.set_word(-1, Value::from_raw(FIBER_EXN_HANDLER));
                seg.set_word(-2, Value::NULL);
                seg.set_word(-3, Value::from_raw(FIBER_VAL_HANDLER));
                // context header: no saved registers, exception link two
                // words above
                seg.set_word(-4, Value::int(-2));
                seg.set_word(-5, Value::NULL);
                seg.set_stack_pointer(-5);
            }
        }
        match heap.alloc(Object::Stack(seg), AllocPath::Normal) {
            Ok(stack) => {
                log::debug!("Allocate stack {stack} of {capacity} words");
                Ok(stack)
            }
            Err(_) => Err(self.raise_out_of_memory(heap)),
        }
    }

    // === Growth ===

    /// Replace the current stack by one at least twice as large that holds
    /// the used region plus `required` words.
    ///
    /// `saved` is registered as local roots while the new segment is
    /// allocated and written back afterwards. On error the old stack is
    /// still installed and unchanged.
    pub fn try_realloc_stack(
        &mut self,
        heap: &mut Heap,
        required: usize,
        saved: &mut [Value],
    ) -> Result<BlockId, RuntimeError> {
        self.assert_not_blocking("realloc_stack");
        let old = self.save_stack(heap);
        let (used, mut size) = {
            let seg = heap.stack_ref(old);
            (seg.used_words(), seg.capacity())
        };
        loop {
            if size >= self.max_stack_words {
                return Err(RuntimeError::stack_overflow(
                    used + required,
                    self.max_stack_words,
                ));
            }
            size = (size * 2).max(1);
            if size >= used + required {
                break;
            }
        }
        log::debug!("Growing stack to {}k bytes", kbytes(size));

        let mut fresh = StackSegment::bare(size);
        let was_dirty = {
            let seg = heap.stack_ref(old);
            fresh.copy_used_from(seg);
            fresh.copy_metadata_from(seg);
            seg.dirty_owner()
        };

        let marker = self.enter_local_frame(saved.to_vec());
        let allocated = heap.alloc(Object::Stack(fresh), AllocPath::Normal);
        saved.copy_from_slice(&self.leave_local_frame(marker));
        let new = allocated?;

        if let Some(owner) = was_dirty {
            assert_eq!(
                owner, self.id,
                "growing {old} which is dirty for another domain"
            );
            let id = self.id;
            dirty_stack(heap, id, self.remembered_mut(), new);
        }
        self.load_stack(heap, new);
        heap.stack_ref_mut(old).retire();
        Ok(new)
    }

    pub fn realloc_stack(
        &mut self,
        heap: &mut Heap,
        required: usize,
        saved: &mut [Value],
    ) -> RaiseResult<BlockId> {
        self.try_realloc_stack(heap, required, saved)
            .map_err(|err| self.raise_error(heap, err))
    }

    /// Grow only if fewer than `required` words are free.
    pub fn ensure_stack_capacity(&mut self, heap: &mut Heap, required: usize) -> RaiseResult<()> {
        if self.headroom() < required {
            self.realloc_stack(heap, required, &mut [])?;
        }
        Ok(())
    }

    /// Compiled-code check: double the stack when less than twice the
    /// threshold is left. `gc_regs` are the caller's live registers.
    pub fn maybe_expand_stack(&mut self, heap: &mut Heap, gc_regs: &mut [Value]) -> RaiseResult<()> {
        let threshold = self.config().stack_threshold_words;
        if self.headroom() < 2 * threshold {
            self.realloc_stack(heap, 0, gc_regs)?;
        }
        Ok(())
    }

    pub fn max_stack_words(&self) -> usize {
        self.max_stack_words
    }

    /// Set the growth limit. Never below what is in use plus the threshold.
    pub fn change_max_stack_size(&mut self, new_max: usize) {
        let floor = self.used_words() + self.config().stack_threshold_words;
        let new_max = new_max.max(floor);
        if new_max != self.max_stack_words {
            log::debug!("Changing stack limit to {}k bytes", kbytes(new_max));
        }
        self.max_stack_words = new_max;
    }

    // === Switching ===

    /// Save the current stack, install `target` and return the previous one.
    pub fn switch_stack(&mut self, heap: &mut Heap, target: BlockId) -> BlockId {
        self.assert_not_blocking("switch_stack");
        let previous = self.save_stack(heap);
        self.load_stack(heap, target);
        fiber_debug_log!("switch: {} -> {}", previous, target);
        previous
    }

    /// Write the live stack pointer back and mark an old segment dirty.
    pub fn save_stack(&mut self, heap: &mut Heap) -> BlockId {
        let regs = self.regs_or_panic();
        heap.stack_ref_mut(regs.current).set_stack_pointer(regs.sp);
        let id = self.id;
        dirty_stack(heap, id, self.remembered_mut(), regs.current);
        regs.current
    }

    /// Publish the live stack pointer to the current segment without
    /// dirtying it. Scans and clones read the segment's pointer.
    pub fn sync_stack_pointer(&self, heap: &mut Heap) {
        if let Some(regs) = self.regs {
            heap.stack_ref_mut(regs.current).set_stack_pointer(regs.sp);
        }
    }

    pub fn load_stack(&mut self, heap: &Heap, stack: BlockId) {
        let seg = heap.stack_ref(stack);
        self.regs = Some(StackRegisters {
            current: stack,
            sp: seg.stack_pointer(),
            capacity: seg.capacity(),
        });
    }

    /// Bracket a collection: the segment is authoritative until
    /// [`Domain::restore_stack_gc`].
    pub fn save_stack_gc(&mut self, heap: &mut Heap) {
        assert!(!self.stack_is_saved, "stack already saved for collection");
        self.save_stack(heap);
        self.stack_is_saved = true;
    }

    pub fn restore_stack_gc(&mut self, heap: &Heap) {
        if self.stack_is_saved {
            let current = self.regs_or_panic().current;
            self.load_stack(heap, current);
        }
        self.stack_is_saved = false;
    }

    /// Reload the registers from the current segment, for example after the
    /// collector rewrote it.
    pub fn restore_stack(&mut self, heap: &Heap) {
        let current = self.regs_or_panic().current;
        self.load_stack(heap, current);
    }

    pub fn stack_is_saved(&self) -> bool {
        self.stack_is_saved
    }

    // === Interpreter boundary ===

    /// Whether the high-relative `offset` is inside `stack` and `stack` is
    /// the current stack.
    pub fn on_current_stack(&self, stack: BlockId, offset: isize) -> bool {
        match self.regs {
            Some(regs) => {
                regs.current == stack && offset < 0 && offset.unsigned_abs() <= regs.capacity
            }
            None => false,
        }
    }

    /// Record where the caller spilled its registers, in the context header
    /// at the top of the current stack.
    pub fn update_gc_regs_slot(&mut self, heap: &mut Heap, regs_offset: Option<isize>) {
        let regs = self.regs_or_panic();
        assert!(regs.sp < 0, "no context header on an empty stack");
        let header = match regs_offset {
            Some(offset) => Value::int(offset as i64),
            None => Value::NULL,
        };
        heap.stack_ref_mut(regs.current).set_word(regs.sp, header);
    }

    pub fn stack_pointer(&self) -> isize {
        self.regs_or_panic().sp
    }

    pub fn used_words(&self) -> usize {
        self.regs.map(|r| r.used_words()).unwrap_or(0)
    }

    pub fn headroom(&self) -> usize {
        self.regs.map(|r| r.headroom()).unwrap_or(0)
    }

    /// Push one word, growing the stack first if it is full.
    pub fn push(&mut self, heap: &mut Heap, value: Value) -> RaiseResult<()> {
        self.assert_not_blocking("push");
        self.ensure_stack_capacity(heap, 1)?;
        let mut regs = self.regs_or_panic();
        regs.sp -= 1;
        heap.stack_ref_mut(regs.current).set_word(regs.sp, value);
        self.regs = Some(regs);
        Ok(())
    }

    pub fn pop(&mut self, heap: &Heap) -> Option<Value> {
        self.assert_not_blocking("pop");
        let mut regs = self.regs?;
        if regs.sp == 0 {
            return None;
        }
        let value = heap.stack_ref(regs.current).word(regs.sp);
        regs.sp += 1;
        self.regs = Some(regs);
        value
    }

    /// Word `depth` below the top of the current stack; 0 is the top.
    pub fn peek(&self, heap: &Heap, depth: usize) -> Option<Value> {
        let regs = self.regs?;
        if depth >= regs.used_words() {
            return None;
        }
        heap.stack_ref(regs.current)
            .word(regs.sp + depth as isize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayoutKind, RuntimeConfig};
    use crate::frame_table::FrameTable;
    use crate::runtime::Runtime;
    use crate::scan::scan_stack;

    fn booted_with(config: RuntimeConfig) -> (Domain, Heap) {
        let runtime = Runtime::new(config);
        let mut heap = Heap::from_config(runtime.config());
        runtime.init_global_data(&mut heap).unwrap();
        let mut domain = runtime.create_domain();
        domain.init(&mut heap).unwrap();
        (domain, heap)
    }

    fn booted() -> (Domain, Heap) {
        booted_with(RuntimeConfig::default())
    }

    fn fiber(domain: &mut Domain, heap: &mut Heap, words: usize) -> BlockId {
        domain
            .alloc_stack_with(heap, words, Value::int(1), Value::int(2), Value::int(3))
            .unwrap()
    }

    #[test]
    fn test_alloc_stack_bytecode_layout() {
        let (mut domain, mut heap) = booted();
        let stack = fiber(&mut domain, &mut heap, 64);
        let seg = heap.stack(stack).unwrap();
        assert_eq!(seg.capacity(), 64 + STACK_CONTEXT_WORDS);
        assert_eq!(seg.stack_pointer(), -1);
        assert_eq!(seg.word(-1), Some(TRAP_SENTINEL));
        assert!(seg.parent().is_none());
        assert!(seg.dirty_owner().is_none());
        assert_eq!(seg.handle_exception, Value::int(2));
    }

    #[test]
    fn test_alloc_stack_native_layout_is_scannable() {
        let config = RuntimeConfig {
            layout: LayoutKind::Native,
            ..RuntimeConfig::default()
        };
        let (mut domain, mut heap) = booted_with(config);
        let stack = fiber(&mut domain, &mut heap, 8);
        assert_eq!(heap.stack(stack).unwrap().stack_pointer(), -5);

        let layout = StackLayout::Native(FrameTable::new());
        let mut visits = 0;
        scan_stack(&mut heap, &layout, stack, &mut |_: Value, _: &mut Value| {
            visits += 1
        });
        assert_eq!(visits, 4);
    }

    #[test]
    fn test_switch_returns_previous_and_dirties_old_stack() {
        let (mut domain, mut heap) = booted();
        let main = domain.current_stack().unwrap();
        let f = fiber(&mut domain, &mut heap, 8);

        let previous = domain.switch_stack(&mut heap, f);
        assert_eq!(previous, main);
        assert_eq!(domain.current_stack(), Some(f));
        assert_eq!(domain.stack_pointer(), -1);
        assert_eq!(heap.stack(main).unwrap().dirty_owner(), Some(domain.id()));
        assert!(domain.remembered_set().contains(main));

        // the young fiber is not marked when switched away from
        domain.switch_stack(&mut heap, main);
        assert!(heap.stack(f).unwrap().dirty_owner().is_none());
    }

    #[test]
    fn test_push_pop_peek() {
        let (mut domain, mut heap) = booted();
        domain.push(&mut heap, Value::int(10)).unwrap();
        domain.push(&mut heap, Value::int(20)).unwrap();
        assert_eq!(domain.used_words(), 2);
        assert_eq!(domain.peek(&heap, 0), Some(Value::int(20)));
        assert_eq!(domain.peek(&heap, 1), Some(Value::int(10)));
        assert_eq!(domain.peek(&heap, 2), None);
        assert_eq!(domain.pop(&heap), Some(Value::int(20)));
        assert_eq!(domain.pop(&heap), Some(Value::int(10)));
        assert_eq!(domain.pop(&heap), None);
    }

    #[test]
    fn test_growth_preserves_content_and_metadata() {
        let (mut domain, mut heap) = booted();
        let f = fiber(&mut domain, &mut heap, 4);
        let parent = domain.switch_stack(&mut heap, f);
        heap.stack_mut(f).unwrap().set_parent(Some(parent));
        for i in 0..10 {
            domain.push(&mut heap, Value::int(i)).unwrap();
        }
        // 1 sentinel + 10 words in a 20 word segment
        let mut saved = [Value::int(77)];
        let grown = domain.realloc_stack(&mut heap, 32, &mut saved).unwrap();

        assert_ne!(grown, f);
        assert_eq!(domain.current_stack(), Some(grown));
        assert_eq!(saved, [Value::int(77)]);
        let seg = heap.stack(grown).unwrap();
        assert_eq!(seg.capacity(), 80);
        assert_eq!(seg.stack_pointer(), -11);
        assert_eq!(seg.parent(), Some(parent));
        assert_eq!(seg.handle_effect, Value::int(3));
        assert_eq!(seg.word(-1), Some(TRAP_SENTINEL));
        for i in 0..10 {
            assert_eq!(domain.peek(&heap, i), Some(Value::int(9 - i as i64)));
        }
        assert!(heap.stack(f).unwrap().is_retired());
    }

    #[test]
    fn test_growth_keeps_dirty_mark() {
        let (mut domain, mut heap) = booted();
        let main = domain.current_stack().unwrap();
        domain.save_stack(&mut heap);
        assert_eq!(heap.stack(main).unwrap().dirty_owner(), Some(domain.id()));

        let grown = domain.try_realloc_stack(&mut heap, 0, &mut []).unwrap();
        // twice the main stack is too large for the young generation
        assert!(!heap.is_young(grown));
        assert_eq!(heap.stack(grown).unwrap().dirty_owner(), Some(domain.id()));
        assert!(heap.stack(main).unwrap().dirty_owner().is_none());
        assert!(domain.remembered_set().contains(grown));
    }

    #[test]
    fn test_growth_past_limit_overflows_and_keeps_old_stack() {
        let (mut domain, mut heap) = booted();
        let f = fiber(&mut domain, &mut heap, 16);
        domain.switch_stack(&mut heap, f);
        domain.change_max_stack_size(40);
        assert_eq!(domain.max_stack_words(), 40);

        let err = domain.try_realloc_stack(&mut heap, 100, &mut []).unwrap_err();
        assert_eq!(err, RuntimeError::stack_overflow(101, 40));
        assert_eq!(domain.current_stack(), Some(f));
        assert!(!heap.stack(f).unwrap().is_retired());
    }

    #[test]
    fn test_growth_out_of_memory_keeps_old_stack() {
        let config = RuntimeConfig {
            init_stack_words: 64,
            max_heap_words: 4096,
            ..RuntimeConfig::default()
        };
        let (mut domain, mut heap) = booted_with(config);
        let main = domain.current_stack().unwrap();
        domain.push(&mut heap, Value::int(5)).unwrap();

        // 64 -> 128 -> ... until the heap cannot hold the copy
        let mut err = None;
        for _ in 0..8 {
            if let Err(e) = domain.try_realloc_stack(&mut heap, 0, &mut []) {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err, Some(RuntimeError::OutOfMemory));
        let current = domain.current_stack().unwrap();
        assert!(!heap.stack(current).unwrap().is_retired());
        assert_eq!(domain.peek(&heap, 0), Some(Value::int(5)));
        assert_ne!(current, main);
    }

    #[test]
    fn test_change_max_stack_size_clamps_to_usage() {
        let (mut domain, mut heap) = booted();
        for i in 0..8 {
            domain.push(&mut heap, Value::int(i)).unwrap();
        }
        domain.change_max_stack_size(1);
        assert_eq!(
            domain.max_stack_words(),
            8 + domain.config().stack_threshold_words
        );
    }

    #[test]
    fn test_maybe_expand_stack_doubles_near_threshold() {
        let (mut domain, mut heap) = booted();
        let f = fiber(&mut domain, &mut heap, 49);
        domain.switch_stack(&mut heap, f);
        // 64 free words: not below 2 * 32
        let mut regs = [Value::int(1), Value::int(2)];
        domain.maybe_expand_stack(&mut heap, &mut regs).unwrap();
        assert_eq!(domain.current_stack(), Some(f));

        domain.push(&mut heap, Value::int(0)).unwrap();
        domain.maybe_expand_stack(&mut heap, &mut regs).unwrap();
        assert_ne!(domain.current_stack(), Some(f));
        assert_eq!(domain.registers().unwrap().capacity, 130);
        assert_eq!(regs, [Value::int(1), Value::int(2)]);
    }

    #[test]
    fn test_save_restore_gc_bracket() {
        let (mut domain, mut heap) = booted();
        domain.push(&mut heap, Value::int(1)).unwrap();
        let main = domain.current_stack().unwrap();
        assert_eq!(heap.stack(main).unwrap().stack_pointer(), 0);

        domain.save_stack_gc(&mut heap);
        assert!(domain.stack_is_saved());
        assert_eq!(heap.stack(main).unwrap().stack_pointer(), -1);
        domain.restore_stack_gc(&heap);
        assert!(!domain.stack_is_saved());
        assert_eq!(domain.stack_pointer(), -1);
        domain.restore_stack(&heap);
        assert_eq!(domain.stack_pointer(), -1);
    }

    #[test]
    #[should_panic(expected = "already saved")]
    fn test_save_stack_gc_twice_panics() {
        let (mut domain, mut heap) = booted();
        domain.save_stack_gc(&mut heap);
        domain.save_stack_gc(&mut heap);
    }

    #[test]
    #[should_panic(expected = "inside a blocking section")]
    fn test_switch_inside_blocking_section_panics() {
        let (mut domain, mut heap) = booted();
        let f = fiber(&mut domain, &mut heap, 8);
        domain.enter_blocking_section();
        domain.switch_stack(&mut heap, f);
    }

    #[test]
    fn test_on_current_stack_and_gc_regs_slot() {
        let (mut domain, mut heap) = booted();
        let main = domain.current_stack().unwrap();
        let cap = domain.registers().unwrap().capacity as isize;
        assert!(domain.on_current_stack(main, -1));
        assert!(domain.on_current_stack(main, -cap));
        assert!(!domain.on_current_stack(main, 0));
        assert!(!domain.on_current_stack(main, -cap - 1));

        domain.push(&mut heap, Value::NULL).unwrap();
        domain.update_gc_regs_slot(&mut heap, Some(-1));
        assert_eq!(domain.peek(&heap, 0), Some(Value::int(-1)));
        domain.update_gc_regs_slot(&mut heap, None);
        assert_eq!(domain.peek(&heap, 0), Some(Value::NULL));
    }
}
