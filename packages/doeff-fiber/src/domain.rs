//! Per-domain execution context.
//!
//! A [`Domain`] is passed by `&mut` to every entry point that needs "the
//! current domain": the stack manager (`stack.rs`), the raiser (`fail.rs`)
//! and the continuation operations. It owns everything that is private to
//! one worker thread.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::dirty::{clean_domain_stacks, clean_stack, RememberedSet};
use crate::error::RuntimeError;
use crate::heap::{Heap, Object};
use crate::ids::{BlockId, DomainId, LockId};
use crate::runtime::Runtime;
use crate::scan::{scan_dirty_stack, scan_stack, scan_stacks_from, RootVisitor, StackLayout};
use crate::unwind::{HandlerContext, LocalRootsFrame, UnwindLock};
use crate::value::Value;

/// The current-stack register set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegisters {
    pub current: BlockId,
    /// Live stack pointer. Written back to the segment on save.
    pub sp: isize,
    pub capacity: usize,
}

impl StackRegisters {
    pub fn used_words(&self) -> usize {
        self.sp.unsigned_abs()
    }

    pub fn headroom(&self) -> usize {
        self.capacity - self.used_words()
    }
}

pub struct Domain {
    pub(crate) id: DomainId,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) regs: Option<StackRegisters>,
    pub(crate) stack_is_saved: bool,
    pub(crate) max_stack_words: usize,
    pub(crate) remembered: RememberedSet,
    pub(crate) handlers: Vec<HandlerContext>,
    /// Never empty: index 0 is the domain's base frame.
    pub(crate) local_roots: Vec<LocalRootsFrame>,
    pub(crate) exn_bucket: Option<Value>,
    pub(crate) blocking_depth: usize,
    pub(crate) vm_inited: bool,
}

impl Domain {
    pub(crate) fn new(runtime: Arc<Runtime>) -> Self {
        let id = DomainId::fresh();
        runtime.domains().register(id);
        let max_stack_words = runtime.config().max_stack_words;
        Domain {
            id,
            runtime,
            regs: None,
            stack_is_saved: false,
            max_stack_words,
            remembered: RememberedSet::new(),
            handlers: Vec::new(),
            local_roots: vec![LocalRootsFrame::default()],
            exn_bucket: None,
            blocking_depth: 0,
            vm_inited: false,
        }
    }

    /// Create the main stack and mark the domain ready to raise.
    pub fn init(&mut self, heap: &mut Heap) -> Result<BlockId, RuntimeError> {
        let main = self.init_main_stack(heap)?;
        self.vm_inited = true;
        self.runtime.domains().set_vm_inited(self.id, true);
        log::debug!("{} initialised with main stack {main}", self.id);
        Ok(main)
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.runtime.config()
    }

    pub fn layout(&self) -> &StackLayout {
        self.runtime.layout()
    }

    pub fn is_initialised(&self) -> bool {
        self.vm_inited
    }

    pub fn registers(&self) -> Option<StackRegisters> {
        self.regs
    }

    pub fn current_stack(&self) -> Option<BlockId> {
        self.regs.map(|r| r.current)
    }

    pub(crate) fn regs_or_panic(&self) -> StackRegisters {
        match self.regs {
            Some(regs) => regs,
            None => panic!("{} has no current stack", self.id),
        }
    }

    pub fn remembered_set(&self) -> &RememberedSet {
        &self.remembered
    }

    pub(crate) fn remembered_mut(&mut self) -> &mut RememberedSet {
        &mut self.remembered
    }

    pub fn pending_exception(&self) -> Option<Value> {
        self.exn_bucket
    }

    pub fn handler_depth(&self) -> usize {
        self.handlers.len()
    }

    // === Blocking sections ===

    pub fn enter_blocking_section(&mut self) {
        self.blocking_depth += 1;
    }

    pub fn leave_blocking_section(&mut self) {
        assert!(
            self.blocking_depth > 0,
            "leaving a blocking section that was never entered"
        );
        self.blocking_depth -= 1;
    }

    pub fn in_blocking_section(&self) -> bool {
        self.blocking_depth > 0
    }

    pub fn blocking_depth(&self) -> usize {
        self.blocking_depth
    }

    /// Run a foreign call inside a blocking section.
    pub fn blocking_section<T>(&mut self, call: impl FnOnce() -> T) -> T {
        self.enter_blocking_section();
        let result = call();
        self.leave_blocking_section();
        result
    }

    pub(crate) fn assert_not_blocking(&self, op: &str) {
        assert!(
            self.blocking_depth == 0,
            "{op} called inside a blocking section on {}",
            self.id
        );
    }

    // === Local roots and locks ===

    /// Register the roots of a native frame. Returns the marker to pass to
    /// [`Domain::leave_local_frame`].
    pub fn enter_local_frame(&mut self, roots: Vec<Value>) -> usize {
        self.local_roots.push(LocalRootsFrame::with_roots(roots));
        self.local_roots.len() - 1
    }

    /// Pop the frame opened at `marker` and hand back its roots, as updated
    /// by any collection in between.
    pub fn leave_local_frame(&mut self, marker: usize) -> Vec<Value> {
        assert!(
            marker >= 1 && self.local_roots.len() == marker + 1,
            "local frame {marker} is not the innermost frame"
        );
        match self.local_roots.pop() {
            Some(frame) => {
                assert!(
                    frame.ledger.is_empty(),
                    "local frame left with {} locks held",
                    frame.ledger.len()
                );
                frame.roots
            }
            None => unreachable!(),
        }
    }

    pub fn local_frame_depth(&self) -> usize {
        self.local_roots.len()
    }

    pub(crate) fn innermost_frame(&mut self) -> &mut LocalRootsFrame {
        match self.local_roots.last_mut() {
            Some(frame) => frame,
            None => panic!("{} lost its base local frame", self.id),
        }
    }

    /// Lock `lock` and record it in the innermost frame's ledger.
    pub fn acquire(&mut self, lock: Arc<dyn UnwindLock>) -> LockId {
        lock.lock();
        self.innermost_frame().ledger.push(lock)
    }

    /// Unlock a lock taken with [`Domain::acquire`]. Returns `false` if no
    /// live frame holds it.
    pub fn release(&mut self, id: LockId) -> bool {
        for frame in self.local_roots.iter_mut().rev() {
            if let Some(record) = frame.ledger.remove(id) {
                record.lock.unlock();
                return true;
            }
        }
        false
    }

    pub fn held_locks(&self) -> usize {
        self.local_roots.iter().map(|f| f.ledger.len()).sum()
    }

    // === Collector entry points ===

    pub fn scan_local_roots<V: RootVisitor + ?Sized>(&mut self, visitor: &mut V) {
        for frame in &mut self.local_roots {
            for slot in &mut frame.roots {
                let root = *slot;
                visitor.visit(root, slot);
            }
        }
    }

    /// Visit the current stack, the local roots and the pending exception.
    pub fn scan_roots<V: RootVisitor + ?Sized>(&mut self, heap: &mut Heap, visitor: &mut V) {
        self.sync_stack_pointer(heap);
        if let Some(current) = self.current_stack() {
            let layout = self.runtime.layout();
            scan_stack(heap, layout, current, visitor);
        }
        self.scan_local_roots(visitor);
        if let Some(slot) = self.exn_bucket.as_mut() {
            let root = *slot;
            visitor.visit(root, slot);
        }
    }

    /// Minor-pass drain of the must-scan set. Each queued stack that is still
    /// dirty for this domain is scanned and cleaned. Returns the number of
    /// stacks scanned.
    pub fn scan_remembered_stacks<V: RootVisitor + ?Sized>(
        &mut self,
        heap: &mut Heap,
        visitor: &mut V,
    ) -> usize {
        self.sync_stack_pointer(heap);
        let queued = self.remembered.drain();
        let layout = self.runtime.layout();
        let mut scanned = 0;
        for stack in queued {
            if !heap.contains(stack) {
                continue;
            }
            if scan_dirty_stack(heap, layout, self.id, stack, visitor) {
                clean_stack(heap, self.id, stack);
                scanned += 1;
            }
        }
        scanned
    }

    /// Major-pass walk over every stack reachable from the current stack and
    /// the local roots.
    pub fn scan_all_stacks<V: RootVisitor + ?Sized>(
        &mut self,
        heap: &mut Heap,
        visitor: &mut V,
    ) -> usize {
        self.sync_stack_pointer(heap);
        let mut roots: Vec<BlockId> = self.current_stack().into_iter().collect();
        for frame in &self.local_roots {
            for value in &frame.roots {
                let Some(block) = value.as_block() else {
                    continue;
                };
                match heap.get(block) {
                    Some(Object::Stack(_)) => roots.push(block),
                    Some(Object::Bvar(bvar)) => roots.extend(bvar.peek()),
                    _ => {}
                }
            }
        }
        let layout = self.runtime.layout();
        scan_stacks_from(heap, layout, &roots, visitor)
    }

    /// Retire the domain: drop its dirty marks and deregister it.
    pub fn terminate(mut self, heap: &mut Heap) -> usize {
        self.remembered.drain();
        let cleared = clean_domain_stacks(heap, self.id);
        self.runtime.domains().remove(self.id);
        log::debug!("{} terminated, {cleared} dirty stacks released", self.id);
        cleared
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("regs", &self.regs)
            .field("handlers", &self.handlers.len())
            .field("local_frames", &self.local_roots.len())
            .field("blocking_depth", &self.blocking_depth)
            .field("vm_inited", &self.vm_inited)
            .finish()
    }
}
