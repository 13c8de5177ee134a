//! Dirty marks on old stacks and the per-domain must-scan set.
//!
//! A stack write does not go through a write barrier. Instead, an old stack
//! a domain is about to mutate is marked as owned by that domain and queued;
//! the next minor pass rescans everything queued and clears the marks.

use crate::heap::Heap;
use crate::ids::{BlockId, DomainId};

/// Stacks queued for rescanning by one domain. Append-only until drained.
#[derive(Debug, Default, Clone)]
pub struct RememberedSet {
    fiber_ref: Vec<BlockId>,
}

impl RememberedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stack: BlockId) {
        self.fiber_ref.push(stack);
    }

    pub fn drain(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.fiber_ref)
    }

    pub fn contains(&self, stack: BlockId) -> bool {
        self.fiber_ref.contains(&stack)
    }

    pub fn len(&self) -> usize {
        self.fiber_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fiber_ref.is_empty()
    }
}

/// Mark `stack` dirty on behalf of `domain` and queue it.
///
/// Young stacks are scanned by every minor pass anyway and are left alone.
/// Returns whether the stack was newly queued.
///
/// # Panics
///
/// If another domain holds the mark.
pub fn dirty_stack(
    heap: &mut Heap,
    domain: DomainId,
    remembered: &mut RememberedSet,
    stack: BlockId,
) -> bool {
    if heap.is_young(stack) {
        return false;
    }
    let seg = heap.stack_ref_mut(stack);
    match seg.dirty_owner() {
        None => {
            seg.set_dirty_owner(Some(domain));
            remembered.push(stack);
            true
        }
        Some(owner) if owner == domain => false,
        Some(owner) => panic!("{stack} is dirty for {owner}, cannot be dirtied by {domain}"),
    }
}

/// Clear the mark if `domain` holds it.
pub fn clean_stack(heap: &mut Heap, domain: DomainId, stack: BlockId) -> bool {
    let seg = heap.stack_ref_mut(stack);
    if seg.dirty_owner() == Some(domain) {
        seg.set_dirty_owner(None);
        true
    } else {
        false
    }
}

/// Cross-domain variant used during a coordinated pause: clear the mark if
/// it belongs to `owner`.
pub fn clean_stack_domain(heap: &mut Heap, stack: BlockId, owner: DomainId) -> bool {
    clean_stack(heap, owner, stack)
}

/// Clear every mark held by a retiring domain. Returns how many were
/// cleared.
pub fn clean_domain_stacks(heap: &mut Heap, owner: DomainId) -> usize {
    let mut cleared = 0;
    for (_, seg) in heap.iter_stacks_mut() {
        if seg.dirty_owner() == Some(owner) {
            seg.set_dirty_owner(None);
            cleared += 1;
        }
    }
    if cleared > 0 {
        log::debug!("cleared {cleared} dirty stacks of {owner}");
    }
    cleared
}
