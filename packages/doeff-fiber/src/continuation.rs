//! Continuations: capture capsules over stack chains.
//!
//! A captured continuation is a [`Bvar`] holding the head of a chain of
//! stack segments linked through their `parent` fields. Resuming consumes
//! the capsule. To resume more than once, clone the chain first.

use crate::bvar::{Bvar, BvarStatus};
use crate::domain::Domain;
use crate::error::{RaiseResult, RuntimeError};
use crate::fiber_debug_log;
use crate::heap::{AllocPath, Heap, Object};
use crate::ids::BlockId;

/// Wrap `head` in a fresh full capsule.
pub fn capture(heap: &mut Heap, head: BlockId) -> Result<BlockId, RuntimeError> {
    if heap.stack(head).is_none() {
        return Err(RuntimeError::invalid_argument("capture of a non-stack block"));
    }
    Ok(heap.alloc(Object::Bvar(Bvar::full(head)), AllocPath::Normal)?)
}

fn full_head(heap: &Heap, capsule: BlockId) -> Result<BlockId, RuntimeError> {
    let Some(bvar) = heap.bvar(capsule) else {
        return Err(RuntimeError::invalid_argument("not a continuation"));
    };
    match (bvar.status(), bvar.peek()) {
        (BvarStatus::Full, Some(head)) => Ok(head),
        (BvarStatus::Empty, _) => Err(RuntimeError::invalid_argument("continuation is empty")),
        _ => Err(RuntimeError::invalid_argument("continuation already taken")),
    }
}

/// Segments of the chain starting at `head`, head first.
///
/// # Panics
///
/// If the chain is cyclic or reaches a block that is not a stack.
pub fn chain(heap: &Heap, head: BlockId) -> Vec<BlockId> {
    let mut segments = Vec::new();
    let mut next = Some(head);
    while let Some(id) = next {
        assert!(
            segments.len() <= heap.capacity(),
            "cycle in the parent chain of {head}"
        );
        segments.push(id);
        next = heap.stack_ref(id).parent();
    }
    segments
}

/// Deep-copy the chain held by `capsule` into a fresh capsule. The original
/// is left untouched. Copies start clean.
///
/// If an allocation fails part way the copies made so far are freed and the
/// error is returned.
pub fn clone_chain(heap: &mut Heap, capsule: BlockId) -> Result<BlockId, RuntimeError> {
    let head = full_head(heap, capsule)?;
    let sources = chain(heap, head);
    let mut copies: Vec<BlockId> = Vec::with_capacity(sources.len());

    for source in &sources {
        let copy = heap.stack_ref(*source).deep_copy();
        let target = match heap.alloc(Object::Stack(copy), AllocPath::Normal) {
            Ok(id) => id,
            Err(err) => {
                for id in copies {
                    heap.free(id);
                }
                return Err(err.into());
            }
        };
        if let Some(prev) = copies.last() {
            heap.stack_ref_mut(*prev).set_parent(Some(target));
        }
        copies.push(target);
    }

    let new_head = copies[0];
    match heap.alloc(Object::Bvar(Bvar::full(new_head)), AllocPath::Normal) {
        Ok(cloned) => {
            fiber_debug_log!("clone: {} segments into {}", copies.len(), cloned);
            Ok(cloned)
        }
        Err(err) => {
            for id in copies {
                heap.free(id);
            }
            Err(err.into())
        }
    }
}

/// Consume the capsule and return the head of its chain.
pub fn take_continuation(heap: &mut Heap, capsule: BlockId) -> Result<BlockId, RuntimeError> {
    match heap.bvar_mut(capsule) {
        Some(bvar) => bvar.take(),
        None => Err(RuntimeError::invalid_argument("not a continuation")),
    }
}

/// Reverse the parent links from `stack` outwards so each points back at
/// the segment visited before it, the first one at `current`. Returns the
/// outermost delegator.
///
/// The chain is mutated in place; nothing may scan it concurrently.
pub fn find_performer(heap: &mut Heap, current: BlockId, stack: BlockId) -> BlockId {
    let mut parent = current;
    let mut next = Some(stack);
    let mut steps = 0;
    while let Some(id) = next {
        steps += 1;
        assert!(steps <= heap.capacity(), "cycle in the parent chain of {stack}");
        let seg = heap.stack_ref_mut(id);
        let delegator = seg.parent();
        seg.set_parent(Some(parent));
        parent = id;
        next = delegator;
    }
    parent
}

impl Domain {
    pub fn clone_continuation(&mut self, heap: &mut Heap, capsule: BlockId) -> RaiseResult<BlockId> {
        self.sync_stack_pointer(heap);
        clone_chain(heap, capsule).map_err(|err| self.raise_error(heap, err))
    }

    /// [`find_performer`] starting from this domain's current stack.
    pub fn find_performer(&self, heap: &mut Heap, stack: BlockId) -> BlockId {
        find_performer(heap, self.regs_or_panic().current, stack)
    }

    /// Consume `capsule`, attach its chain below the current stack and
    /// switch to its head. Returns the stack that was running.
    pub fn resume(&mut self, heap: &mut Heap, capsule: BlockId) -> RaiseResult<BlockId> {
        let head = match take_continuation(heap, capsule) {
            Ok(head) => head,
            Err(err) => return Err(self.raise_error(heap, err)),
        };
        let current = self.regs_or_panic().current;
        if let Some(&tail) = chain(heap, head).last() {
            heap.stack_ref_mut(tail).set_parent(Some(current));
        }
        Ok(self.switch_stack(heap, head))
    }

    /// Multi-shot resume: clone the chain and resume the clone, leaving
    /// `capsule` full.
    pub fn resume_cloned(&mut self, heap: &mut Heap, capsule: BlockId) -> RaiseResult<BlockId> {
        let cloned = self.clone_continuation(heap, capsule)?;
        self.resume(heap, cloned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::fail::format_exception;
    use crate::runtime::Runtime;
    use crate::segment::StackSegment;
    use crate::value::Value;

    fn booted() -> (Domain, Heap) {
        let runtime = Runtime::new(RuntimeConfig::default());
        let mut heap = Heap::from_config(runtime.config());
        runtime.init_global_data(&mut heap).unwrap();
        let mut domain = runtime.create_domain();
        domain.init(&mut heap).unwrap();
        (domain, heap)
    }

    /// Chain of `n` segments, head first, each tagged by its handlers.
    fn make_chain(heap: &mut Heap, n: usize) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = Vec::new();
        for i in (0..n).rev() {
            let mut seg = StackSegment::new(
                8,
                Value::int(i as i64),
                Value::int(10 + i as i64),
                Value::int(20 + i as i64),
            );
            seg.set_stack_pointer(-2);
            seg.set_word(-1, Value::int(100 + i as i64));
            seg.set_parent(ids.last().copied());
            ids.push(heap.alloc(Object::Stack(seg), AllocPath::Normal).unwrap());
        }
        ids.reverse();
        ids
    }

    #[test]
    fn test_clone_of_current_stack_keeps_unsaved_words() {
        let (mut domain, mut heap) = booted();
        let current = domain.current_stack().unwrap();
        domain.push(&mut heap, Value::int(41)).unwrap();
        domain.push(&mut heap, Value::int(42)).unwrap();
        let capsule = capture(&mut heap, current).unwrap();

        let cloned = domain.clone_continuation(&mut heap, capsule).unwrap();
        let copy = heap.bvar(cloned).unwrap().peek().unwrap();
        let seg = heap.stack(copy).unwrap();
        assert_eq!(seg.used_region(), &[Value::int(42), Value::int(41)]);
    }

    #[test]
    fn test_clone_chain_is_disjoint_and_equal() {
        let mut heap = Heap::new(1 << 16, 1 << 16);
        let original = make_chain(&mut heap, 3);
        let capsule = capture(&mut heap, original[0]).unwrap();

        let first = clone_chain(&mut heap, capsule).unwrap();
        let second = clone_chain(&mut heap, capsule).unwrap();
        let a = chain(&heap, heap.bvar(first).unwrap().peek().unwrap());
        let b = chain(&heap, heap.bvar(second).unwrap().peek().unwrap());

        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 3);
        for i in 0..3 {
            assert_ne!(a[i], original[i]);
            assert_ne!(a[i], b[i]);
            let (sa, so) = (heap.stack(a[i]).unwrap(), heap.stack(original[i]).unwrap());
            assert_eq!(sa.used_region(), so.used_region());
            assert_eq!(sa.handle_value, so.handle_value);
            assert_eq!(sa.stack_pointer(), so.stack_pointer());
        }
        assert_eq!(heap.bvar(capsule).unwrap().status(), BvarStatus::Full);

        take_continuation(&mut heap, first).unwrap();
        assert_eq!(heap.bvar(second).unwrap().status(), BvarStatus::Full);
    }

    #[test]
    fn test_clone_copies_start_clean() {
        let mut heap = Heap::new(1 << 16, 1 << 16);
        let original = make_chain(&mut heap, 2);
        heap.stack_ref_mut(original[1])
            .set_dirty_owner(Some(crate::ids::DomainId::from_raw(3)));
        let capsule = capture(&mut heap, original[0]).unwrap();

        let cloned = clone_chain(&mut heap, capsule).unwrap();
        let copies = chain(&heap, heap.bvar(cloned).unwrap().peek().unwrap());
        assert!(copies
            .iter()
            .all(|id| heap.stack(*id).unwrap().dirty_owner().is_none()));
    }

    #[test]
    fn test_clone_of_taken_or_empty_capsule_fails() {
        let mut heap = Heap::new(1 << 16, 1 << 16);
        let original = make_chain(&mut heap, 1);
        let capsule = capture(&mut heap, original[0]).unwrap();
        take_continuation(&mut heap, capsule).unwrap();

        assert_eq!(
            clone_chain(&mut heap, capsule),
            Err(RuntimeError::invalid_argument("continuation already taken"))
        );
        let empty = heap.alloc(Object::Bvar(Bvar::empty()), AllocPath::Normal).unwrap();
        assert!(matches!(
            clone_chain(&mut heap, empty),
            Err(RuntimeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_clone_out_of_memory_frees_partial_copies() {
        // segments are 14 words, capsules 2: the first clone brings the heap
        // to 88 words, the second fails on its third segment
        let mut heap = Heap::new(121, 1 << 16);
        let original = make_chain(&mut heap, 3);
        let capsule = capture(&mut heap, original[0]).unwrap();
        clone_chain(&mut heap, capsule).unwrap();
        let before = heap.len();
        assert_eq!(heap.live_words(), 88);

        assert_eq!(clone_chain(&mut heap, capsule), Err(RuntimeError::OutOfMemory));
        assert_eq!(heap.len(), before);
        assert_eq!(heap.live_words(), 88);
        assert_eq!(heap.bvar(capsule).unwrap().status(), BvarStatus::Full);
    }

    #[test]
    fn test_find_performer_reverses_links() {
        let mut heap = Heap::new(1 << 16, 1 << 16);
        let current = heap
            .alloc(Object::Stack(StackSegment::bare(4)), AllocPath::Normal)
            .unwrap();
        let ids = make_chain(&mut heap, 4);

        let performer = find_performer(&mut heap, current, ids[0]);
        assert_eq!(performer, ids[3]);
        assert_eq!(heap.stack(ids[0]).unwrap().parent(), Some(current));
        for i in 1..4 {
            assert_eq!(heap.stack(ids[i]).unwrap().parent(), Some(ids[i - 1]));
        }
    }

    #[test]
    fn test_find_performer_single_segment() {
        let mut heap = Heap::new(1 << 16, 1 << 16);
        let current = heap
            .alloc(Object::Stack(StackSegment::bare(4)), AllocPath::Normal)
            .unwrap();
        let ids = make_chain(&mut heap, 1);
        assert_eq!(find_performer(&mut heap, current, ids[0]), ids[0]);
        assert_eq!(heap.stack(ids[0]).unwrap().parent(), Some(current));
    }

    #[test]
    fn test_resume_attaches_chain_and_switches() {
        let (mut domain, mut heap) = booted();
        let main = domain.current_stack().unwrap();
        let ids = make_chain(&mut heap, 2);
        let capsule = capture(&mut heap, ids[0]).unwrap();

        let previous = domain.resume(&mut heap, capsule).unwrap();
        assert_eq!(previous, main);
        assert_eq!(domain.current_stack(), Some(ids[0]));
        assert_eq!(heap.stack(ids[1]).unwrap().parent(), Some(main));
        assert_eq!(domain.stack_pointer(), -2);
    }

    #[test]
    fn test_second_resume_raises_invalid_argument() {
        let (mut domain, mut heap) = booted();
        let ids = make_chain(&mut heap, 1);
        let capsule = capture(&mut heap, ids[0]).unwrap();
        domain.resume(&mut heap, capsule).unwrap();

        let bucket = domain
            .protect(&mut heap, |d, h| d.resume(h, capsule))
            .unwrap_err();
        assert_eq!(
            format_exception(&heap, bucket),
            "Invalid_argument(\"continuation already taken\")"
        );
    }

    #[test]
    fn test_resume_cloned_is_multi_shot() {
        let (mut domain, mut heap) = booted();
        let main = domain.current_stack().unwrap();
        let ids = make_chain(&mut heap, 2);
        let capsule = capture(&mut heap, ids[0]).unwrap();

        domain.resume_cloned(&mut heap, capsule).unwrap();
        let first = domain.current_stack().unwrap();
        domain.switch_stack(&mut heap, main);
        domain.resume_cloned(&mut heap, capsule).unwrap();
        let second = domain.current_stack().unwrap();

        assert_ne!(first, ids[0]);
        assert_ne!(second, first);
        assert_eq!(heap.bvar(capsule).unwrap().status(), BvarStatus::Full);
        // the original chain is still unattached
        assert!(heap.stack(ids[1]).unwrap().parent().is_none());
    }
}
