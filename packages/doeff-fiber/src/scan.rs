//! Root scanning of stack segments.
//!
//! Every scan first reports the four metadata slots (value, exception and
//! effect handlers, then the parent link) and then the used region. How the
//! used region is walked depends on the [`StackLayout`].
//!
//! Native chunk layout, from the stack pointer towards the high end:
//!
//! ```text
//! [gc_regs][exn_ptr]   context header (CONTEXT_HEADER_WORDS)
//! [retaddr]            return address of the topmost frame
//! [frame ... retaddr'] frame_words words, the last one is the caller's
//!                      return address
//! ...
//! [link][link]         after a chunk-boundary frame (NEXT_CHUNK_WORDS)
//! ```
//!
//! `gc_regs` is either `Value::NULL` or an immediate holding the
//! high-relative offset of the register spill area.

use std::collections::{HashSet, VecDeque};

use crate::fiber_debug_log;
use crate::frame_table::{FrameTable, LiveSlot, WORD_BYTES};
use crate::heap::{Heap, Object};
use crate::ids::{BlockId, DomainId};
use crate::segment::StackSegment;
use crate::value::Value;

pub const CONTEXT_HEADER_WORDS: usize = 2;
pub const NEXT_CHUNK_WORDS: usize = 2;

/// Collector callback. Called once per root with the reference as read and
/// the slot holding it; the collector may overwrite the slot.
pub trait RootVisitor {
    fn visit(&mut self, root: Value, slot: &mut Value);
}

impl<F> RootVisitor for F
where
    F: FnMut(Value, &mut Value),
{
    fn visit(&mut self, root: Value, slot: &mut Value) {
        self(root, slot)
    }
}

#[derive(Debug, Clone)]
pub enum StackLayout {
    Bytecode,
    Native(FrameTable),
}

impl StackLayout {
    pub fn is_native(&self) -> bool {
        matches!(self, StackLayout::Native(_))
    }
}

pub fn scan_segment<V: RootVisitor + ?Sized>(
    seg: &mut StackSegment,
    layout: &StackLayout,
    visitor: &mut V,
) {
    for slot in seg.metadata_slots_mut() {
        let root = *slot;
        visitor.visit(root, slot);
    }
    match layout {
        StackLayout::Bytecode => {
            for slot in seg.used_region_mut() {
                let root = *slot;
                visitor.visit(root, slot);
            }
        }
        StackLayout::Native(table) => scan_native(seg, table, visitor),
    }
}

fn scan_native<V: RootVisitor + ?Sized>(
    seg: &mut StackSegment,
    table: &FrameTable,
    visitor: &mut V,
) {
    if seg.stack_pointer() == 0 {
        return;
    }
    let high = seg.capacity();
    let mut pos = high - seg.used_words();

    // One iteration per chunk.
    loop {
        if pos == high {
            return;
        }
        let regs = regs_index(seg, pos);
        pos += CONTEXT_HEADER_WORDS;
        if pos == high {
            return;
        }
        let mut retaddr = raw_word(seg, pos);
        pos += 1;

        loop {
            let descriptor = match table.find(retaddr) {
                Some(d) => d,
                None => panic!("no frame descriptor for return address {retaddr:#x}"),
            };
            if descriptor.is_chunk_boundary() {
                fiber_debug_log!("scan: chunk boundary at word {}", pos);
                pos += NEXT_CHUNK_WORDS;
                break;
            }
            for live in &descriptor.live {
                let idx = match *live {
                    LiveSlot::Register(reg) => match regs {
                        Some(base) => base + reg as usize,
                        None => panic!("register slot {reg} in a chunk without saved registers"),
                    },
                    LiveSlot::Stack(ofs) => pos + ofs as usize / WORD_BYTES,
                };
                visit_index(seg, idx, visitor);
            }
            pos += descriptor.frame_words();
            retaddr = raw_word(seg, pos - 1);
        }
    }
}

fn regs_index(seg: &StackSegment, pos: usize) -> Option<usize> {
    let header = word_at(seg, pos);
    if header == Value::NULL {
        return None;
    }
    match header.as_int().and_then(|ofs| seg.index_of(ofs as isize)) {
        Some(idx) => Some(idx),
        None => panic!("corrupt context header {header:?} at word {pos}"),
    }
}

fn word_at(seg: &StackSegment, idx: usize) -> Value {
    let offset = idx as isize - seg.capacity() as isize;
    match seg.word(offset) {
        Some(v) => v,
        None => panic!("frame walk left the segment at word {idx}"),
    }
}

fn raw_word(seg: &StackSegment, idx: usize) -> u64 {
    word_at(seg, idx).raw()
}

fn visit_index<V: RootVisitor + ?Sized>(seg: &mut StackSegment, idx: usize, visitor: &mut V) {
    match seg.words_mut().get_mut(idx) {
        Some(slot) => {
            let root = *slot;
            visitor.visit(root, slot);
        }
        None => panic!("live slot at word {idx} is outside the segment"),
    }
}

pub fn scan_stack<V: RootVisitor + ?Sized>(
    heap: &mut Heap,
    layout: &StackLayout,
    stack: BlockId,
    visitor: &mut V,
) {
    scan_segment(heap.stack_ref_mut(stack), layout, visitor);
}

/// Scan `stack` only if `domain` holds its dirty mark. Returns whether a
/// scan happened.
pub fn scan_dirty_stack<V: RootVisitor + ?Sized>(
    heap: &mut Heap,
    layout: &StackLayout,
    domain: DomainId,
    stack: BlockId,
    visitor: &mut V,
) -> bool {
    let seg = heap.stack_ref_mut(stack);
    if seg.dirty_owner() != Some(domain) {
        return false;
    }
    scan_segment(seg, layout, visitor);
    true
}

/// Major-pass walk: scan every stack reachable from `roots`, following
/// references found while scanning, either to a stack or to a full capsule.
/// Each stack is scanned once. Returns the number of stacks scanned.
pub fn scan_stacks_from<V: RootVisitor + ?Sized>(
    heap: &mut Heap,
    layout: &StackLayout,
    roots: &[BlockId],
    visitor: &mut V,
) -> usize {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<BlockId> = roots.iter().copied().collect();
    let mut scanned = 0;

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(seg) = heap.stack_mut(id) else {
            continue;
        };
        let mut found = Vec::new();
        scan_segment(seg, layout, &mut |root: Value, slot: &mut Value| {
            visitor.visit(root, slot);
            if let Some(block) = slot.as_block() {
                found.push(block);
            }
        });
        scanned += 1;

        for block in found {
            match heap.get(block) {
                Some(Object::Stack(_)) => queue.push_back(block),
                Some(Object::Bvar(bvar)) => {
                    if let Some(head) = bvar.peek() {
                        queue.push_back(head);
                    }
                }
                _ => {}
            }
        }
    }
    scanned
}
