//! Managed heap arena with free list.
//!
//! This is the allocator the stack machinery depends on. It owns every block
//! (stack segments, capsules, exception buckets, strings), tracks which
//! generation each block is in and enforces the heap budget. Collection
//! itself happens elsewhere: the heap only records that a minor collection
//! was requested, and only once the collector has been marked ready.

use crate::bvar::Bvar;
use crate::config::RuntimeConfig;
use crate::error::AllocError;
use crate::ids::{BlockId, DomainId};
use crate::segment::StackSegment;
use crate::value::Value;

/// Largest block the young generation accepts.
pub const MAX_YOUNG_WOSIZE: usize = 256;

/// Tag of exception identifiers and other runtime objects.
pub const OBJECT_TAG: u8 = 248;

#[derive(Debug, Clone)]
pub enum Object {
    Block { tag: u8, fields: Vec<Value> },
    Str(String),
    Stack(StackSegment),
    Bvar(Bvar),
}

impl Object {
    pub fn wosize(&self) -> usize {
        match self {
            Object::Block { fields, .. } => fields.len(),
            Object::Str(s) => s.len() / 8 + 1,
            Object::Stack(seg) => seg.wosize(),
            Object::Bvar(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Young,
    Old,
}

/// Which allocation entry point to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPath {
    /// May request a minor collection; small blocks start young.
    Normal,
    /// Never requests a collection; allocates directly in the old
    /// generation. Used while bootstrapping.
    NoTrigger,
}

#[derive(Debug)]
struct Cell {
    generation: Generation,
    object: Object,
}

pub struct Heap {
    cells: Vec<Option<Cell>>,
    free_list: Vec<BlockId>,
    live_words: usize,
    max_words: usize,
    minor_limit: usize,
    minor_allocated: usize,
    collector_ready: bool,
    minor_requests: u64,
}

impl Heap {
    pub fn new(max_words: usize, minor_words: usize) -> Self {
        Heap {
            cells: Vec::new(),
            free_list: Vec::new(),
            live_words: 0,
            max_words,
            minor_limit: minor_words,
            minor_allocated: 0,
            collector_ready: false,
            minor_requests: 0,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.max_heap_words, config.minor_heap_words)
    }

    pub fn alloc(&mut self, object: Object, path: AllocPath) -> Result<BlockId, AllocError> {
        let wosize = object.wosize();
        let generation = self.reserve(wosize, path)?;
        let cell = Cell { generation, object };
        let id = if let Some(id) = self.free_list.pop() {
            self.cells[id.index()] = Some(cell);
            id
        } else {
            let id = BlockId::from_index(self.cells.len());
            self.cells.push(Some(cell));
            id
        };
        Ok(id)
    }

    fn reserve(&mut self, wosize: usize, path: AllocPath) -> Result<Generation, AllocError> {
        let available = self.max_words.saturating_sub(self.live_words);
        if wosize > available {
            return Err(AllocError {
                requested: wosize,
                available,
            });
        }
        self.live_words += wosize;

        if path == AllocPath::NoTrigger || wosize > MAX_YOUNG_WOSIZE {
            return Ok(Generation::Old);
        }
        self.minor_allocated += wosize;
        if self.collector_ready && self.minor_allocated > self.minor_limit {
            self.minor_requests += 1;
            self.minor_allocated = 0;
            log::debug!(
                "minor collection requested (#{}), {} live words",
                self.minor_requests,
                self.live_words
            );
        }
        Ok(Generation::Young)
    }

    /// Release a block. Called by the collector's sweep.
    pub fn free(&mut self, id: BlockId) -> Option<Object> {
        let cell = self.cells.get_mut(id.index())?.take()?;
        self.live_words = self.live_words.saturating_sub(cell.object.wosize());
        self.free_list.push(id);
        Some(cell.object)
    }

    /// Move a block to the old generation. Called by the collector.
    pub fn promote(&mut self, id: BlockId) {
        if let Some(Some(cell)) = self.cells.get_mut(id.index()) {
            cell.generation = Generation::Old;
        }
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: BlockId) -> Option<&Object> {
        self.cells
            .get(id.index())
            .and_then(|c| c.as_ref())
            .map(|c| &c.object)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Object> {
        self.cells
            .get_mut(id.index())
            .and_then(|c| c.as_mut())
            .map(|c| &mut c.object)
    }

    pub fn generation(&self, id: BlockId) -> Option<Generation> {
        self.cells
            .get(id.index())
            .and_then(|c| c.as_ref())
            .map(|c| c.generation)
    }

    pub fn is_young(&self, id: BlockId) -> bool {
        self.generation(id) == Some(Generation::Young)
    }

    pub fn stack(&self, id: BlockId) -> Option<&StackSegment> {
        match self.get(id) {
            Some(Object::Stack(seg)) => Some(seg),
            _ => None,
        }
    }

    pub fn stack_mut(&mut self, id: BlockId) -> Option<&mut StackSegment> {
        match self.get_mut(id) {
            Some(Object::Stack(seg)) => Some(seg),
            _ => None,
        }
    }

    /// Segment that must exist; anything else is a runtime bug.
    pub(crate) fn stack_ref(&self, id: BlockId) -> &StackSegment {
        match self.stack(id) {
            Some(seg) => seg,
            None => not_a_stack(id),
        }
    }

    pub(crate) fn stack_ref_mut(&mut self, id: BlockId) -> &mut StackSegment {
        match self.stack_mut(id) {
            Some(seg) => seg,
            None => not_a_stack(id),
        }
    }

    pub fn bvar(&self, id: BlockId) -> Option<&Bvar> {
        match self.get(id) {
            Some(Object::Bvar(bvar)) => Some(bvar),
            _ => None,
        }
    }

    pub fn bvar_mut(&mut self, id: BlockId) -> Option<&mut Bvar> {
        match self.get_mut(id) {
            Some(Object::Bvar(bvar)) => Some(bvar),
            _ => None,
        }
    }

    pub fn fields(&self, id: BlockId) -> Option<&[Value]> {
        match self.get(id) {
            Some(Object::Block { fields, .. }) => Some(fields),
            _ => None,
        }
    }

    pub fn block_tag(&self, id: BlockId) -> Option<u8> {
        match self.get(id) {
            Some(Object::Block { tag, .. }) => Some(*tag),
            _ => None,
        }
    }

    pub fn string(&self, id: BlockId) -> Option<&str> {
        match self.get(id) {
            Some(Object::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn iter_stacks_mut(&mut self) -> impl Iterator<Item = (BlockId, &mut StackSegment)> {
        self.cells.iter_mut().enumerate().filter_map(|(idx, slot)| {
            match slot.as_mut().map(|c| &mut c.object) {
                Some(Object::Stack(seg)) => Some((BlockId::from_index(idx), seg)),
                _ => None,
            }
        })
    }

    /// Stacks whose dirty mark belongs to `domain`.
    pub fn stacks_dirtied_by(&self, domain: DomainId) -> Vec<BlockId> {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot.as_ref().map(|c| &c.object) {
                Some(Object::Stack(seg)) if seg.dirty_owner() == Some(domain) => {
                    Some(BlockId::from_index(idx))
                }
                _ => None,
            })
            .collect()
    }

    pub fn mark_collector_ready(&mut self) {
        self.collector_ready = true;
    }

    pub fn collector_ready(&self) -> bool {
        self.collector_ready
    }

    pub fn minor_collections_requested(&self) -> u64 {
        self.minor_requests
    }

    pub fn live_words(&self) -> usize {
        self.live_words
    }

    pub fn max_words(&self) -> usize {
        self.max_words
    }

    pub fn len(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

fn not_a_stack(id: BlockId) -> ! {
    panic!("{id} is not a live stack segment")
}
