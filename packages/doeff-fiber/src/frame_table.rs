//! Frame descriptors for compiled stack frames.
//!
//! Descriptors are produced by the compiler; the runtime only looks them up.
//! The table uses open addressing over a power-of-two index space with
//! linear probing, keyed by return address.

/// Frame size that marks the top of a stack chunk instead of a real frame.
pub const CHUNK_BOUNDARY: u16 = 0xFFFF;

/// Bytes per stack word.
pub const WORD_BYTES: usize = 8;

/// Return address of the handler that delivers a fiber's final value to its
/// parent. Its descriptor is always a chunk boundary.
pub const FIBER_VAL_HANDLER: u64 = 0x0000_7f00_0000_0010;

/// Return address of the handler that forwards an uncaught exception to the
/// parent fiber.
pub const FIBER_EXN_HANDLER: u64 = 0x0000_7f00_0000_0020;

/// Location of one live reference in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSlot {
    /// Index into the register spill area of the enclosing chunk.
    Register(u16),
    /// Byte offset from the frame's stack pointer.
    Stack(u16),
}

impl LiveSlot {
    /// Decode the compiler's encoding: odd values are registers.
    pub fn decode(raw: u16) -> Self {
        if raw & 1 == 1 {
            LiveSlot::Register(raw >> 1)
        } else {
            LiveSlot::Stack(raw)
        }
    }

    pub fn encode(self) -> u16 {
        match self {
            LiveSlot::Register(reg) => (reg << 1) | 1,
            LiveSlot::Stack(ofs) => ofs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub retaddr: u64,
    /// Frame size in bytes. The low two bits carry flags.
    pub frame_size: u16,
    pub live: Vec<LiveSlot>,
}

impl FrameDescriptor {
    pub fn new(retaddr: u64, frame_size: u16, live: Vec<LiveSlot>) -> Self {
        FrameDescriptor {
            retaddr,
            frame_size,
            live,
        }
    }

    pub fn chunk_boundary(retaddr: u64) -> Self {
        Self::new(retaddr, CHUNK_BOUNDARY, Vec::new())
    }

    pub fn is_chunk_boundary(&self) -> bool {
        self.frame_size == CHUNK_BOUNDARY
    }

    pub fn frame_words(&self) -> usize {
        (self.frame_size & 0xFFFC) as usize / WORD_BYTES
    }
}

#[derive(Debug, Clone)]
pub struct FrameTable {
    slots: Vec<Option<FrameDescriptor>>,
    count: usize,
}

pub fn hash_retaddr(retaddr: u64, mask: usize) -> usize {
    (retaddr >> 3) as usize & mask
}

impl FrameTable {
    /// Table containing only the fiber handler boundaries.
    pub fn new() -> Self {
        Self::build(Vec::new())
    }

    pub fn build(descriptors: Vec<FrameDescriptor>) -> Self {
        let mut table = FrameTable {
            slots: vec![None; table_size_for(descriptors.len() + 2)],
            count: 0,
        };
        table.insert(FrameDescriptor::chunk_boundary(FIBER_VAL_HANDLER));
        table.insert(FrameDescriptor::chunk_boundary(FIBER_EXN_HANDLER));
        for descriptor in descriptors {
            table.insert(descriptor);
        }
        table
    }

    pub fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Insert or replace the descriptor for `descriptor.retaddr`. The table
    /// is kept at most half full.
    pub fn insert(&mut self, descriptor: FrameDescriptor) {
        if 2 * (self.count + 1) > self.slots.len() {
            self.rehash(self.slots.len() * 2);
        }
        let mask = self.mask();
        let mut h = hash_retaddr(descriptor.retaddr, mask);
        loop {
            match &self.slots[h] {
                None => {
                    self.slots[h] = Some(descriptor);
                    self.count += 1;
                    return;
                }
                Some(existing) if existing.retaddr == descriptor.retaddr => {
                    self.slots[h] = Some(descriptor);
                    return;
                }
                Some(_) => h = (h + 1) & mask,
            }
        }
    }

    fn rehash(&mut self, size: usize) {
        let old = std::mem::replace(&mut self.slots, vec![None; size]);
        self.count = 0;
        for descriptor in old.into_iter().flatten() {
            self.insert(descriptor);
        }
    }

    /// Probe from the hashed slot until the return address matches.
    pub fn find(&self, retaddr: u64) -> Option<&FrameDescriptor> {
        let mask = self.mask();
        let mut h = hash_retaddr(retaddr, mask);
        for _ in 0..self.slots.len() {
            match &self.slots[h] {
                Some(d) if d.retaddr == retaddr => return Some(d),
                Some(_) => h = (h + 1) & mask,
                None => return None,
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

fn table_size_for(count: usize) -> usize {
    let mut size = 4;
    while size < 2 * count {
        size *= 2;
    }
    size
}
