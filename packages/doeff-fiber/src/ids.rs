//! Core identifier types for the fiber runtime.
//!
//! All IDs are lightweight Copy types using newtype pattern for type safety.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Unique identifier for a domain (one OS-thread-parallel worker).
///
/// Zero is never handed out so that a raw zero word can never be mistaken for
/// a domain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DomainId(pub u32);

/// Unique identifier for heap blocks (arena index).
///
/// Stack segments, capsules, exception buckets and strings all live in the
/// same arena and are referenced by index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId(pub u32);

/// Unique identifier for a lock recorded in an unwind ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LockId(pub u64);

// Global counters for ID generation
static DOMAIN_ID_COUNTER: AtomicU32 = AtomicU32::new(1);
static LOCK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl DomainId {
    /// Create a fresh unique DomainId.
    pub fn fresh() -> Self {
        DomainId(DOMAIN_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a DomainId with a specific value (for testing).
    pub fn from_raw(value: u32) -> Self {
        DomainId(value)
    }

    /// Get the raw value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

impl BlockId {
    pub fn from_index(index: usize) -> Self {
        BlockId(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

impl LockId {
    pub fn fresh() -> Self {
        LockId(LOCK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}
