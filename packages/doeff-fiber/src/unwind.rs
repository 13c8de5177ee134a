//! Lock-unwind ledger, local-roots frames and handler contexts.
//!
//! A domain keeps a stack of local-roots frames. Each frame owns the roots a
//! native frame registered and a ledger of the locks it acquired. Entering a
//! protected region pushes a [`HandlerContext`] recording where the frame
//! stack and the innermost ledger stood; unwinding pops back to that point
//! and releases every lock recorded after it, most recent first.

use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::RawMutex as _;

use crate::fiber_debug_log;
use crate::ids::LockId;
use crate::value::Value;

/// A lock the unwinder knows how to release.
pub trait UnwindLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);

    fn name(&self) -> &str {
        "<lock>"
    }
}

/// Platform mutex usable from the runtime and from foreign code.
pub struct PlatLock {
    raw: parking_lot::RawMutex,
    name: String,
}

impl PlatLock {
    pub fn new(name: impl Into<String>) -> Self {
        PlatLock {
            raw: parking_lot::RawMutex::INIT,
            name: name.into(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }
}

impl UnwindLock for PlatLock {
    fn lock(&self) {
        self.raw.lock();
    }

    fn unlock(&self) {
        if !self.raw.is_locked() {
            panic!("unlocking {} which is not held", self.name);
        }
        // SAFETY: the ledger only holds locks acquired through `lock`, and a
        // record is released at most once.
        unsafe { self.raw.unlock() };
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PlatLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[derive(Clone)]
pub struct LockRecord {
    pub id: LockId,
    pub lock: Arc<dyn UnwindLock>,
}

impl fmt::Debug for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRecord")
            .field("id", &self.id)
            .field("lock", &self.lock.name())
            .finish()
    }
}

/// Locks currently held by one local-roots frame, oldest first.
#[derive(Debug, Default, Clone)]
pub struct LockLedger {
    records: Vec<LockRecord>,
}

impl LockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, lock: Arc<dyn UnwindLock>) -> LockId {
        let id = LockId::fresh();
        self.records.push(LockRecord { id, lock });
        id
    }

    /// Drop a record on normal release. The lock itself is not touched.
    pub fn remove(&mut self, id: LockId) -> Option<LockRecord> {
        let pos = self.records.iter().rposition(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    /// Release records above `mark`, most recent first.
    pub fn release_down_to(&mut self, mark: usize) -> usize {
        let mut released = 0;
        while self.records.len() > mark {
            if let Some(record) = self.records.pop() {
                fiber_debug_log!("unwind: releasing {}", record.lock.name());
                record.lock.unlock();
                released += 1;
            }
        }
        released
    }

    pub fn release_all(&mut self) -> usize {
        self.release_down_to(0)
    }

    pub fn holds(&self, id: LockId) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Roots registered by one native frame plus the locks it holds.
#[derive(Debug, Default, Clone)]
pub struct LocalRootsFrame {
    pub roots: Vec<Value>,
    pub ledger: LockLedger,
}

impl LocalRootsFrame {
    pub fn with_roots(roots: Vec<Value>) -> Self {
        LocalRootsFrame {
            roots,
            ledger: LockLedger::new(),
        }
    }
}

/// Resumption point of a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerContext {
    /// Number of local-roots frames live at entry.
    pub roots_marker: usize,
    /// Ledger length of the innermost frame at entry.
    pub ledger_mark: usize,
    pub blocking_depth: usize,
}
