//! doeff-fiber: growable fiber stacks for a multi-domain managed runtime.
//!
//! # Architecture
//!
//! - **Stack manager**: allocate, grow by doubling, switch the current stack
//! - **Root scanner**: metadata slots plus frame-descriptor or conservative
//!   walks of the used region
//! - **Dirty tracking**: ownership marks and a per-domain must-scan set
//!   instead of a write barrier on stack writes
//! - **Continuations**: single-use capsules, deep chain cloning for
//!   multi-shot resume, parent-link reversal for delegated effects
//! - **Exceptions**: handler contexts, lock-unwind ledgers and a pending
//!   bucket propagated as `Err(Raised)` to the enclosing `protect`
//!
//! Every entry point takes the current [`Domain`] and the shared [`Heap`]
//! explicitly.

pub mod bvar;
pub mod config;
pub mod continuation;
mod debug_log;
pub mod dirty;
pub mod domain;
pub mod error;
pub mod fail;
pub mod frame_table;
pub mod heap;
pub mod ids;
pub mod runtime;
pub mod scan;
pub mod segment;
mod stack;
pub mod unwind;
pub mod value;

// Re-exports for convenience
pub use bvar::{Bvar, BvarStatus};
pub use config::{LayoutKind, RuntimeConfig};
pub use continuation::{capture, chain, clone_chain, find_performer, take_continuation};
pub use dirty::{clean_domain_stacks, clean_stack, clean_stack_domain, dirty_stack, RememberedSet};
pub use domain::{Domain, StackRegisters};
pub use error::{AllocError, BootstrapFault, ConfigError, RaiseResult, Raised, RuntimeError};
pub use fail::{exception_tag, format_exception, ExnIndex, FATAL_EXIT_CODE};
pub use frame_table::{FrameDescriptor, FrameTable, LiveSlot, CHUNK_BOUNDARY};
pub use heap::{AllocPath, Generation, Heap, Object};
pub use ids::{BlockId, DomainId, LockId};
pub use runtime::{DomainInfo, GlobalData, Runtime};
pub use scan::{scan_dirty_stack, scan_segment, scan_stack, scan_stacks_from, RootVisitor, StackLayout};
pub use segment::{StackSegment, STACK_CONTEXT_WORDS};
pub use stack::TRAP_SENTINEL;
pub use unwind::{LockLedger, PlatLock, UnwindLock};
pub use value::Value;
