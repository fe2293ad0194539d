//! tagheap: a boundary-tag, binned, best-fit heap allocator.
//!
//! The design follows the classic Doug Lea malloc lineage: chunks carry
//! their size (plus two flag bits) in a boundary tag shared with their
//! physical neighbors, recently freed small chunks sit in singly-linked
//! fastbins, everything else flows through an unsorted staging bin into 128
//! size-segregated doubly-linked bins, and a bitmap skips empty bins during
//! best-fit search. Memory comes from a [`BackingStore`]: a reserved virtual
//! region committed granule by granule for ordinary requests, standalone
//! zero-filled mappings for outsized ones.
//!
//! The core [`Heap`] is strictly single-threaded and contains no locking;
//! [`LockedHeap`] wraps one system-backed instance behind a spin lock and
//! implements `GlobalAlloc`:
//!
//! ```no_run
//! use tagheap::LockedHeap;
//!
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::new();
//!
//! fn main() {
//!   let v: Vec<u64> = (0..1024).collect();
//!   drop(v);
//! }
//! ```
//!
//! Allocation failure is recoverable: `alloc`/`realloc`/`calloc` return
//! `None` when the backing store is exhausted, and retrying after freeing
//! memory elsewhere is valid.
//!
//! Misuse (double free, freeing foreign pointers, clobbering boundary tags)
//! is not detected; the heap trusts its caller.

#![allow(clippy::missing_safety_doc)]

mod chunk;
mod global;
mod heap;
mod vm;

pub use chunk::{ALIGNMENT, MINSIZE};
pub use global::{LockedHeap, SpinLock};
pub use heap::{Heap, HeapConfig, HeapStats};
pub use vm::{BackingStore, SystemStore, VmError};
