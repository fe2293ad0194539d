//! External serialization and drop-in global-allocator use.
//!
//! The heap core is single-threaded by contract; [`LockedHeap`] is the one
//! sanctioned way to share it. Every entry point goes through [`with_lock`],
//! so the serialization requirement is enforced by construction rather than
//! left to the embedding application's discipline.
//!
//! [`with_lock`]: LockedHeap::with_lock

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::hint;
use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::chunk::ALIGNMENT;
use crate::heap::Heap;
use crate::vm::SystemStore;

// =============================================================================
// Spin lock
// =============================================================================

pub struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self { locked: AtomicBool::new(false) }
  }

  #[inline]
  pub fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  pub fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

impl Default for SpinLock {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Locked heap
// =============================================================================

/// A system-backed heap behind a spin lock, usable as `#[global_allocator]`.
///
/// The inner heap is created lazily on first use, so a `LockedHeap` can live
/// in a `static`.
pub struct LockedHeap {
  lock: SpinLock,
  heap: UnsafeCell<Option<Heap<SystemStore>>>,
}

// All access to the inner heap is serialized by the lock.
unsafe impl Sync for LockedHeap {}

impl LockedHeap {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(None),
    }
  }

  /// Runs `f` with exclusive access to the heap. This is the only way in;
  /// callers cannot reach the heap without holding the lock.
  pub fn with_lock<R>(&self, f: impl FnOnce(&mut Heap<SystemStore>) -> R) -> R {
    self.lock.lock();
    let heap = unsafe { &mut *self.heap.get() };
    let result = f(heap.get_or_insert_with(|| Heap::new(SystemStore)));
    self.lock.unlock();
    result
  }
}

impl Default for LockedHeap {
  fn default() -> Self {
    Self::new()
  }
}

unsafe impl GlobalAlloc for LockedHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);
    // The heap guarantees two-word alignment; stricter layouts get a
    // standalone mapping with the pointer nudged into place.
    if layout.align() > ALIGNMENT {
      return self
        .with_lock(|h| h.alloc_mapped_aligned(size, layout.align()))
        .map_or(null_mut(), |p| p.as_ptr());
    }
    self
      .with_lock(|h| h.alloc(size))
      .map_or(null_mut(), |p| p.as_ptr())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if ptr.is_null() {
      return;
    }
    self.with_lock(|h| unsafe { h.free(ptr) });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      // Must re-establish the alignment: fresh mapping, copy, release.
      let new_ptr = unsafe {
        self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()))
      };
      if !new_ptr.is_null() {
        unsafe {
          ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
          self.dealloc(ptr, layout);
        }
      }
      return new_ptr;
    }
    self
      .with_lock(|h| unsafe { h.realloc(ptr, new_size.max(1)) })
      .map_or(null_mut(), |p| p.as_ptr())
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      // Aligned mappings come straight from the store, already zeroed.
      return unsafe { self.alloc(layout) };
    }
    self
      .with_lock(|h| h.calloc(1, layout.size().max(1)))
      .map_or(null_mut(), |p| p.as_ptr())
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  static HEAP: LockedHeap = LockedHeap::new();

  #[test]
  fn with_lock_roundtrip() {
    let p = HEAP.with_lock(|h| h.alloc(128)).unwrap();
    unsafe {
      p.as_ptr().write_bytes(0x5A, 128);
      assert_eq!(p.as_ptr().read(), 0x5A);
      assert!(HEAP.with_lock(|h| unsafe { h.usable_size(p.as_ptr()) }) >= 128);
      HEAP.with_lock(|h| unsafe { h.free(p.as_ptr()) });
    }
  }

  #[test]
  fn global_alloc_api() {
    let layout = Layout::from_size_align(300, 8).unwrap();
    unsafe {
      let p = HEAP.alloc(layout);
      assert!(!p.is_null());
      p.write_bytes(0x21, 300);

      let q = HEAP.realloc(p, layout, 900);
      assert!(!q.is_null());
      for i in 0..300 {
        assert_eq!(q.add(i).read(), 0x21);
      }
      HEAP.dealloc(q, Layout::from_size_align(900, 8).unwrap());

      let z = HEAP.alloc_zeroed(Layout::from_size_align(512, 8).unwrap());
      assert!(!z.is_null());
      assert!((0..512).all(|i| z.add(i).read() == 0));
      HEAP.dealloc(z, Layout::from_size_align(512, 8).unwrap());
    }
  }

  #[test]
  fn high_alignment_layouts() {
    for align in [32, 256, 4096] {
      let layout = Layout::from_size_align(1000, align).unwrap();
      unsafe {
        let p = HEAP.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0, "align {align} violated");
        p.write_bytes(0xEE, 1000);
        HEAP.dealloc(p, layout);
      }
    }
  }

  #[test]
  fn concurrent_alloc_free_smoke() {
    let mut handles = Vec::new();
    for t in 0..8u8 {
      handles.push(thread::spawn(move || {
        let sizes = [16, 64, 256, 1024, 4096];
        let mut ptrs = Vec::new();
        for i in 0..200 {
          let size = sizes[(i + t as usize) % sizes.len()];
          let p = HEAP.with_lock(|h| h.alloc(size)).expect("alloc failed");
          unsafe { p.as_ptr().write_bytes(t, size) };
          ptrs.push((p, size));
        }
        for (p, size) in ptrs {
          let bytes =
            unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
          assert!(bytes.iter().all(|&b| b == t), "cross-thread clobber");
          HEAP.with_lock(|h| unsafe { h.free(p.as_ptr()) });
        }
      }));
    }
    for handle in handles {
      handle.join().unwrap();
    }
  }
}
