//! Backing-store interface: page-granular reserve/commit/map/unmap.
//!
//! The heap never calls the operating system directly; it talks to a
//! [`BackingStore`]. [`SystemStore`] is the production implementation over
//! anonymous mappings. Tests substitute a recording store to observe the
//! exact commit/map/unmap traffic.

use core::ptr::NonNull;

use log::{debug, trace};
use thiserror::Error;

use crate::chunk::PAGE_SIZE;

/// Failures surfaced by a backing store.
#[derive(Debug, Error)]
pub enum VmError {
  #[error("reservation of {len} bytes failed")]
  ReserveFailed { len: usize },
  #[error("commit of {len} bytes at offset {offset} failed")]
  CommitFailed { offset: usize, len: usize },
  #[error("standalone mapping of {len} bytes failed")]
  MapFailed { len: usize },
  #[error("unmapping {len} bytes failed")]
  UnmapFailed { len: usize },
}

/// Page-granular memory primitive required from the environment.
///
/// `reserve` claims a contiguous virtual range without backing it; `commit`
/// backs a prefix-extending slice of that range with zeroed, writable pages.
/// `map_fresh` produces a standalone zero-filled mapping outside the region,
/// and `unmap` releases either kind wholesale.
pub trait BackingStore {
  fn reserve(&mut self, len: usize) -> Result<NonNull<u8>, VmError>;

  fn commit(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), VmError>;

  /// Standalone, page-aligned, zero-filled mapping.
  fn map_fresh(&mut self, len: usize) -> Result<NonNull<u8>, VmError>;

  fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), VmError>;

  /// Optionally grow or shrink a standalone mapping in place (or by moving).
  /// Stores without such a primitive keep the default and callers fall back
  /// to allocate-copy-free.
  fn remap(
    &mut self,
    addr: NonNull<u8>,
    old_len: usize,
    new_len: usize,
  ) -> Option<NonNull<u8>> {
    let _ = (addr, old_len, new_len);
    None
  }

  fn page_size(&self) -> usize {
    PAGE_SIZE
  }
}

// =============================================================================
// System store (unix)
// =============================================================================

/// Backing store over anonymous OS mappings.
#[derive(Debug, Default)]
pub struct SystemStore;

#[cfg(unix)]
impl BackingStore for SystemStore {
  fn reserve(&mut self, len: usize) -> Result<NonNull<u8>, VmError> {
    let ptr = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      return Err(VmError::ReserveFailed { len });
    }
    debug!("reserved {} KB region", len / 1024);
    NonNull::new(ptr as *mut u8).ok_or(VmError::ReserveFailed { len })
  }

  fn commit(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
    let rc = unsafe {
      libc::mprotect(
        addr.as_ptr().cast(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
      )
    };
    if rc != 0 {
      return Err(VmError::CommitFailed {
        offset: addr.as_ptr() as usize,
        len,
      });
    }
    trace!("committed {} KB", len / 1024);
    Ok(())
  }

  fn map_fresh(&mut self, len: usize) -> Result<NonNull<u8>, VmError> {
    let ptr = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      return Err(VmError::MapFailed { len });
    }
    NonNull::new(ptr as *mut u8).ok_or(VmError::MapFailed { len })
  }

  fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
    let rc = unsafe { libc::munmap(addr.as_ptr().cast(), len) };
    if rc != 0 {
      return Err(VmError::UnmapFailed { len });
    }
    Ok(())
  }

  #[cfg(target_os = "linux")]
  fn remap(
    &mut self,
    addr: NonNull<u8>,
    old_len: usize,
    new_len: usize,
  ) -> Option<NonNull<u8>> {
    let ptr = unsafe {
      libc::mremap(
        addr.as_ptr().cast(),
        old_len,
        new_len,
        libc::MREMAP_MAYMOVE,
      )
    };
    if ptr == libc::MAP_FAILED {
      return None;
    }
    NonNull::new(ptr as *mut u8)
  }

  fn page_size(&self) -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as usize } else { PAGE_SIZE }
  }
}

// =============================================================================
// Tests
// =============================================================================
