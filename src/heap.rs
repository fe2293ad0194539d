//! The heap proper: binned boundary-tag allocation over a backing store.
//!
//! Chunks inside the managed region are identified by byte offsets into the
//! arena rather than raw pointers. Offsets are always multiples of
//! `ALIGNMENT`, which frees the low bit to tag bin headers: the odd value
//! `(i << 1) | 1` stands for bin `i`, so bin headers can sit in circular
//! chunk lists exactly like chunks do. `usize::MAX` is the null link.
//!
//! Standalone mapped blocks (outsized requests) live outside the arena and
//! are the one place this module still touches raw pointers; those paths are
//! contained in the `mapped` helpers at the bottom.

use core::ptr::{self, NonNull};

use log::debug;

use crate::chunk::*;
use crate::vm::BackingStore;

// =============================================================================
// Chunk references
// =============================================================================

/// Null link in fastbin and bin lists.
const NIL: usize = usize::MAX;

/// Tagged reference to bin header `i`.
#[inline(always)]
const fn bin_ref(i: usize) -> usize {
  (i << 1) | 1
}

#[inline(always)]
const fn is_bin(r: usize) -> bool {
  r & 1 == 1
}

#[inline(always)]
const fn bin_of(r: usize) -> usize {
  r >> 1
}

/// The unsorted bin stages freed and split chunks before binning. It also
/// serves as the initial `top`: a legal but unusable chunk of size zero,
/// forcing the first allocation into `sysalloc`.
const UNSORTED: usize = bin_ref(1);

/// Forward/backward links of one bin header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Link {
  fd: usize,
  bk: usize,
}

// =============================================================================
// Configuration & statistics
// =============================================================================

/// Tunable parameters, applied on first use.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
  /// Largest request served from fastbins; clamped to `MAX_FAST_SIZE`,
  /// zero disables fastbins entirely.
  pub max_fast: usize,
  /// Top size beyond which a trim is attempted after consolidation.
  pub trim_threshold: usize,
  /// Slack passed to the trim hook.
  pub top_pad: usize,
  /// Requests at least this large become standalone mappings.
  pub mmap_threshold: usize,
  /// Cap on concurrently live standalone mappings.
  pub n_mmaps_max: usize,
  /// Length of the reserved virtual region.
  pub region_len: usize,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      max_fast: DEFAULT_MAX_FAST,
      trim_threshold: DEFAULT_TRIM_THRESHOLD,
      top_pad: DEFAULT_TOP_PAD,
      mmap_threshold: DEFAULT_MMAP_THRESHOLD,
      n_mmaps_max: DEFAULT_MMAP_MAX,
      region_len: REGION_SIZE,
    }
  }
}

/// Footprint snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes committed in the managed region.
  pub committed: usize,
  /// Reserved region length (zero until first growth).
  pub region_len: usize,
  /// Current size of the top chunk.
  pub top_size: usize,
  /// Live standalone mappings.
  pub n_mmaps: usize,
  /// High-water mark of live standalone mappings.
  pub max_n_mmaps: usize,
  /// Bytes accounted to standalone mappings.
  pub mmapped_bytes: usize,
}

// =============================================================================
// Heap state
// =============================================================================

/// A single-threaded boundary-tag heap over backing store `B`.
///
/// No internal locking: concurrent callers must serialize every entry point
/// externally (see `LockedHeap`). Freed pointers are trusted; passing a
/// pointer that did not come from this heap, or freeing twice, is undefined
/// behavior.
pub struct Heap<B: BackingStore> {
  store: B,
  cfg: HeapConfig,

  /// Fastbin eligibility threshold with two flag bits packed low.
  /// `FASTCHUNKS_BIT` is inverted (clear = "may have fastchunks") and
  /// zero doubles as the not-yet-initialized sentinel.
  max_fast: usize,
  fastbins: [usize; NFASTBINS],
  /// The chunk bordering unallocated region space; never binned.
  top: usize,
  /// Trailing piece of the most recent small-request split.
  last_remainder: usize,
  /// Bin 0 unused, bin 1 unsorted, then smallbins and largebins.
  bins: [Link; NBINS],
  binmap: [u32; BINMAP_SIZE],

  n_mmaps: usize,
  max_n_mmaps: usize,
  mmapped_bytes: usize,

  /// Region base; null until the first `sysalloc` reserves it.
  base: *mut u8,
  /// Committed bytes from `base` (the wilderness boundary).
  wilderness: usize,
  region_len: usize,
}

// The raw region pointer is owned by the heap alone.
unsafe impl<B: BackingStore + Send> Send for Heap<B> {}

impl<B: BackingStore> Heap<B> {
  pub fn new(store: B) -> Self {
    Self::with_config(store, HeapConfig::default())
  }

  /// Creates the all-zero startup state; real initialization happens inside
  /// the first `consolidate` call.
  pub fn with_config(store: B, cfg: HeapConfig) -> Self {
    Self {
      store,
      cfg,
      max_fast: 0,
      fastbins: [NIL; NFASTBINS],
      top: NIL,
      last_remainder: NIL,
      bins: [Link { fd: NIL, bk: NIL }; NBINS],
      binmap: [0; BINMAP_SIZE],
      n_mmaps: 0,
      max_n_mmaps: 0,
      mmapped_bytes: 0,
      base: ptr::null_mut(),
      wilderness: 0,
      region_len: 0,
    }
  }

  pub fn stats(&self) -> HeapStats {
    HeapStats {
      committed: self.wilderness,
      region_len: self.region_len,
      top_size: self.chunksize(self.top),
      n_mmaps: self.n_mmaps,
      max_n_mmaps: self.max_n_mmaps,
      mmapped_bytes: self.mmapped_bytes,
    }
  }

  // ===========================================================================
  // Arena word access
  // ===========================================================================
  //
  // Every boundary-tag read and write funnels through these two accessors.

  #[inline]
  fn word(&self, off: usize) -> usize {
    debug_assert!(!self.base.is_null());
    debug_assert!(off % WORD == 0 && off + WORD <= self.wilderness);
    unsafe { (self.base.add(off) as *const usize).read() }
  }

  #[inline]
  fn set_word(&mut self, off: usize, val: usize) {
    debug_assert!(!self.base.is_null());
    debug_assert!(off % WORD == 0 && off + WORD <= self.wilderness);
    unsafe { (self.base.add(off) as *mut usize).write(val) }
  }

  // ===========================================================================
  // Chunk accessors
  // ===========================================================================

  #[inline]
  fn head(&self, r: usize) -> usize {
    debug_assert!(!is_bin(r));
    self.word(r + WORD)
  }

  #[inline]
  fn set_head(&mut self, r: usize, v: usize) {
    debug_assert!(!is_bin(r));
    self.set_word(r + WORD, v);
  }

  /// Replaces the size while preserving the chunk's own `PREV_INUSE` bit.
  #[inline]
  fn set_head_size(&mut self, r: usize, sz: usize) {
    let keep = self.head(r) & PREV_INUSE;
    self.set_head(r, keep | sz);
  }

  /// Chunk size; bin headers (including the pre-growth dummy top) read as
  /// size zero.
  #[inline]
  fn chunksize(&self, r: usize) -> usize {
    if is_bin(r) { 0 } else { size_of_head(self.head(r)) }
  }

  #[inline]
  fn prev_size(&self, r: usize) -> usize {
    self.word(r)
  }

  /// Mirrors a free chunk's size into the following chunk's `prev_size`.
  #[inline]
  fn set_foot(&mut self, r: usize, sz: usize) {
    self.set_word(r + sz, sz);
  }

  #[inline]
  fn prev_inuse(&self, r: usize) -> bool {
    head_prev_inuse(self.head(r))
  }

  /// In-use bit of the chunk at `r`, recorded in its successor's head.
  #[inline]
  fn inuse(&self, r: usize) -> bool {
    let sz = self.chunksize(r);
    head_prev_inuse(self.head(r + sz))
  }

  #[inline]
  fn inuse_bit_at_offset(&self, r: usize, off: usize) -> bool {
    head_prev_inuse(self.head(r + off))
  }

  #[inline]
  fn set_inuse_bit_at_offset(&mut self, r: usize, off: usize) {
    let h = self.head(r + off);
    self.set_head(r + off, h | PREV_INUSE);
  }

  // fd/bk dispatch between arena chunks and bin headers, so headers can act
  // as list nodes without own storage inside the arena.

  #[inline]
  fn fd(&self, r: usize) -> usize {
    if is_bin(r) {
      self.bins[bin_of(r)].fd
    } else {
      self.word(r + 2 * WORD)
    }
  }

  #[inline]
  fn bk(&self, r: usize) -> usize {
    if is_bin(r) {
      self.bins[bin_of(r)].bk
    } else {
      self.word(r + 3 * WORD)
    }
  }

  #[inline]
  fn set_fd(&mut self, r: usize, v: usize) {
    if is_bin(r) {
      self.bins[bin_of(r)].fd = v;
    } else {
      self.set_word(r + 2 * WORD, v);
    }
  }

  #[inline]
  fn set_bk(&mut self, r: usize, v: usize) {
    if is_bin(r) {
      self.bins[bin_of(r)].bk = v;
    } else {
      self.set_word(r + 3 * WORD, v);
    }
  }

  /// Takes a chunk out of its doubly-linked list.
  #[inline]
  fn unlink(&mut self, r: usize) {
    let f = self.fd(r);
    let b = self.bk(r);
    self.set_bk(f, b);
    self.set_fd(b, f);
  }

  #[inline]
  fn mark_bin(&mut self, i: usize) {
    self.binmap[idx_to_block(i)] |= idx_to_bit(i);
  }

  // ===========================================================================
  // Pointer boundary
  // ===========================================================================

  #[inline]
  fn chunk2mem(&self, r: usize) -> NonNull<u8> {
    debug_assert!(!is_bin(r) && r + MEM_OFFSET < self.wilderness);
    // The arena is a live mapping and r stays inside it.
    unsafe { NonNull::new_unchecked(self.base.add(r + MEM_OFFSET)) }
  }

  #[inline]
  fn mem2ref(&self, mem: *mut u8) -> usize {
    debug_assert!(self.contains(mem));
    mem as usize - self.base as usize - MEM_OFFSET
  }

  /// Whether a user pointer lies inside the managed region (as opposed to a
  /// standalone mapping).
  #[inline]
  fn contains(&self, mem: *mut u8) -> bool {
    !self.base.is_null()
      && (mem as usize) >= self.base as usize + MEM_OFFSET
      && (mem as usize) < self.base as usize + self.wilderness
  }

  // ===========================================================================
  // Fastchunk flags & tunables
  // ===========================================================================

  #[inline]
  fn have_fastchunks(&self) -> bool {
    self.max_fast & FASTCHUNKS_BIT == 0
  }

  /// Notes that a chunk entered a fastbin (clears the inverted bit).
  #[inline]
  fn note_fastchunks(&mut self) {
    self.max_fast &= !FASTCHUNKS_BIT;
  }

  #[inline]
  fn clear_fastchunks(&mut self) {
    self.max_fast |= FASTCHUNKS_BIT;
  }

  fn apply_max_fast(&mut self, request: usize) {
    let sz = if request == 0 {
      // Impossibly small: no real chunk is ever <= this.
      SMALLBIN_WIDTH
    } else {
      pad_request(request.min(MAX_FAST_SIZE))
    };
    self.max_fast = sz | FASTCHUNKS_BIT | (self.max_fast & NONCONTIGUOUS_BIT);
  }

  /// Adjusts the fastbin threshold. Pending fastbin chunks are consolidated
  /// first so none is stranded above the new threshold.
  pub fn set_max_fast(&mut self, request: usize) {
    self.cfg.max_fast = request;
    if self.max_fast != 0 {
      self.consolidate();
      self.apply_max_fast(request);
    }
  }

  pub fn set_trim_threshold(&mut self, bytes: usize) {
    self.cfg.trim_threshold = bytes;
  }

  pub fn set_mmap_threshold(&mut self, bytes: usize) {
    self.cfg.mmap_threshold = bytes;
  }

  // ===========================================================================
  // Initialization & consolidation
  // ===========================================================================

  fn init(&mut self) {
    // Establish circular links for normal bins; bin 0 stays unused.
    for i in 1..NBINS {
      let b = bin_ref(i);
      self.bins[i] = Link { fd: b, bk: b };
    }
    self.apply_max_fast(self.cfg.max_fast);
    self.top = UNSORTED;
  }

  /// Tears down every fastbin, merging each chunk with free neighbors and
  /// staging the results in the unsorted bin. `free` cannot be used for
  /// this because it would put the chunks right back onto fastbins.
  ///
  /// Doubles as the lazy initializer: the zeroed `max_fast` sentinel routes
  /// the first call here before any chunk exists.
  pub fn consolidate(&mut self) {
    if self.max_fast == 0 {
      self.init();
      return;
    }
    self.clear_fastchunks();

    for i in 0..NFASTBINS {
      let mut p = self.fastbins[i];
      if p == NIL {
        continue;
      }
      self.fastbins[i] = NIL;

      while p != NIL {
        let nextp = self.fd(p);

        // Streamlined version of the consolidation code in free().
        let mut chunk = p;
        let mut size = size_of_head(self.head(p));
        let nextchunk = p + size;
        let nextsize = self.chunksize(nextchunk);

        if !self.prev_inuse(chunk) {
          let prevsize = self.prev_size(chunk);
          size += prevsize;
          chunk -= prevsize;
          self.unlink(chunk);
        }

        if nextchunk != self.top {
          let nextinuse = self.inuse_bit_at_offset(nextchunk, nextsize);
          self.set_head(nextchunk, nextsize);
          if !nextinuse {
            size += nextsize;
            self.unlink(nextchunk);
          }

          let first_unsorted = self.fd(UNSORTED);
          self.set_fd(UNSORTED, chunk);
          self.set_bk(first_unsorted, chunk);

          self.set_head(chunk, size | PREV_INUSE);
          self.set_bk(chunk, UNSORTED);
          self.set_fd(chunk, first_unsorted);
          self.set_foot(chunk, size);
        } else {
          size += nextsize;
          self.set_head(chunk, size | PREV_INUSE);
          self.top = chunk;
        }

        p = nextp;
      }
    }
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Returns at least `bytes` of usable, `ALIGNMENT`-aligned memory, or
  /// `None` when the backing store cannot satisfy the request.
  pub fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    let nb = request2size(bytes)?;
    self.alloc_padded(nb)
  }

  fn alloc_padded(&mut self, nb: usize) -> Option<NonNull<u8>> {
    // Fastbin hit: O(1) LIFO pop, no coalescing. Safe to try even before
    // initialization, when max_fast is still zero.
    if nb <= self.max_fast {
      let idx = fastbin_index(nb);
      let victim = self.fastbins[idx];
      if victim != NIL {
        self.fastbins[idx] = self.fd(victim);
        return Some(self.chunk2mem(victim));
      }
    }

    let mut idx;
    if in_smallbin_range(nb) {
      // Smallbins hold one size each, so a non-empty bin is an exact fit.
      idx = smallbin_index(nb);
      let bin = bin_ref(idx);
      let victim = self.bk(bin);
      if victim != bin {
        if victim == NIL {
          // First use: bins not yet linked.
          self.consolidate();
        } else {
          let bck = self.bk(victim);
          self.set_inuse_bit_at_offset(victim, nb);
          self.set_bk(bin, bck);
          self.set_fd(bck, bin);
          return Some(self.chunk2mem(victim));
        }
      }
    } else {
      // A large request benefits from maximal free-chunk size, so kill the
      // fastbins before searching.
      idx = largebin_index(nb);
      if self.have_fastchunks() {
        self.consolidate();
      }
    }

    // The outer loop exists because we may not realize until near the end
    // that we should have consolidated; that happens at most once, when a
    // small request would otherwise have to grow the region.
    loop {
      // Drain the unsorted bin, taking a chunk only on exact fit or the
      // last-remainder rule; everything else gets filed into its real bin.
      // This is the only place chunks enter the small and large bins.
      loop {
        let victim = self.bk(UNSORTED);
        if victim == UNSORTED {
          break;
        }
        let bck = self.bk(victim);
        let size = self.chunksize(victim);

        // A lone remainder chunk gets split for small requests, keeping
        // runs of consecutive small allocations adjacent.
        if in_smallbin_range(nb)
          && bck == UNSORTED
          && victim == self.last_remainder
          && size > nb + MINSIZE
        {
          let remainder_size = size - nb;
          let remainder = victim + nb;
          self.bins[1] = Link { fd: remainder, bk: remainder };
          self.last_remainder = remainder;
          self.set_bk(remainder, UNSORTED);
          self.set_fd(remainder, UNSORTED);

          self.set_head(victim, nb | PREV_INUSE);
          self.set_head(remainder, remainder_size | PREV_INUSE);
          self.set_foot(remainder, remainder_size);
          return Some(self.chunk2mem(victim));
        }

        // Unstage it.
        self.set_bk(UNSORTED, bck);
        self.set_fd(bck, UNSORTED);

        if size == nb {
          self.set_inuse_bit_at_offset(victim, size);
          return Some(self.chunk2mem(victim));
        }

        // File into its bin, keeping largebins sorted by size descending.
        let victim_index;
        let mut bck2;
        let mut fwd2;
        if in_smallbin_range(size) {
          victim_index = smallbin_index(size);
          bck2 = bin_ref(victim_index);
          fwd2 = self.fd(bck2);
        } else {
          victim_index = largebin_index(size);
          bck2 = bin_ref(victim_index);
          fwd2 = self.fd(bck2);
          if fwd2 != bck2 {
            if size <= self.chunksize(self.bk(bck2)) {
              // Smaller than the smallest: straight to the tail.
              fwd2 = bck2;
              bck2 = self.bk(bck2);
            } else {
              while size < self.chunksize(fwd2) {
                fwd2 = self.fd(fwd2);
              }
              bck2 = self.bk(fwd2);
            }
          }
        }
        self.mark_bin(victim_index);
        self.set_bk(victim, bck2);
        self.set_fd(victim, fwd2);
        self.set_bk(fwd2, victim);
        self.set_fd(bck2, victim);
      }

      // For a large request, best-fit within its own bin: the list is
      // sorted, so walk up from the smallest until one fits.
      if !in_smallbin_range(nb) {
        let bin = bin_ref(idx);
        let mut victim = self.bk(bin);
        if victim != bin && self.chunksize(self.fd(bin)) >= nb {
          let mut size = self.chunksize(victim);
          while size < nb {
            victim = self.bk(victim);
            size = self.chunksize(victim);
          }
          let remainder_size = size - nb;
          self.unlink(victim);

          if remainder_size < MINSIZE {
            // Exhaust: a sub-MINSIZE remainder goes with the chunk.
            self.set_inuse_bit_at_offset(victim, size);
          } else {
            let remainder = victim + nb;
            self.bins[1] = Link { fd: remainder, bk: remainder };
            self.set_bk(remainder, UNSORTED);
            self.set_fd(remainder, UNSORTED);
            self.set_head(victim, nb | PREV_INUSE);
            self.set_head(remainder, remainder_size | PREV_INUSE);
            self.set_foot(remainder, remainder_size);
          }
          return Some(self.chunk2mem(victim));
        }
      }

      // First-fit across larger size classes, skipping known-empty bins via
      // the binmap.
      if let Some(mem) = self.search_binned(idx + 1, nb) {
        return Some(mem);
      }

      // Top: treated as larger (and thus worse fitting) than any other
      // chunk, since it can grow as far as the region allows.
      let victim = self.top;
      let size = self.chunksize(victim);
      if size >= nb + MINSIZE {
        let remainder_size = size - nb;
        let remainder = victim + nb;
        self.top = remainder;
        self.set_head(victim, nb | PREV_INUSE);
        self.set_head(remainder, remainder_size | PREV_INUSE);
        return Some(self.chunk2mem(victim));
      } else if self.have_fastchunks() {
        // Consolidate and retry before growing the region. Only small
        // requests can get here with fastchunks pending.
        debug_assert!(in_smallbin_range(nb));
        self.consolidate();
        idx = smallbin_index(nb);
      } else {
        return self.sysalloc(nb);
      }
    }
  }

  /// Binmap-driven scan of all bins past `start`; `None` means fall back to
  /// the top chunk.
  fn search_binned(&mut self, start: usize, nb: usize) -> Option<NonNull<u8>> {
    let mut idx = start;
    let mut block = idx_to_block(idx);
    if block >= BINMAP_SIZE {
      return None;
    }
    let mut map = self.binmap[block];
    let mut bit = idx_to_bit(idx);

    loop {
      // Skip the rest of this block if it has no more set bits.
      if bit > map || bit == 0 {
        loop {
          block += 1;
          if block >= BINMAP_SIZE {
            return None;
          }
          map = self.binmap[block];
          if map != 0 {
            break;
          }
        }
        idx = block << BINMAP_SHIFT;
        bit = 1;
      }

      // Advance to the set bit. There must be one in this block.
      while bit & map == 0 {
        idx += 1;
        bit <<= 1;
        debug_assert!(bit != 0);
      }

      let bin = bin_ref(idx);
      let victim = self.bk(bin);

      if victim == bin {
        // Stale bit: the bin drained since it was marked.
        map &= !bit;
        self.binmap[block] = map;
        idx += 1;
        bit <<= 1;
        continue;
      }

      // Anything in a later bin is big enough.
      let size = self.chunksize(victim);
      debug_assert!(size >= nb);
      let remainder_size = size - nb;

      let bck = self.bk(victim);
      self.set_bk(bin, bck);
      self.set_fd(bck, bin);

      if remainder_size < MINSIZE {
        self.set_inuse_bit_at_offset(victim, size);
      } else {
        let remainder = victim + nb;
        self.bins[1] = Link { fd: remainder, bk: remainder };
        self.set_bk(remainder, UNSORTED);
        self.set_fd(remainder, UNSORTED);
        if in_smallbin_range(nb) {
          self.last_remainder = remainder;
        }
        self.set_head(victim, nb | PREV_INUSE);
        self.set_head(remainder, remainder_size | PREV_INUSE);
        self.set_foot(remainder, remainder_size);
      }
      return Some(self.chunk2mem(victim));
    }
  }

  // ===========================================================================
  // Release
  // ===========================================================================

  /// Releases a block obtained from this heap. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `mem` must have come from this heap's `alloc`/`calloc`/`realloc` and
  /// must not have been freed already.
  pub unsafe fn free(&mut self, mem: *mut u8) {
    if mem.is_null() {
      return;
    }
    let head = unsafe { (mem.sub(WORD) as *const usize).read() };
    if head_is_mmapped(head) {
      self.free_mapped(mem, head);
      return;
    }

    let p = self.mem2ref(mem);
    let mut size = size_of_head(head);

    // Small chunks go straight onto a fastbin for quick reuse.
    if size <= self.max_fast {
      self.note_fastchunks();
      let idx = fastbin_index(size);
      let old_head = self.fastbins[idx];
      self.set_fd(p, old_head);
      self.fastbins[idx] = p;
      return;
    }

    // Everything else coalesces immediately.
    let mut chunk = p;
    let nextchunk = p + size;
    let nextsize = self.chunksize(nextchunk);

    if !self.prev_inuse(chunk) {
      let prevsize = self.prev_size(chunk);
      size += prevsize;
      chunk -= prevsize;
      self.unlink(chunk);
    }

    if nextchunk != self.top {
      let nextinuse = self.inuse_bit_at_offset(nextchunk, nextsize);
      self.set_head(nextchunk, nextsize);
      if !nextinuse {
        self.unlink(nextchunk);
        size += nextsize;
      }

      // Stage in the unsorted bin: the chunk gets one chance to be reused
      // before being filed by size.
      let fwd = self.fd(UNSORTED);
      self.set_bk(chunk, UNSORTED);
      self.set_fd(chunk, fwd);
      self.set_fd(UNSORTED, chunk);
      self.set_bk(fwd, chunk);

      self.set_head(chunk, size | PREV_INUSE);
      self.set_foot(chunk, size);
    } else {
      // Borders the high end of memory: absorb into top.
      size += nextsize;
      self.set_head(chunk, size | PREV_INUSE);
      self.top = chunk;
    }

    // A large free may have opened the way to reclaiming top space, but
    // fastbins bordering top hide the true top size. Consolidating on every
    // free would defeat the fastbins, so only do it past a threshold.
    if size >= FASTBIN_CONSOLIDATION_THRESHOLD {
      if self.have_fastchunks() {
        self.consolidate();
      }
      if self.chunksize(self.top) >= self.cfg.trim_threshold {
        self.systrim(self.cfg.top_pad);
      }
    }
  }

  // ===========================================================================
  // Resize
  // ===========================================================================

  /// Resizes a block, preserving the first `min(old usable, bytes)` bytes.
  /// `bytes == 0` frees; a null `mem` allocates.
  ///
  /// # Safety
  ///
  /// Same ownership contract as [`Heap::free`].
  pub unsafe fn realloc(&mut self, mem: *mut u8, bytes: usize) -> Option<NonNull<u8>> {
    if bytes == 0 {
      unsafe { self.free(mem) };
      return None;
    }
    if mem.is_null() {
      return self.alloc(bytes);
    }

    let nb = request2size(bytes)?;
    let head = unsafe { (mem.sub(WORD) as *const usize).read() };
    if head_is_mmapped(head) {
      return unsafe { self.realloc_mapped(mem, head, nb) };
    }

    let oldp = self.mem2ref(mem);
    let oldsize = size_of_head(head);

    let newp;
    let newsize;
    if oldsize >= nb {
      // Already big enough; the surplus is split off below.
      newp = oldp;
      newsize = oldsize;
    } else {
      let next = oldp + oldsize;
      let combined = oldsize + self.chunksize(next);

      if next == self.top && combined >= nb + MINSIZE {
        // Grow in place into top.
        self.set_head_size(oldp, nb);
        let newtop = oldp + nb;
        self.top = newtop;
        self.set_head(newtop, (combined - nb) | PREV_INUSE);
        return Some(self.chunk2mem(oldp));
      } else if next != self.top && !self.inuse(next) && combined >= nb {
        // Absorb the following free chunk; surplus split below.
        newp = oldp;
        newsize = combined;
        self.unlink(next);
      } else {
        let newmem = self.alloc_padded(nb)?;
        if !self.contains(newmem.as_ptr()) {
          // The search escalated to a standalone mapping.
          unsafe {
            ptr::copy_nonoverlapping(mem, newmem.as_ptr(), oldsize - WORD);
            self.free(mem);
          }
          return Some(newmem);
        }
        let cand = self.mem2ref(newmem.as_ptr());
        if cand == next {
          // The fresh chunk landed right behind the old one (it came from
          // top or the neighboring free space): merge instead of copying.
          newsize = self.chunksize(cand) + oldsize;
          newp = oldp;
        } else {
          unsafe {
            ptr::copy_nonoverlapping(mem, newmem.as_ptr(), oldsize - WORD);
            self.free(mem);
          }
          return Some(newmem);
        }
      }
    }

    // Give back any surplus worth keeping.
    debug_assert!(newsize >= nb);
    let remainder_size = newsize - nb;
    if remainder_size < MINSIZE {
      self.set_head_size(newp, newsize);
      self.set_inuse_bit_at_offset(newp, newsize);
    } else {
      let remainder = newp + nb;
      self.set_head_size(newp, nb);
      self.set_head(remainder, remainder_size | PREV_INUSE);
      // Mark in-use so free() treats it as a live chunk.
      self.set_inuse_bit_at_offset(remainder, remainder_size);
      let rmem = self.chunk2mem(remainder);
      unsafe { self.free(rmem.as_ptr()) };
    }
    Some(self.chunk2mem(newp))
  }

  /// Zero-initialized allocation of `count * size` bytes; the multiplication
  /// is overflow-checked.
  pub fn calloc(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
    let total = count.checked_mul(size)?;
    let mem = self.alloc(total)?;
    let head = unsafe { (mem.as_ptr().sub(WORD) as *const usize).read() };
    // Fresh mappings arrive zeroed from the store; only arena memory needs
    // clearing.
    if !head_is_mmapped(head) {
      unsafe { ptr::write_bytes(mem.as_ptr(), 0, size_of_head(head) - WORD) };
    }
    Some(mem)
  }

  /// Usable bytes behind a pointer returned by this heap.
  ///
  /// # Safety
  ///
  /// Same ownership contract as [`Heap::free`].
  pub unsafe fn usable_size(&self, mem: *mut u8) -> usize {
    if mem.is_null() {
      return 0;
    }
    let head = unsafe { (mem.sub(WORD) as *const usize).read() };
    if head_is_mmapped(head) {
      size_of_head(head) - MEM_OFFSET
    } else {
      size_of_head(head) - WORD
    }
  }

  // ===========================================================================
  // Backing store growth & trim
  // ===========================================================================

  /// Serves a request the free lists could not: outsized requests become
  /// standalone mappings, everything else extends `top` from the reserved
  /// region, committing whole granules.
  fn sysalloc(&mut self, nb: usize) -> Option<NonNull<u8>> {
    if nb >= self.cfg.mmap_threshold && self.n_mmaps < self.cfg.n_mmaps_max {
      if let Some(mem) = self.mapped_alloc(nb) {
        return Some(mem);
      }
      // Mapping failed; fall through and try the region.
    }

    if self.base.is_null() {
      let len = self.cfg.region_len;
      match self.store.reserve(len) {
        Ok(b) => {
          self.base = b.as_ptr();
          self.region_len = len;
        }
        Err(e) => {
          debug!("heap region reservation failed: {e}");
          return None;
        }
      }
    }

    let size = self.chunksize(self.top);
    debug_assert!(size < nb + MINSIZE);

    // Commit enough whole granules to cover the shortfall plus top slack.
    let needed = nb.checked_add(MINSIZE)? - size;
    let expand = needed.checked_add(GRANULE_SIZE - 1)? & !(GRANULE_SIZE - 1);
    debug!(
      "expand heap: request = {nb}, top remaining = {size}, expansion = {expand}"
    );
    if expand > self.region_len - self.wilderness {
      debug!("heap region exhausted ({} KB reserved)", self.region_len / 1024);
      return None;
    }

    let commit_at = NonNull::new(unsafe { self.base.add(self.wilderness) })?;
    if let Err(e) = self.store.commit(commit_at, expand) {
      debug!("heap commit failed: {e}");
      return None;
    }
    self.wilderness += expand;

    let newsize = if self.chunksize(self.top) == 0 {
      // First growth: plant top at the region base.
      self.top = 0;
      expand
    } else {
      size + expand
    };
    self.set_head(self.top, newsize | PREV_INUSE);
    debug!("heap expanded to {} KB", self.wilderness / 1024);

    // Carve the request out of the grown top.
    let p = self.top;
    let size = self.chunksize(p);
    let remainder_size = size - nb;
    let remainder = p + nb;
    self.top = remainder;
    self.set_head(p, nb | PREV_INUSE);
    self.set_head(remainder, remainder_size | PREV_INUSE);
    Some(self.chunk2mem(p))
  }

  /// Consolidates and attempts to return unused top-of-heap pages.
  pub fn trim(&mut self, pad: usize) -> bool {
    self.consolidate();
    self.systrim(pad)
  }

  /// Reclamation hook. Committed pages are never returned today; the
  /// reclaimable span is only reported.
  fn systrim(&mut self, pad: usize) -> bool {
    let top_size = self.chunksize(self.top);
    let extra =
      top_size.saturating_sub(pad + MINSIZE) / GRANULE_SIZE * GRANULE_SIZE;
    if extra > 0 {
      debug!("trim: {} KB reclaimable above top", extra / 1024);
    }
    false
  }

  // ===========================================================================
  // Standalone mappings
  // ===========================================================================
  //
  // Mapped chunks carry their alignment offset in prev_size, so release can
  // always unmap the exact original mapping.

  fn mapped_alloc(&mut self, nb: usize) -> Option<NonNull<u8>> {
    let pagemask = self.store.page_size() - 1;
    let size = nb.checked_add(WORD + pagemask)? & !pagemask;
    match self.store.map_fresh(size) {
      Ok(base) => {
        unsafe {
          (base.as_ptr() as *mut usize).write(0);
          (base.as_ptr().add(WORD) as *mut usize).write(size | IS_MMAPPED);
        }
        self.note_mapped(size);
        debug!("mapped outsized block: {} KB", size / 1024);
        NonNull::new(unsafe { base.as_ptr().add(MEM_OFFSET) })
      }
      Err(e) => {
        debug!("outsized mapping failed: {e}");
        None
      }
    }
  }

  /// Standalone mapping whose user pointer honors `align > ALIGNMENT`.
  pub(crate) fn alloc_mapped_aligned(
    &mut self,
    bytes: usize,
    align: usize,
  ) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two() && align > ALIGNMENT);
    let nb = request2size(bytes)?;
    let pagemask = self.store.page_size() - 1;
    let size = nb.checked_add(align + WORD + pagemask)? & !pagemask;
    let base = match self.store.map_fresh(size) {
      Ok(b) => b,
      Err(e) => {
        debug!("aligned mapping failed: {e}");
        return None;
      }
    };
    let base_addr = base.as_ptr() as usize;
    let mem_addr = align_up(base_addr + MEM_OFFSET, align);
    let chunk_addr = mem_addr - MEM_OFFSET;
    let offset = chunk_addr - base_addr;
    unsafe {
      (chunk_addr as *mut usize).write(offset);
      ((chunk_addr + WORD) as *mut usize).write((size - offset) | IS_MMAPPED);
    }
    self.note_mapped(size - offset);
    NonNull::new(mem_addr as *mut u8)
  }

  fn note_mapped(&mut self, accounted: usize) {
    self.n_mmaps += 1;
    self.max_n_mmaps = self.max_n_mmaps.max(self.n_mmaps);
    self.mmapped_bytes += accounted;
  }

  fn free_mapped(&mut self, mem: *mut u8, head: usize) {
    let size = size_of_head(head);
    let chunk_addr = mem as usize - MEM_OFFSET;
    let offset = unsafe { (chunk_addr as *const usize).read() };
    self.n_mmaps = self.n_mmaps.saturating_sub(1);
    self.mmapped_bytes = self.mmapped_bytes.saturating_sub(size);
    debug!("release mapped block: {} KB", size / 1024);
    if let Some(base) = NonNull::new((chunk_addr - offset) as *mut u8) {
      if let Err(e) = self.store.unmap(base, size + offset) {
        debug!("unmap of mapped block failed: {e}");
      }
    }
  }

  unsafe fn realloc_mapped(
    &mut self,
    mem: *mut u8,
    head: usize,
    nb: usize,
  ) -> Option<NonNull<u8>> {
    let oldsize = size_of_head(head);
    let chunk_addr = mem as usize - MEM_OFFSET;
    let offset = unsafe { (chunk_addr as *const usize).read() };
    let pagemask = self.store.page_size() - 1;
    let newlen = nb.checked_add(offset + WORD + pagemask)? & !pagemask;

    // Still inside the same pages: nothing to do.
    if oldsize == newlen - offset {
      return NonNull::new(mem);
    }

    let map_base = NonNull::new((chunk_addr - offset) as *mut u8)?;
    if let Some(newbase) = self.store.remap(map_base, oldsize + offset, newlen) {
      let new_chunk = newbase.as_ptr() as usize + offset;
      unsafe {
        // prev_size still holds the offset; only the size word changes.
        ((new_chunk + WORD) as *mut usize).write((newlen - offset) | IS_MMAPPED);
      }
      self.mmapped_bytes =
        self.mmapped_bytes.saturating_sub(oldsize) + (newlen - offset);
      return NonNull::new((new_chunk + MEM_OFFSET) as *mut u8);
    }

    // No remap primitive: shrink in place if the pages already cover it.
    if oldsize >= nb + WORD {
      return NonNull::new(mem);
    }

    let newmem = self.alloc_padded(nb)?;
    unsafe {
      ptr::copy_nonoverlapping(mem, newmem.as_ptr(), oldsize - MEM_OFFSET);
      self.free(mem);
    }
    Some(newmem)
  }
}

impl<B: BackingStore> Drop for Heap<B> {
  fn drop(&mut self) {
    // Outstanding standalone mappings are the caller's to release; the
    // region itself goes back wholesale.
    if let Some(base) = NonNull::new(self.base) {
      let _ = self.store.unmap(base, self.region_len);
    }
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vm::VmError;
  use std::alloc::{Layout, alloc_zeroed, dealloc};
  use std::cell::RefCell;
  use std::collections::HashMap;
  use std::rc::Rc;

  // ---------------------------------------------------------------------------
  // Recording in-process backing store
  // ---------------------------------------------------------------------------

  #[derive(Default)]
  struct Tape {
    reserves: usize,
    commits: Vec<usize>,
    maps: Vec<(usize, usize)>,
    unmaps: Vec<(usize, usize)>,
    /// addr -> allocated length, for every mapping still live.
    live: HashMap<usize, usize>,
  }

  struct MockStore {
    tape: Rc<RefCell<Tape>>,
  }

  impl MockStore {
    fn new() -> (Self, Rc<RefCell<Tape>>) {
      let tape = Rc::new(RefCell::new(Tape::default()));
      (Self { tape: tape.clone() }, tape)
    }

    fn grab(&mut self, len: usize) -> Result<NonNull<u8>, VmError> {
      let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
      let ptr = unsafe { alloc_zeroed(layout) };
      let ptr = NonNull::new(ptr).ok_or(VmError::MapFailed { len })?;
      self.tape.borrow_mut().live.insert(ptr.as_ptr() as usize, len);
      Ok(ptr)
    }
  }

  impl BackingStore for MockStore {
    fn reserve(&mut self, len: usize) -> Result<NonNull<u8>, VmError> {
      let ptr = self.grab(len)?;
      self.tape.borrow_mut().reserves += 1;
      Ok(ptr)
    }

    fn commit(&mut self, _addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
      // The whole mock region is writable from the start; just record it.
      self.tape.borrow_mut().commits.push(len);
      Ok(())
    }

    fn map_fresh(&mut self, len: usize) -> Result<NonNull<u8>, VmError> {
      let ptr = self.grab(len)?;
      self.tape.borrow_mut().maps.push((ptr.as_ptr() as usize, len));
      Ok(ptr)
    }

    fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), VmError> {
      let mut tape = self.tape.borrow_mut();
      tape.unmaps.push((addr.as_ptr() as usize, len));
      let stored = tape
        .live
        .remove(&(addr.as_ptr() as usize))
        .expect("unmap of unknown mapping");
      assert_eq!(stored, len, "unmap length differs from the mapped length");
      drop(tape);
      let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
      unsafe { dealloc(addr.as_ptr(), layout) };
      Ok(())
    }
  }

  const TEST_REGION: usize = 8 * 1024 * 1024;

  fn new_heap() -> (Heap<MockStore>, Rc<RefCell<Tape>>) {
    let (store, tape) = MockStore::new();
    let cfg = HeapConfig { region_len: TEST_REGION, ..HeapConfig::default() };
    (Heap::with_config(store, cfg), tape)
  }

  // ---------------------------------------------------------------------------
  // Invariant checking
  // ---------------------------------------------------------------------------

  #[derive(Debug, Clone, PartialEq, Eq)]
  struct Snapshot {
    chunks: Vec<(usize, usize, bool)>,
    top: usize,
    last_remainder: usize,
    fastbins: Vec<usize>,
    bins: Vec<Link>,
    binmap: [u32; BINMAP_SIZE],
  }

  fn snapshot(h: &Heap<MockStore>) -> Snapshot {
    let mut chunks = Vec::new();
    if !h.base.is_null() && !is_bin(h.top) {
      let mut r = 0usize;
      while r < h.top {
        let size = h.chunksize(r);
        assert!(size >= MINSIZE, "chunk at {r} smaller than MINSIZE");
        assert_eq!(size % ALIGNMENT, 0, "misaligned chunk size at {r}");
        chunks.push((r, size, h.inuse(r)));
        r += size;
      }
      assert_eq!(r, h.top, "chunk walk must land exactly on top");
    }
    Snapshot {
      chunks,
      top: h.top,
      last_remainder: h.last_remainder,
      fastbins: h.fastbins.to_vec(),
      bins: h.bins.to_vec(),
      binmap: h.binmap,
    }
  }

  /// Full walk of the managed region checking the boundary-tag invariants:
  /// continuity (no overlap, no gaps), footers under free chunks, successor
  /// in-use bits mirroring each chunk's state, and no two adjacent free
  /// chunks. Fastbin chunks keep their in-use bit set, so the adjacency
  /// invariant holds bitwise even while they are pending.
  fn check_invariants(h: &Heap<MockStore>) {
    let snap = snapshot(h);
    let mut prev_used = true; // region start counts as in use
    for &(r, size, used) in &snap.chunks {
      assert_eq!(
        h.prev_inuse(r),
        prev_used,
        "prev-inuse bit wrong at {r}"
      );
      if !used {
        assert!(prev_used, "adjacent free chunks at {r}");
        assert_eq!(h.word(r + size), size, "free chunk footer wrong at {r}");
      }
      prev_used = used;
    }
    if !is_bin(h.top) {
      assert_eq!(h.prev_inuse(h.top), prev_used, "top prev-inuse bit wrong");
      assert_eq!(
        h.top + h.chunksize(h.top),
        h.wilderness,
        "top must end exactly at the wilderness boundary"
      );
    }
  }

  fn fill(p: NonNull<u8>, len: usize, tag: u8) {
    unsafe { ptr::write_bytes(p.as_ptr(), tag, len) };
  }

  fn verify(p: NonNull<u8>, len: usize, tag: u8) {
    let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), len) };
    assert!(bytes.iter().all(|&b| b == tag), "contents clobbered");
  }

  // ---------------------------------------------------------------------------
  // Basic operation
  // ---------------------------------------------------------------------------

  #[test]
  fn alloc_write_free() {
    let (mut h, _t) = new_heap();
    let p = h.alloc(100).unwrap();
    fill(p, 100, 0xA5);
    verify(p, 100, 0xA5);
    assert!(unsafe { h.usable_size(p.as_ptr()) } >= 100);
    unsafe { h.free(p.as_ptr()) };
    check_invariants(&h);
  }

  #[test]
  fn zero_byte_request_is_valid() {
    let (mut h, _t) = new_heap();
    let p = h.alloc(0).unwrap();
    assert!(unsafe { h.usable_size(p.as_ptr()) } >= MINSIZE - WORD);
    unsafe { h.free(p.as_ptr()) };
  }

  #[test]
  fn free_null_is_noop() {
    let (mut h, _t) = new_heap();
    unsafe { h.free(ptr::null_mut()) };
    assert_eq!(h.stats().committed, 0);
  }

  #[test]
  fn absurd_request_is_rejected() {
    let (mut h, _t) = new_heap();
    assert!(h.alloc(usize::MAX).is_none());
    assert!(h.alloc(usize::MAX - WORD).is_none());
  }

  #[test]
  fn returned_pointers_are_aligned() {
    let (mut h, _t) = new_heap();
    for req in [0, 1, 7, 16, 17, 100, 400, 4096, 70_000] {
      let p = h.alloc(req).unwrap();
      assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0, "req {req} misaligned");
      unsafe { h.free(p.as_ptr()) };
    }
    let c = h.calloc(3, 100).unwrap();
    assert_eq!(c.as_ptr() as usize % ALIGNMENT, 0);
  }

  // ---------------------------------------------------------------------------
  // Reuse policy & backing-store traffic
  // ---------------------------------------------------------------------------

  #[test]
  fn fastbin_reuse_is_lifo() {
    let (mut h, _t) = new_heap();
    let _a16 = h.alloc(16).unwrap();
    let b400 = h.alloc(400).unwrap();
    let c16 = h.alloc(16).unwrap();
    let _d4096 = h.alloc(4096).unwrap();

    unsafe {
      h.free(b400.as_ptr());
      h.free(c16.as_ptr());
    }

    // The freed 16-byte chunk must come back, not a slice of the 400-byte
    // region.
    let e = h.alloc(16).unwrap();
    assert_eq!(e, c16);
    assert_ne!(e, b400);
  }

  #[test]
  fn small_churn_never_recommits() {
    let (mut h, tape) = new_heap();
    let p = h.alloc(64).unwrap();
    unsafe { h.free(p.as_ptr()) };
    let commits_after_first = tape.borrow().commits.len();
    assert_eq!(commits_after_first, 1);
    assert_eq!(tape.borrow().reserves, 1);

    for _ in 0..200 {
      let p = h.alloc(64).unwrap();
      unsafe { h.free(p.as_ptr()) };
    }
    // Every request after the first was served from freed memory.
    assert_eq!(tape.borrow().commits.len(), commits_after_first);
    assert_eq!(tape.borrow().reserves, 1);
  }

  #[test]
  fn outsized_block_maps_and_unmaps_exactly() {
    let (mut h, tape) = new_heap();
    let big = h.alloc(2 * 1024 * 1024).unwrap();
    fill(big, 2 * 1024 * 1024, 0x3C);

    let (map_addr, map_len) = {
      let t = tape.borrow();
      assert_eq!(t.maps.len(), 1);
      // Bins and region were never touched.
      assert_eq!(t.reserves, 0);
      assert!(t.commits.is_empty());
      t.maps[0]
    };
    assert_eq!(h.stats().n_mmaps, 1);
    assert_eq!(h.stats().max_n_mmaps, 1);

    unsafe { h.free(big.as_ptr()) };
    assert_eq!(tape.borrow().unmaps.last(), Some(&(map_addr, map_len)));
    assert_eq!(h.stats().n_mmaps, 0);
    assert_eq!(h.stats().mmapped_bytes, 0);
  }

  #[test]
  fn calloc_returns_zeroed_memory() {
    let (mut h, _t) = new_heap();
    // Dirty some memory first so reuse paths would show through.
    let d = h.alloc(8000).unwrap();
    fill(d, 8000, 0xFF);
    unsafe { h.free(d.as_ptr()) };

    let p = h.calloc(1000, 8).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 8000) };
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn calloc_overflow_is_rejected() {
    let (mut h, _t) = new_heap();
    assert!(h.calloc(usize::MAX, 2).is_none());
    assert!(h.calloc(2, usize::MAX).is_none());
  }

  #[test]
  fn calloc_mapped_block_is_zeroed() {
    let (mut h, _t) = new_heap();
    let len = 2 * 1024 * 1024;
    let p = h.calloc(1, len).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), len) };
    assert!(bytes.iter().step_by(4096).all(|&b| b == 0));
    unsafe { h.free(p.as_ptr()) };
  }

  // ---------------------------------------------------------------------------
  // Exact fit & locality
  // ---------------------------------------------------------------------------

  #[test]
  fn exact_binned_chunk_is_not_split() {
    let (mut h, _t) = new_heap();
    let a = h.alloc(400).unwrap();
    let _guard = h.alloc(16).unwrap(); // keep a away from top
    let usable = unsafe { h.usable_size(a.as_ptr()) };
    unsafe { h.free(a.as_ptr()) };

    let b = h.alloc(400).unwrap();
    assert_eq!(b, a);
    assert_eq!(unsafe { h.usable_size(b.as_ptr()) }, usable);
  }

  #[test]
  fn last_remainder_keeps_small_runs_adjacent() {
    let (mut h, _t) = new_heap();
    let blk = h.alloc(4000).unwrap();
    let _guard = h.alloc(16).unwrap();
    unsafe { h.free(blk.as_ptr()) };

    // First small request splits the binned block; the following ones carve
    // consecutive pieces off its remainder.
    let p1 = h.alloc(16).unwrap();
    let p2 = h.alloc(16).unwrap();
    let p3 = h.alloc(16).unwrap();
    assert_eq!(p1, blk);
    assert_eq!(p2.as_ptr() as usize, p1.as_ptr() as usize + MINSIZE);
    assert_eq!(p3.as_ptr() as usize, p2.as_ptr() as usize + MINSIZE);
    check_invariants(&h);
  }

  // ---------------------------------------------------------------------------
  // Consolidation
  // ---------------------------------------------------------------------------

  #[test]
  fn consolidation_is_idempotent() {
    let (mut h, _t) = new_heap();
    let small: Vec<_> = (0..8).map(|_| h.alloc(24).unwrap()).collect();
    let medium: Vec<_> = (0..4).map(|_| h.alloc(64).unwrap()).collect();
    let _guard = h.alloc(16).unwrap();
    for p in small.iter().step_by(2).chain(medium.iter()) {
      unsafe { h.free(p.as_ptr()) };
    }
    assert!(h.have_fastchunks());

    h.consolidate();
    let first = snapshot(&h);
    assert!(!h.have_fastchunks());

    h.consolidate();
    assert_eq!(snapshot(&h), first);
    check_invariants(&h);
  }

  #[test]
  fn coalescing_rebuilds_contiguous_block() {
    let (mut h, _t) = new_heap();
    // Three neighbors, freed in an order that exercises both merge
    // directions, plus a guard against top absorption.
    let a = h.alloc(200).unwrap();
    let b = h.alloc(200).unwrap();
    let c = h.alloc(200).unwrap();
    let _guard = h.alloc(16).unwrap();
    unsafe {
      h.free(a.as_ptr());
      h.free(c.as_ptr());
      h.free(b.as_ptr()); // merges with both sides
    }
    check_invariants(&h);
    // One merged chunk now covers all three; an allocation of the combined
    // payload must succeed without touching the backing store again.
    let combined = 3 * 208 - WORD;
    let big = h.alloc(combined).unwrap();
    assert_eq!(big, a);
  }

  // ---------------------------------------------------------------------------
  // Realloc
  // ---------------------------------------------------------------------------

  #[test]
  fn realloc_preserves_prefix_across_moves() {
    let (mut h, _t) = new_heap();
    let p = h.alloc(100).unwrap();
    for i in 0..100 {
      unsafe { p.as_ptr().add(i).write(i as u8) };
    }

    // Grow within the region (possibly in place via top)...
    let q = unsafe { h.realloc(p.as_ptr(), 3000) }.unwrap();
    for i in 0..100 {
      assert_eq!(unsafe { q.as_ptr().add(i).read() }, i as u8);
    }

    // ...then escalate to a standalone mapping.
    let r = unsafe { h.realloc(q.as_ptr(), 2 * 1024 * 1024) }.unwrap();
    for i in 0..100 {
      assert_eq!(unsafe { r.as_ptr().add(i).read() }, i as u8);
    }
    unsafe { h.free(r.as_ptr()) };
    check_invariants(&h);
  }

  #[test]
  fn realloc_grows_in_place_into_top() {
    let (mut h, _t) = new_heap();
    let p = h.alloc(100).unwrap(); // borders top
    fill(p, 100, 0x42);
    let q = unsafe { h.realloc(p.as_ptr(), 5000) }.unwrap();
    assert_eq!(q, p);
    verify(p, 100, 0x42);
    check_invariants(&h);
  }

  #[test]
  fn realloc_absorbs_following_free_chunk() {
    let (mut h, _t) = new_heap();
    let a = h.alloc(100).unwrap();
    let b = h.alloc(200).unwrap();
    let _guard = h.alloc(16).unwrap();
    unsafe { h.free(b.as_ptr()) };

    fill(a, 100, 0x17);
    let c = unsafe { h.realloc(a.as_ptr(), 250) }.unwrap();
    assert_eq!(c, a, "should extend into the free neighbor");
    verify(a, 100, 0x17);
    check_invariants(&h);
  }

  #[test]
  fn realloc_shrink_stays_put_and_frees_surplus() {
    let (mut h, _t) = new_heap();
    let a = h.alloc(1000).unwrap();
    let _guard = h.alloc(16).unwrap();
    fill(a, 1000, 0x99);
    let b = unsafe { h.realloc(a.as_ptr(), 100) }.unwrap();
    assert_eq!(b, a);
    verify(a, 100, 0x99);
    // The split-off tail is reusable.
    let c = h.alloc(800).unwrap();
    assert!(c != a);
    check_invariants(&h);
  }

  #[test]
  fn realloc_edge_cases() {
    let (mut h, _t) = new_heap();
    // Null pointer behaves as alloc.
    let p = unsafe { h.realloc(ptr::null_mut(), 64) }.unwrap();
    // Zero size behaves as free.
    assert!(unsafe { h.realloc(p.as_ptr(), 0) }.is_none());
    check_invariants(&h);
  }

  #[test]
  fn realloc_mapped_block_without_remap_support() {
    let (mut h, _t) = new_heap();
    let len = 2 * 1024 * 1024;
    let p = h.alloc(len).unwrap();
    fill(p, 64, 0x7E);

    // Shrink: pages already cover it, pointer unchanged.
    let q = unsafe { h.realloc(p.as_ptr(), len / 2) }.unwrap();
    assert_eq!(q, p);

    // Grow: the mock store has no remap, so this copies.
    let r = unsafe { h.realloc(q.as_ptr(), len * 2) }.unwrap();
    verify(r, 64, 0x7E);
    unsafe { h.free(r.as_ptr()) };
    assert_eq!(h.stats().n_mmaps, 0);
  }

  // ---------------------------------------------------------------------------
  // Exhaustion & trim
  // ---------------------------------------------------------------------------

  #[test]
  fn exhaustion_is_recoverable() {
    let (store, _tape) = MockStore::new();
    let cfg = HeapConfig {
      region_len: 2 * GRANULE_SIZE,
      n_mmaps_max: 0, // force everything through the region
      ..HeapConfig::default()
    };
    let mut h = Heap::with_config(store, cfg);

    let a = h.alloc(200 * 1024).unwrap();
    // The region is spent; this must fail cleanly, not abort.
    assert!(h.alloc(100 * 1024).is_none());

    // Freeing makes room again.
    unsafe { h.free(a.as_ptr()) };
    assert!(h.alloc(100 * 1024).is_some());
  }

  #[test]
  fn trim_is_a_stub_and_top_never_shrinks() {
    let (mut h, _t) = new_heap();
    let p = h.alloc(500 * 1024).unwrap();
    unsafe { h.free(p.as_ptr()) };
    let committed = h.stats().committed;
    assert!(!h.trim(0));
    assert_eq!(h.stats().committed, committed);
    check_invariants(&h);
  }

  #[test]
  fn disabled_fastbins_still_recycle() {
    let (mut h, _t) = new_heap();
    h.set_max_fast(0);
    let p = h.alloc(16).unwrap();
    unsafe { h.free(p.as_ptr()) };
    assert!(h.fastbins.iter().all(|&f| f == NIL));
    let q = h.alloc(16).unwrap();
    assert_eq!(q, p);
  }

  #[test]
  fn drop_releases_the_region() {
    let tape;
    {
      let (mut h, t) = new_heap();
      tape = t;
      let p = h.alloc(100).unwrap();
      unsafe { h.free(p.as_ptr()) };
    }
    let t = tape.borrow();
    assert!(t.live.is_empty(), "everything must be unmapped after drop");
    assert_eq!(t.unmaps.last().map(|&(_, l)| l), Some(TEST_REGION));
  }

  // ---------------------------------------------------------------------------
  // Deterministic stress trace
  // ---------------------------------------------------------------------------

  fn lcg(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
    *state
  }

  fn pick_size(r: u64) -> usize {
    match r % 10 {
      0..=5 => 1 + (r >> 4) as usize % 500,
      6..=8 => 1 + (r >> 4) as usize % 8192,
      _ => 1 + (r >> 4) as usize % 150_000,
    }
  }

  #[test]
  fn stress_trace_holds_invariants_and_contents() {
    let (mut h, _t) = new_heap();
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    let mut rng = 0xA5A5_5A5A_DEAD_BEEF_u64;

    for step in 0..3000u32 {
      let r = lcg(&mut rng);
      match r % 4 {
        0 | 1 => {
          let size = pick_size(r >> 8);
          if let Some(p) = h.alloc(size) {
            let tag = (r >> 32) as u8;
            fill(p, size, tag);
            live.push((p, size, tag));
          }
        }
        2 => {
          if !live.is_empty() {
            let i = (r as usize >> 16) % live.len();
            let (p, size, tag) = live.swap_remove(i);
            verify(p, size, tag);
            unsafe { h.free(p.as_ptr()) };
          }
        }
        _ => {
          if !live.is_empty() {
            let i = (r as usize >> 16) % live.len();
            let (p, size, tag) = live[i];
            let new_size = pick_size(r >> 40);
            if let Some(np) = unsafe { h.realloc(p.as_ptr(), new_size) } {
              let keep = size.min(new_size);
              verify(np, keep, tag);
              let new_tag = tag.wrapping_add(1);
              fill(np, new_size, new_tag);
              live[i] = (np, new_size, new_tag);
            }
          }
        }
      }

      check_invariants(&h);

      // Periodic pairwise overlap check over the live set.
      if step % 256 == 0 {
        for (i, &(p, len, _)) in live.iter().enumerate() {
          let (a0, a1) = (p.as_ptr() as usize, p.as_ptr() as usize + len);
          for &(q, qlen, _) in live.iter().skip(i + 1) {
            let (b0, b1) = (q.as_ptr() as usize, q.as_ptr() as usize + qlen);
            assert!(a1 <= b0 || b1 <= a0, "live blocks overlap");
          }
        }
      }
    }

    for (p, size, tag) in live.drain(..) {
      verify(p, size, tag);
      unsafe { h.free(p.as_ptr()) };
    }
    h.consolidate();
    check_invariants(&h);
    assert_eq!(h.stats().n_mmaps, 0);
  }
}
