//! Boundary-tag constants, flag packing and bin index schedules.
//!
//! Everything here is pure arithmetic over `usize`; the heap proper reads and
//! writes the actual tag words through its arena accessors.

use core::mem::size_of;

// =============================================================================
// Alignment & chunk geometry
// =============================================================================

/// One accounting word.
pub const WORD: usize = size_of::<usize>();

/// Chunks and user pointers are aligned to two words.
pub const ALIGNMENT: usize = 2 * WORD;
pub const ALIGN_MASK: usize = ALIGNMENT - 1;

/// Smallest physical chunk: prev_size + head + fd + bk.
pub const MIN_CHUNK_SIZE: usize = 4 * WORD;

/// The smallest chunk we ever carve or keep: an aligned minimal chunk.
pub const MINSIZE: usize = (MIN_CHUNK_SIZE + ALIGN_MASK) & !ALIGN_MASK;

/// Offset from chunk start to the user data (past prev_size + head).
pub const MEM_OFFSET: usize = 2 * WORD;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MINSIZE % ALIGNMENT == 0);
const _: () = assert!(MEM_OFFSET % WORD == 0);

/// Rounds `x` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  (x + align - 1) & !(align - 1)
}

/// Pads a request to chunk size: one word of head overhead plus alignment,
/// never below `MINSIZE`. Unchecked; use [`request2size`] for caller input.
#[inline(always)]
pub const fn pad_request(req: usize) -> usize {
  if req + WORD + ALIGN_MASK < MINSIZE {
    MINSIZE
  } else {
    (req + WORD + ALIGN_MASK) & !ALIGN_MASK
  }
}

/// Checked form of [`pad_request`]: rejects sizes that would wrap `usize`.
#[inline]
pub fn request2size(req: usize) -> Option<usize> {
  req.checked_add(WORD + ALIGN_MASK)?;
  Some(pad_request(req))
}

// =============================================================================
// Head word flags
// =============================================================================

/// Low bit of the head word: the *previous* physical chunk is in use.
pub const PREV_INUSE: usize = 0x1;

/// Second bit: this chunk is a standalone mapping, never coalesced or binned.
pub const IS_MMAPPED: usize = 0x2;

/// Bits masked off when extracting a chunk size from its head word.
pub const SIZE_BITS: usize = PREV_INUSE | IS_MMAPPED;

/// Chunk size from a head word, flags stripped.
#[inline(always)]
pub const fn size_of_head(head: usize) -> usize {
  head & !SIZE_BITS
}

#[inline(always)]
pub const fn head_prev_inuse(head: usize) -> bool {
  head & PREV_INUSE != 0
}

#[inline(always)]
pub const fn head_is_mmapped(head: usize) -> bool {
  head & IS_MMAPPED != 0
}

// =============================================================================
// Bins
// =============================================================================
//
// 128 doubly-linked bins. Bin 0 is unused, bin 1 stages unsorted chunks,
// bins below `MIN_LARGE_SIZE` hold exactly one size each, and the rest are
// approximately logarithmically spaced:
//
//   64 bins of size       8
//   32 bins of size      64
//   16 bins of size     512
//    8 bins of size    4096
//    4 bins of size   32768
//    2 bins of size  262144
//    1 bin  for whatever is left
//
// The bins top out around 1MB because larger requests are served by
// standalone mappings.

pub const NBINS: usize = 128;
pub const SMALLBIN_WIDTH: usize = 8;
pub const MIN_LARGE_SIZE: usize = 512;

#[inline(always)]
pub const fn in_smallbin_range(sz: usize) -> bool {
  sz < MIN_LARGE_SIZE
}

#[inline(always)]
pub const fn smallbin_index(sz: usize) -> usize {
  sz >> 3
}

/// There is a little slop in these boundaries for the sake of speed; it makes
/// no difference elsewhere.
#[inline(always)]
pub const fn largebin_index(sz: usize) -> usize {
  if (sz >> 6) <= 32 {
    56 + (sz >> 6)
  } else if (sz >> 9) <= 20 {
    91 + (sz >> 9)
  } else if (sz >> 12) <= 10 {
    110 + (sz >> 12)
  } else if (sz >> 15) <= 4 {
    119 + (sz >> 15)
  } else if (sz >> 18) <= 2 {
    124 + (sz >> 18)
  } else {
    126
  }
}

#[inline(always)]
pub const fn bin_index(sz: usize) -> usize {
  if in_smallbin_range(sz) {
    smallbin_index(sz)
  } else {
    largebin_index(sz)
  }
}

const _: () = assert!(largebin_index(MIN_LARGE_SIZE) == 64);
const _: () = assert!(smallbin_index(MIN_LARGE_SIZE - ALIGNMENT) < 64);
const _: () = assert!(largebin_index(usize::MAX >> 1) == 126);

// =============================================================================
// Binmap
// =============================================================================
//
// One bit per bin, recording bins that are definitely non-empty. Bits are not
// cleared eagerly when a bin drains; the bin search clears them lazily when a
// marked bin turns out to be empty.

pub const BINMAP_SHIFT: usize = 5;
pub const BITS_PER_MAP: usize = 1 << BINMAP_SHIFT;
pub const BINMAP_SIZE: usize = NBINS / BITS_PER_MAP;

#[inline(always)]
pub const fn idx_to_block(i: usize) -> usize {
  i >> BINMAP_SHIFT
}

#[inline(always)]
pub const fn idx_to_bit(i: usize) -> u32 {
  1u32 << (i & (BITS_PER_MAP - 1))
}

// =============================================================================
// Fastbins
// =============================================================================
//
// Singly-linked LIFO lists of recently freed small chunks. Fastbin chunks
// keep the in-use bit of their successor set, so they are invisible to
// coalescing until a consolidation pass drains them.

/// The largest request size eligible for fastbin treatment.
pub const MAX_FAST_SIZE: usize = 80;

/// Offset 2 reuses the otherwise unindexable first two size classes.
#[inline(always)]
pub const fn fastbin_index(sz: usize) -> usize {
  (sz >> 3) - 2
}

pub const NFASTBINS: usize = fastbin_index(pad_request(MAX_FAST_SIZE)) + 1;

/// A chunk this large arriving in `free` triggers a consolidation of any
/// pending fastbin chunks, and possibly a trim attempt afterwards.
pub const FASTBIN_CONSOLIDATION_THRESHOLD: usize = 65536;

const _: () = assert!(fastbin_index(MINSIZE) < NFASTBINS);
const _: () = assert!(fastbin_index(pad_request(MAX_FAST_SIZE)) < NFASTBINS);

// Flags stored in the low bits of `max_fast`, which only ever holds sizes
// with the bottom bits clear.
//
// FASTCHUNKS_BIT is inverted: clear means "there may be fastbin chunks".
// The all-zero startup state therefore reads as having fastchunks, which is
// what routes the very first allocation through the initialization path in
// consolidate.

pub const FASTCHUNKS_BIT: usize = 1;

/// Set when the backing store cannot extend the region contiguously.
/// Preserved across `set_max_fast`; this port never needs to set it.
pub const NONCONTIGUOUS_BIT: usize = 2;

// =============================================================================
// Tunable defaults & region geometry
// =============================================================================

pub const DEFAULT_MAX_FAST: usize = 64;
pub const DEFAULT_TRIM_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_TOP_PAD: usize = 0;
pub const DEFAULT_MMAP_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_MMAP_MAX: usize = 65536;

/// Backing-store page granularity assumed when a store does not say.
pub const PAGE_SIZE: usize = 4096;

/// The managed region is committed in whole granules of this size.
pub const GRANULE_SIZE: usize = 128 * 1024;

/// Default length of the reserved virtual region.
pub const REGION_SIZE: usize = 32 * 1024 * 1024;

const _: () = assert!(GRANULE_SIZE % PAGE_SIZE == 0);
const _: () = assert!(REGION_SIZE % GRANULE_SIZE == 0);
const _: () = assert!(DEFAULT_MMAP_THRESHOLD > MAX_FAST_SIZE);

// =============================================================================
// Tests
// =============================================================================
