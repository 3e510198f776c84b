//! Segregated free lists.
//!
//! Each bucket is an intrusive doubly-linked list whose link words overlay the
//! payload of its free blocks. New blocks are pushed at the head; searches run
//! from the tail, so the oldest free block of a bucket is tried first.
//!
//! ```text
//!   head                                      tail
//!    │                                          │
//!    ▼   next_link ─►      next_link ─►         ▼
//!  ┌────┐           ┌────┐           ┌────┐
//!  │ B3 │           │ B2 │           │ B1 │
//!  └────┘  ◄─ prev_link    ◄─ prev_link └────┘
//! ```

use crate::block::{Block, Codec};
use crate::config::BUCKET_COUNT;

// =============================================================================
// Size Classes
// =============================================================================

/// Bucket index for a free block of `size` bytes.
///
/// `floor(log2(size)) - 5`, clamped to `0..BUCKET_COUNT`: sizes below 64 share
/// bucket 0 and sizes of 512 and up share the last bucket.
#[inline(always)]
pub const fn size_class(size: usize) -> usize {
  if size <= 1 {
    return 0;
  }
  let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
  if log2 <= 5 {
    0
  } else if log2 > 8 {
    BUCKET_COUNT - 1
  } else {
    log2 - 5
  }
}

const _: () = assert!(size_class(1 << 5) == 0);
const _: () = assert!(size_class(usize::MAX) == BUCKET_COUNT - 1);

// =============================================================================
// Buckets
// =============================================================================

#[derive(Clone, Copy)]
struct Bucket {
  head: Option<Block>,
  tail: Option<Block>,
}

impl Bucket {
  const EMPTY: Bucket = Bucket {
    head: None,
    tail: None,
  };
}

/// The five buckets plus the running count of free blocks across them.
pub(crate) struct FreeLists {
  buckets: [Bucket; BUCKET_COUNT],
  free_blocks: usize,
}

impl FreeLists {
  pub(crate) const fn new() -> Self {
    Self {
      buckets: [Bucket::EMPTY; BUCKET_COUNT],
      free_blocks: 0,
    }
  }

  #[inline(always)]
  pub(crate) fn free_blocks(&self) -> usize {
    self.free_blocks
  }

  #[inline(always)]
  pub(crate) fn head(&self, index: usize) -> Option<Block> {
    self.buckets[index].head
  }

  #[inline(always)]
  pub(crate) fn tail(&self, index: usize) -> Option<Block> {
    self.buckets[index].tail
  }

  /// Push `block` at the head of bucket `index`.
  ///
  /// # Safety
  /// `block` must be a free block of at least `MIN_BLOCK_SIZE` bytes that is
  /// not already linked into any bucket.
  pub(crate) unsafe fn enqueue(&mut self, codec: Codec, block: Block, index: usize) {
    let bucket = &mut self.buckets[index];
    unsafe {
      codec.set_prev_link(block, None);
      codec.set_next_link(block, bucket.head);
      match bucket.head {
        Some(old_head) => codec.set_prev_link(old_head, Some(block)),
        None => bucket.tail = Some(block),
      }
    }
    bucket.head = Some(block);
    self.free_blocks += 1;
  }

  /// Unlink `block` from bucket `index`.
  ///
  /// # Safety
  /// `block` must currently be linked into bucket `index`. Passing any other
  /// index corrupts that bucket.
  pub(crate) unsafe fn dequeue(&mut self, codec: Codec, block: Block, index: usize) {
    let bucket = &mut self.buckets[index];
    let (prev, next) = unsafe { (codec.prev_link(block), codec.next_link(block)) };

    match (prev, next) {
      // Only element
      (None, None) => {
        debug_assert_eq!(bucket.head, Some(block));
        debug_assert_eq!(bucket.tail, Some(block));
        bucket.head = None;
        bucket.tail = None;
      }
      // Head
      (None, Some(next)) => {
        debug_assert_eq!(bucket.head, Some(block));
        unsafe { codec.set_prev_link(next, None) };
        bucket.head = Some(next);
      }
      // Tail
      (Some(prev), None) => {
        debug_assert_eq!(bucket.tail, Some(block));
        unsafe { codec.set_next_link(prev, None) };
        bucket.tail = Some(prev);
      }
      // Interior
      (Some(prev), Some(next)) => unsafe {
        codec.set_prev_link(next, Some(prev));
        codec.set_next_link(prev, Some(next));
      },
    }

    // Clear stale links.
    unsafe {
      codec.set_prev_link(block, None);
      codec.set_next_link(block, None);
    }
    debug_assert!(self.free_blocks > 0);
    self.free_blocks -= 1;
  }

  /// First fit over buckets `start..BUCKET_COUNT`, each scanned tail to head.
  ///
  /// # Safety
  /// Every linked block must be a valid free block.
  pub(crate) unsafe fn find_fit(&self, codec: Codec, min_size: usize, start: usize) -> Option<Block> {
    for bucket in &self.buckets[start.min(BUCKET_COUNT)..] {
      let mut cursor = bucket.tail;
      while let Some(block) = cursor {
        if unsafe { codec.size(block) } >= min_size {
          return Some(block);
        }
        cursor = unsafe { codec.prev_link(block) };
      }
    }
    None
  }
}
