use core::ptr::{self, NonNull};

use crate::arena::Arena;
use crate::block::{Block, Codec, Tag};
use crate::coalesce::coalesce;
use crate::config::{CHUNK_SIZE, DSIZE, MIN_BLOCK_SIZE, WSIZE, round_up};
use crate::error::{HeapError, Result};
use crate::free_list::{FreeLists, size_class};

/// Prologue word, the first word of the arena.
pub(crate) const PROLOGUE: Block = Block::at(0);
/// First real block. Before the first growth this is the epilogue.
pub(crate) const FIRST_BLOCK: Block = Block::at(WSIZE);

/// Run the full checker around public operations in `heap-check` debug builds.
macro_rules! self_check {
  ($heap:expr) => {
    #[cfg(all(feature = "heap-check", debug_assertions))]
    $heap.assert_consistent(line!());
  };
}

/// A segregated-fit heap over one arena.
///
/// The heap initializes itself on first use: it writes the prologue and
/// epilogue sentinels and grows the arena by one chunk. It never gives memory
/// back; the arena is released only when the heap (and its arena) is dropped.
///
/// Not thread-safe. See [`SegAlloc`](crate::SegAlloc) for a locked wrapper.
pub struct Heap<A: Arena> {
  pub(crate) arena: A,
  /// Set once the sentinels are written.
  pub(crate) codec: Option<Codec>,
  pub(crate) epilogue: Block,
  pub(crate) lists: FreeLists,
}

// The arena is owned exclusively and all raw pointers point into it.
unsafe impl<A: Arena + Send> Send for Heap<A> {}

impl<A: Arena> Heap<A> {
  pub const fn new(arena: A) -> Self {
    Self {
      arena,
      codec: None,
      epilogue: FIRST_BLOCK,
      lists: FreeLists::new(),
    }
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  pub fn is_initialized(&self) -> bool {
    self.codec.is_some()
  }

  /// Number of free blocks currently linked in the buckets.
  pub fn free_blocks(&self) -> usize {
    self.lists.free_blocks()
  }

  fn init(&mut self) -> Result<Codec> {
    let start = self.arena.grow(DSIZE).ok_or(HeapError::ArenaExhausted)?;
    debug_assert_eq!(start.as_ptr() as *const u8, self.arena.low());
    debug_assert!(start.as_ptr() as usize % DSIZE == 0);

    let codec = Codec::new(start);
    unsafe {
      codec.set_tag(PROLOGUE, Tag::SENTINEL);
      codec.set_tag(FIRST_BLOCK, Tag::SENTINEL.with_prev_allocated(true));
    }
    self.epilogue = FIRST_BLOCK;
    self.codec = Some(codec);

    // An empty heap is still consistent, so a failure here needs no undo.
    self.grow_arena(codec, CHUNK_SIZE)?;
    Ok(codec)
  }

  #[inline]
  fn ensure_init(&mut self) -> Result<Codec> {
    match self.codec {
      Some(codec) => Ok(codec),
      None => self.init(),
    }
  }

  /// Block size for a `size`-byte request: payload plus tag, rounded to the
  /// alignment, never below the minimum block.
  #[inline]
  fn adjusted_size(size: usize) -> Result<usize> {
    let with_tag = size.checked_add(WSIZE).ok_or(HeapError::SizeOverflow)?;
    let asize = round_up(with_tag, DSIZE).ok_or(HeapError::SizeOverflow)?;
    Ok(asize.max(MIN_BLOCK_SIZE))
  }

  /// Extend the arena by at least `min_bytes` and register the new space as
  /// one free block, merged with a free block at the old arena tail.
  fn grow_arena(&mut self, codec: Codec, min_bytes: usize) -> Result<Block> {
    let size = round_up(min_bytes, DSIZE).ok_or(HeapError::SizeOverflow)?;
    let region = self.arena.grow(size).ok_or(HeapError::ArenaExhausted)?;

    // The new region starts right after the old epilogue tag, which becomes
    // the header of the new block.
    let block = codec.block_of(region);
    debug_assert_eq!(block, self.epilogue);

    unsafe {
      let prev_allocated = codec.prev_allocated(self.epilogue);
      codec.set_tag(block, Tag::pack(size, false).with_prev_allocated(prev_allocated));
      codec.write_footer(block, size, false);

      let epilogue = block.next(size);
      codec.set_tag(epilogue, Tag::SENTINEL);
      self.epilogue = epilogue;

      Ok(coalesce(&mut self.lists, codec, block))
    }
  }

  /// Carve an allocated block of `asize` bytes out of the free `block`,
  /// returning the remainder to its bucket when it is big enough to stand alone.
  unsafe fn place(&mut self, codec: Codec, block: Block, asize: usize) {
    unsafe {
      let csize = codec.size(block);
      debug_assert!(!codec.allocated(block));
      debug_assert!(csize >= asize);

      self.lists.dequeue(codec, block, size_class(csize));

      if csize - asize >= MIN_BLOCK_SIZE {
        codec.write_tag(block, asize, true);

        let rest = block.next(asize);
        let rest_size = csize - asize;
        codec.set_tag(rest, Tag::pack(rest_size, false).with_prev_allocated(true));
        codec.write_footer(rest, rest_size, false);
        self.lists.enqueue(codec, rest, size_class(rest_size));
      } else {
        codec.write_tag(block, csize, true);
        codec.set_prev_allocated(block.next(csize));
      }
    }
  }

  // ===========================================================================
  // Public API
  // ===========================================================================

  /// Allocate at least `size` bytes aligned to 16. `None` for a zero-size
  /// request or when the arena cannot grow.
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.try_allocate(size).ok()
  }

  pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    if size == 0 {
      return Err(HeapError::ZeroSize);
    }
    let codec = self.ensure_init()?;
    self_check!(self);

    let asize = Self::adjusted_size(size)?;
    let block = match unsafe { self.lists.find_fit(codec, asize, size_class(asize)) } {
      Some(block) => block,
      None => self.grow_arena(codec, asize.max(CHUNK_SIZE))?,
    };
    unsafe { self.place(codec, block, asize) };

    self_check!(self);
    Ok(codec.payload_ptr(block))
  }

  /// Return a block to the heap. `None` is a no-op.
  ///
  /// # Safety
  /// `ptr` must have been returned by this heap and not released since.
  pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
    let (Some(ptr), Some(codec)) = (ptr, self.codec) else {
      return;
    };
    self_check!(self);

    let block = codec.block_of(ptr);
    unsafe {
      debug_assert!(codec.allocated(block), "release of free block {:#x}", block.offset());
      let size = codec.size(block);
      codec.write_tag(block, size, false);
      codec.write_footer(block, size, false);
      coalesce(&mut self.lists, codec, block);
    }

    self_check!(self);
  }

  /// Move an allocation to a fresh block of at least `size` bytes, keeping
  /// the first `min(size, old payload)` bytes.
  ///
  /// `resize(None, n)` is `allocate(n)`; `resize(p, 0)` releases `p` and
  /// returns `None`. When no new block can be had, `ptr` is left untouched
  /// and `None` is returned.
  ///
  /// # Safety
  /// Same as [`release`](Self::release).
  pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      unsafe { self.release(ptr) };
      return None;
    }
    let Some(old) = ptr else {
      return self.allocate(size);
    };

    let new = self.allocate(size)?;
    unsafe {
      let copy = size.min(self.usable_size(old));
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copy);
      self.release(Some(old));
    }
    Some(new)
  }

  /// Allocate `count * size` zeroed bytes. `None` on overflow.
  pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
    self.try_zero_allocate(count, size).ok()
  }

  pub fn try_zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>> {
    let bytes = count.checked_mul(size).ok_or(HeapError::SizeOverflow)?;
    let ptr = self.try_allocate(bytes)?;
    unsafe { ptr.as_ptr().write_bytes(0, bytes) };
    Ok(ptr)
  }

  /// Payload bytes available behind `ptr`.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    match self.codec {
      Some(codec) => unsafe { codec.size(codec.block_of(ptr)) - WSIZE },
      None => 0,
    }
  }
}
