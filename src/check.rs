//! Heap consistency checker and read-only heap walks.
//!
//! Nothing here mutates the heap. `verify` costs O(blocks + free blocks) and
//! belongs in tests and debug builds only.

use core::fmt;
use core::marker::PhantomData;

use crate::arena::Arena;
use crate::block::{Block, Codec, Tag};
use crate::config::{ALIGNMENT, BUCKET_COUNT, MIN_BLOCK_SIZE, WSIZE};
use crate::diag;
use crate::free_list::size_class;
use crate::heap::{FIRST_BLOCK, Heap, PROLOGUE};

/// A broken heap invariant. Offsets are relative to the arena start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
  /// Prologue is not a zero-size allocated tag
  BadPrologue,
  /// Walk did not end on the recorded epilogue at the arena end
  BadEpilogue { offset: usize },
  /// Size not a multiple of the alignment, or payload misaligned
  Misaligned { block: usize },
  /// Smaller than a tag, a footer and two links
  Undersized { block: usize, size: usize },
  /// A free block whose footer disagrees with its tag
  FooterMismatch { block: usize },
  /// `prev_allocated` does not match the physically preceding block
  PrevAllocatedMismatch { block: usize },
  /// Two free blocks next to each other
  AdjacentFreeBlocks { first: usize, second: usize },
  /// A block or list link outside the arena
  OutOfBounds { offset: usize },
  /// An allocated block linked into a bucket
  AllocatedInList { block: usize, bucket: usize },
  /// A free block linked into the wrong bucket
  Misfiled { block: usize, bucket: usize, expected: usize },
  /// Head and tail of a bucket do not reach each other, or the list cycles
  BrokenList { bucket: usize },
  /// Free blocks found by walking the heap, linked in buckets, and counted
  FreeCountMismatch {
    in_heap: usize,
    in_lists: usize,
    counter: usize,
  },
}

impl fmt::Display for Violation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Self::BadPrologue => write!(f, "prologue is not a zero-size allocated tag"),
      Self::BadEpilogue { offset } => write!(f, "bad epilogue at {offset:#x}"),
      Self::Misaligned { block } => write!(f, "block {block:#x} is misaligned"),
      Self::Undersized { block, size } => {
        write!(f, "block {block:#x} has size {size} below the minimum {MIN_BLOCK_SIZE}")
      }
      Self::FooterMismatch { block } => write!(f, "tag and footer of block {block:#x} differ"),
      Self::PrevAllocatedMismatch { block } => {
        write!(f, "prev_allocated bit of block {block:#x} is wrong")
      }
      Self::AdjacentFreeBlocks { first, second } => {
        write!(f, "adjacent free blocks {first:#x} and {second:#x}")
      }
      Self::OutOfBounds { offset } => write!(f, "offset {offset:#x} lies outside the arena"),
      Self::AllocatedInList { block, bucket } => {
        write!(f, "allocated block {block:#x} is linked in bucket {bucket}")
      }
      Self::Misfiled {
        block,
        bucket,
        expected,
      } => write!(f, "block {block:#x} is in bucket {bucket}, belongs in {expected}"),
      Self::BrokenList { bucket } => write!(f, "list of bucket {bucket} is broken"),
      Self::FreeCountMismatch {
        in_heap,
        in_lists,
        counter,
      } => write!(
        f,
        "{in_heap} free blocks in heap, {in_lists} linked, counter says {counter}"
      ),
    }
  }
}

impl core::error::Error for Violation {}

/// One block of the implicit block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub offset: usize,
  pub size: usize,
  pub allocated: bool,
  pub prev_allocated: bool,
}

/// Summary of one heap walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
  pub arena_bytes: usize,
  pub blocks: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
}

/// Iterator over the blocks between the prologue and the epilogue.
pub struct Blocks<'a> {
  codec: Option<Codec>,
  cursor: Block,
  end: Block,
  _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let codec = self.codec?;
    if self.cursor >= self.end {
      return None;
    }
    let tag = unsafe { codec.tag(self.cursor) };
    if tag.size() == 0 {
      return None;
    }
    let info = BlockInfo {
      offset: self.cursor.offset(),
      size: tag.size(),
      allocated: tag.allocated(),
      prev_allocated: tag.prev_allocated(),
    };
    // A size running past the epilogue ends the walk.
    self.cursor = match self.cursor.offset().checked_add(tag.size()) {
      Some(next) if next <= self.end.offset() => Block::at(next),
      _ => self.end,
    };
    Some(info)
  }
}

impl<A: Arena> Heap<A> {
  /// Check every structural invariant.
  pub fn verify(&self) -> Result<(), Violation> {
    let Some(codec) = self.codec else {
      return Ok(());
    };

    let base = codec.base().as_ptr() as usize;
    let low = self.arena.low() as usize;
    let high = self.arena.high() as usize;
    // `len` bytes starting at `offset` lie inside the arena.
    let in_bounds = |offset: usize, len: usize| match base.checked_add(offset) {
      Some(start) if start >= low && start.checked_add(len - 1).is_some_and(|last| last <= high) => {
        Ok(())
      }
      _ => Err(Violation::OutOfBounds { offset }),
    };

    unsafe {
      in_bounds(PROLOGUE.offset(), WSIZE)?;
      if codec.tag(PROLOGUE) != Tag::SENTINEL {
        return Err(Violation::BadPrologue);
      }

      // Pass 1: the implicit block list.
      in_bounds(FIRST_BLOCK.offset(), WSIZE)?;
      if !codec.prev_allocated(FIRST_BLOCK) {
        return Err(Violation::PrevAllocatedMismatch {
          block: FIRST_BLOCK.offset(),
        });
      }

      let mut block = FIRST_BLOCK;
      let mut free_in_heap = 0;
      loop {
        let tag = codec.tag(block);
        let size = tag.size();
        if size == 0 {
          break;
        }
        if size % ALIGNMENT != 0 || (base + block.payload()) % ALIGNMENT != 0 {
          return Err(Violation::Misaligned {
            block: block.offset(),
          });
        }
        if size < MIN_BLOCK_SIZE {
          return Err(Violation::Undersized {
            block: block.offset(),
            size,
          });
        }

        let next = block
          .offset()
          .checked_add(size)
          .map(Block::at)
          .ok_or(Violation::OutOfBounds {
            offset: block.offset(),
          })?;
        in_bounds(next.offset(), WSIZE)?;
        let next_tag = codec.tag(next);
        if next_tag.prev_allocated() != tag.allocated() {
          return Err(Violation::PrevAllocatedMismatch {
            block: next.offset(),
          });
        }

        if !tag.allocated() {
          free_in_heap += 1;
          if codec.footer(block).footer_bits() != tag.footer_bits() {
            return Err(Violation::FooterMismatch {
              block: block.offset(),
            });
          }
          if !next_tag.allocated() {
            return Err(Violation::AdjacentFreeBlocks {
              first: block.offset(),
              second: next.offset(),
            });
          }
        }
        block = next;
      }

      if block != self.epilogue || !codec.allocated(block) || base + block.offset() + WSIZE - 1 != high {
        return Err(Violation::BadEpilogue {
          offset: block.offset(),
        });
      }

      // Pass 2: bucket membership, walking tail to head.
      let mut in_lists = 0;
      for bucket in 0..BUCKET_COUNT {
        let mut cursor = self.lists.tail(bucket);
        let mut last = None;
        let mut steps = 0;
        while let Some(block) = cursor {
          in_bounds(block.offset(), MIN_BLOCK_SIZE)?;
          steps += 1;
          if steps > free_in_heap {
            return Err(Violation::BrokenList { bucket });
          }
          let tag = codec.tag(block);
          if tag.allocated() {
            return Err(Violation::AllocatedInList {
              block: block.offset(),
              bucket,
            });
          }
          let expected = size_class(tag.size());
          if expected != bucket {
            return Err(Violation::Misfiled {
              block: block.offset(),
              bucket,
              expected,
            });
          }
          last = Some(block);
          cursor = codec.prev_link(block);
        }
        if last != self.lists.head(bucket) {
          return Err(Violation::BrokenList { bucket });
        }
        in_lists += steps;
      }

      if in_lists != free_in_heap || self.lists.free_blocks() != free_in_heap {
        return Err(Violation::FreeCountMismatch {
          in_heap: free_in_heap,
          in_lists,
          counter: self.lists.free_blocks(),
        });
      }

      // Pass 3: head must reach tail through the forward links.
      for bucket in 0..BUCKET_COUNT {
        let mut cursor = self.lists.head(bucket);
        let mut last = None;
        let mut steps = 0;
        while let Some(block) = cursor {
          in_bounds(block.offset(), MIN_BLOCK_SIZE)?;
          steps += 1;
          if steps > free_in_heap {
            return Err(Violation::BrokenList { bucket });
          }
          last = Some(block);
          cursor = codec.next_link(block);
        }
        if last != self.lists.tail(bucket) {
          return Err(Violation::BrokenList { bucket });
        }
      }
    }

    Ok(())
  }

  /// [`verify`](Self::verify), reporting a violation on stderr. `lineno`
  /// identifies the call site in the report.
  pub fn check(&self, lineno: u32) -> bool {
    match self.verify() {
      Ok(()) => true,
      Err(violation) => {
        diag::report(format_args!("segalloc: heap check failed (line {lineno}): {violation}"));
        false
      }
    }
  }

  #[cfg(all(feature = "heap-check", debug_assertions))]
  pub(crate) fn assert_consistent(&self, lineno: u32) {
    if let Err(violation) = self.verify() {
      diag::fatal(format_args!("segalloc: heap corrupted (line {lineno}): {violation}"));
    }
  }

  /// Walk the implicit block list, sentinels excluded.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      codec: self.codec,
      cursor: FIRST_BLOCK,
      end: self.epilogue,
      _heap: PhantomData,
    }
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats::default();
    if !self.arena.low().is_null() {
      stats.arena_bytes = self.arena.high() as usize - self.arena.low() as usize + 1;
    }
    for block in self.blocks() {
      stats.blocks += 1;
      if block.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += block.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += block.size;
      }
    }
    stats
  }

  /// Print every block and bucket.
  pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
    let Some(codec) = self.codec else {
      return writeln!(out, "heap: uninitialized");
    };
    writeln!(out, "heap: base {:p}, epilogue {:#x}", codec.base(), self.epilogue.offset())?;
    for block in self.blocks() {
      writeln!(
        out,
        "  {:#08x}  size {:>8}  {}{}",
        block.offset,
        block.size,
        if block.allocated { "alloc" } else { "free " },
        if block.prev_allocated { "" } else { "  (prev free)" },
      )?;
    }
    for bucket in 0..BUCKET_COUNT {
      write!(out, "  bucket {bucket}:")?;
      let mut cursor = self.lists.head(bucket);
      while let Some(block) = cursor {
        write!(out, " {:#x}", block.offset())?;
        cursor = unsafe { codec.next_link(block) };
      }
      writeln!(out)?;
    }
    writeln!(out, "  free blocks: {}", self.lists.free_blocks())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::MmapArena;
  use crate::config::{CHUNK_SIZE, DSIZE};
  use core::ptr::NonNull;

  fn heap() -> Heap<MmapArena> {
    Heap::new(MmapArena::with_capacity(1 << 20))
  }

  fn codec(heap: &Heap<MmapArena>) -> Codec {
    heap.codec.unwrap()
  }

  fn block_of(heap: &Heap<MmapArena>, ptr: NonNull<u8>) -> Block {
    codec(heap).block_of(ptr)
  }

  #[test]
  fn test_fresh_heap_is_consistent() {
    let mut heap = heap();
    assert_eq!(heap.verify(), Ok(()));
    let _ = heap.allocate(8).unwrap();
    assert_eq!(heap.verify(), Ok(()));
  }

  #[test]
  fn test_detects_footer_mismatch() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    unsafe { heap.release(Some(a)) };
    let block = block_of(&heap, a);
    let codec = codec(&heap);
    unsafe { codec.write_footer(block, 80, true) };
    assert_eq!(
      heap.verify(),
      Err(Violation::FooterMismatch {
        block: block.offset()
      })
    );
    assert!(!heap.check(line!()));
  }

  #[test]
  fn test_detects_stale_prev_allocated() {
    let mut heap = heap();
    let _a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let codec = codec(&heap);
    let next = block_of(&heap, b);
    unsafe { codec.clear_prev_allocated(next) };
    assert_eq!(
      heap.verify(),
      Err(Violation::PrevAllocatedMismatch {
        block: next.offset()
      })
    );
  }

  #[test]
  fn test_detects_adjacent_free_blocks() {
    let mut heap = heap();
    let _a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let codec = codec(&heap);
    let block = block_of(&heap, b);
    // Free `b` behind the heap's back, next to the free tail, without coalescing.
    let tail = unsafe {
      let size = codec.size(block);
      codec.write_tag(block, size, false);
      codec.write_footer(block, size, false);
      codec.clear_prev_allocated(block.next(size));
      block.next(size)
    };
    assert_eq!(
      heap.verify(),
      Err(Violation::AdjacentFreeBlocks {
        first: block.offset(),
        second: tail.offset()
      })
    );
  }

  #[test]
  fn test_detects_misfiled_block() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    unsafe { heap.release(Some(a)) };
    let block = block_of(&heap, a);
    let codec = codec(&heap);
    // Move the 80-byte block from bucket 1 to bucket 0.
    unsafe {
      heap.lists.dequeue(codec, block, size_class(80));
      heap.lists.enqueue(codec, block, 0);
    }
    assert_eq!(
      heap.verify(),
      Err(Violation::Misfiled {
        block: block.offset(),
        bucket: 0,
        expected: 1
      })
    );
  }

  #[test]
  fn test_detects_count_mismatch() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    unsafe { heap.release(Some(a)) };
    let block = block_of(&heap, a);
    let codec = codec(&heap);
    unsafe { heap.lists.dequeue(codec, block, size_class(80)) };
    assert!(matches!(heap.verify(), Err(Violation::FreeCountMismatch { in_heap: 2, .. })));
  }

  #[test]
  fn test_detects_broken_links() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    let c = heap.allocate(64).unwrap();
    let _d = heap.allocate(64).unwrap();
    unsafe {
      heap.release(Some(a));
      heap.release(Some(c));
    }
    // Bucket 1 is c -> a. Cut the forward link.
    let codec = codec(&heap);
    unsafe { codec.set_next_link(block_of(&heap, c), None) };
    assert_eq!(heap.verify(), Err(Violation::BrokenList { bucket: 1 }));
  }

  #[test]
  fn test_detects_out_of_bounds_link() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    unsafe { heap.release(Some(a)) };
    let codec = codec(&heap);
    let far = Block::at(1 << 24);
    unsafe { codec.set_prev_link(block_of(&heap, a), Some(far)) };
    assert_eq!(heap.verify(), Err(Violation::OutOfBounds { offset: far.offset() }));
  }

  #[test]
  fn test_detects_huge_tag_size() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let block = block_of(&heap, a);
    let codec = codec(&heap);
    unsafe { codec.set_tag(block, Tag::from_bits(!0xF | 0x3)) };
    assert!(matches!(heap.verify(), Err(Violation::OutOfBounds { .. })));
    assert!(!heap.check(line!()));
    // The walk stops at the corrupt block instead of leaving the arena.
    assert_eq!(heap.blocks().count(), 1);
  }

  #[test]
  fn test_detects_huge_link() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();
    unsafe { heap.release(Some(a)) };
    let codec = codec(&heap);
    let far = Block::at(usize::MAX - 7);
    unsafe { codec.set_prev_link(block_of(&heap, a), Some(far)) };
    assert_eq!(heap.verify(), Err(Violation::OutOfBounds { offset: far.offset() }));
    assert!(!heap.check(line!()));
  }

  #[test]
  fn test_detects_bad_prologue() {
    let mut heap = heap();
    let _ = heap.allocate(8).unwrap();
    unsafe { codec(&heap).set_tag(PROLOGUE, Tag::pack(0, false)) };
    assert_eq!(heap.verify(), Err(Violation::BadPrologue));
  }

  #[test]
  fn test_blocks_and_stats() {
    let mut heap = heap();
    let a = heap.allocate(8).unwrap();
    let _b = heap.allocate(100).unwrap();
    unsafe { heap.release(Some(a)) };

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 3);
    assert_eq!(
      blocks[0],
      BlockInfo {
        offset: WSIZE,
        size: 32,
        allocated: false,
        prev_allocated: true
      }
    );
    assert_eq!(blocks[1].size, 112);
    assert!(blocks[1].allocated && !blocks[1].prev_allocated);
    assert!(!blocks[2].allocated && blocks[2].prev_allocated);

    let stats = heap.stats();
    assert_eq!(stats.arena_bytes, DSIZE + CHUNK_SIZE);
    assert_eq!(stats.blocks, 3);
    assert_eq!(stats.free_blocks, heap.free_blocks());
    assert_eq!(stats.free_bytes + stats.allocated_bytes, CHUNK_SIZE);
    assert_eq!(stats.allocated_bytes, 112);
  }

  #[test]
  fn test_dump() {
    let mut heap = heap();
    let mut out = String::new();
    heap.dump(&mut out).unwrap();
    assert_eq!(out, "heap: uninitialized\n");

    let _ = heap.allocate(8).unwrap();
    out.clear();
    heap.dump(&mut out).unwrap();
    assert!(out.contains("bucket 4: 0x28"));
    assert!(out.contains("free blocks: 1"));
  }
}
