//! Integration tests for the segalloc heap

use core::ptr::NonNull;
use segalloc::{Arena, CHUNK_SIZE, Heap, HeapError, MmapArena, WSIZE, size_class};

fn heap() -> Heap<MmapArena> {
  Heap::new(MmapArena::with_capacity(1 << 24))
}

/// Size of the block behind a live allocation.
fn block_size(heap: &Heap<MmapArena>, ptr: NonNull<u8>) -> usize {
  unsafe { heap.usable_size(ptr) + WSIZE }
}

#[test]
fn test_end_to_end_scenario() {
  let mut heap = heap();

  let p1 = heap.allocate(8).unwrap();
  let before = heap.stats().arena_bytes;
  // One block bigger than the free tail of the first chunk.
  let p2 = heap.allocate(CHUNK_SIZE - WSIZE).unwrap();
  assert!(heap.stats().arena_bytes > before);
  unsafe { heap.release(Some(p1)) };
  let p3 = heap.allocate(8).unwrap();
  assert_eq!(p3, p1);

  unsafe {
    heap.release(Some(p2));
    heap.release(Some(p3));
  }

  assert!(heap.check(line!()));
  let stats = heap.stats();
  assert_eq!(stats.free_blocks, heap.free_blocks());
  assert_eq!(stats.allocated_blocks, 0);
  // Everything merged back into a single free block.
  assert_eq!(heap.free_blocks(), 1);
}

#[test]
fn test_oldest_fit_wins_over_just_released() {
  let mut heap = heap();

  // 4000 bytes fit in the first chunk and leave a 48-byte remainder in the
  // smallest bucket, behind which the released P1 is queued.
  let p1 = heap.allocate(8).unwrap();
  let p2 = heap.allocate(4000).unwrap();
  assert_eq!(heap.stats().arena_bytes, 2 * WSIZE + CHUNK_SIZE);
  unsafe { heap.release(Some(p1)) };

  let p3 = heap.allocate(8).unwrap();
  assert_ne!(p3, p1);
  assert_eq!(p3.as_ptr() as usize, p2.as_ptr() as usize + block_size(&heap, p2));

  unsafe {
    heap.release(Some(p2));
    heap.release(Some(p3));
  }
  assert!(heap.check(line!()));
  assert_eq!(heap.free_blocks(), 1);
}

#[test]
fn test_alignment() {
  let mut heap = heap();
  let mut ptrs = Vec::new();
  for size in 1..300 {
    let ptr = heap.allocate(size).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0, "size {size}");
    ptrs.push(ptr);
  }
  for ptr in ptrs {
    unsafe { heap.release(Some(ptr)) };
  }
  assert!(heap.check(line!()));
}

#[test]
fn test_coalescing_either_order() {
  for reverse in [false, true] {
    let mut heap = heap();
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(200).unwrap();
    // Pin the tail so the merged block cannot also absorb it.
    let _guard = heap.allocate(8).unwrap();
    let expected = block_size(&heap, a) + block_size(&heap, b);

    unsafe {
      if reverse {
        heap.release(Some(b));
        heap.release(Some(a));
      } else {
        heap.release(Some(a));
        heap.release(Some(b));
      }
    }

    assert!(heap.check(line!()));
    let free: Vec<_> = heap.blocks().filter(|block| !block.allocated).collect();
    // The merged block plus the untouched tail of the chunk.
    assert_eq!(free.len(), 2);
    assert_eq!(free[0].size, expected);
    // Reallocating exactly that size hands back the merged block.
    let merged = heap.allocate(expected - WSIZE).unwrap();
    assert_eq!(merged, a);
    assert_eq!(size_class(expected), 3);
  }
}

#[test]
fn test_reuse_after_release() {
  let mut heap = heap();
  let _before = heap.allocate(24).unwrap();
  let p = heap.allocate(40).unwrap();
  let _after = heap.allocate(24).unwrap();
  unsafe { heap.release(Some(p)) };
  assert_eq!(heap.allocate(40), Some(p));
  assert!(heap.check(line!()));
}

#[test]
fn test_zero_fill_and_overflow() {
  let mut heap = heap();
  let scratch = heap.allocate(1024).unwrap();
  unsafe {
    scratch.as_ptr().write_bytes(0xEE, 1024);
    heap.release(Some(scratch));
  }

  let ptr = heap.zero_allocate(100, 10).unwrap();
  assert!(unsafe { heap.usable_size(ptr) } >= 1000);
  let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 1000) };
  assert!(bytes.iter().all(|&b| b == 0));

  assert!(heap.zero_allocate(usize::MAX / 2, 3).is_none());
  assert_eq!(heap.try_zero_allocate(usize::MAX / 4, 8), Err(HeapError::SizeOverflow));
  assert!(heap.check(line!()));
}

#[test]
fn test_resize_truncation() {
  let mut heap = heap();
  let ptr = heap.allocate(64).unwrap();
  for i in 0..64 {
    unsafe { *ptr.as_ptr().add(i) = (i * 3) as u8 };
  }
  let small = unsafe { heap.resize(Some(ptr), 16) }.unwrap();
  for i in 0..16 {
    assert_eq!(unsafe { *small.as_ptr().add(i) }, (i * 3) as u8);
  }
  assert!(heap.check(line!()));
}

#[test]
fn test_resize_of_none_and_to_zero() {
  let mut a = heap();
  let mut b = heap();
  let from_resize = unsafe { a.resize(None, 32) }.unwrap();
  let from_allocate = b.allocate(32).unwrap();
  assert_eq!(
    from_resize.as_ptr() as usize - a.arena().low() as usize,
    from_allocate.as_ptr() as usize - b.arena().low() as usize
  );
  assert_eq!(a.stats(), b.stats());

  assert!(unsafe { a.resize(Some(from_resize), 0) }.is_none());
  unsafe { b.release(Some(from_allocate)) };
  assert_eq!(a.stats(), b.stats());
  assert!(a.check(line!()));
}

#[test]
fn test_large_requests_grow_exactly() {
  let mut heap = heap();
  let _ = heap.allocate(8).unwrap();
  let before = heap.stats().arena_bytes;
  let big = heap.allocate(10 * CHUNK_SIZE).unwrap();
  let grown = heap.stats().arena_bytes - before;
  // Oversized requests grow by their own rounded size, not by whole chunks.
  assert!(grown <= 10 * CHUNK_SIZE + 16);
  assert!(block_size(&heap, big) >= 10 * CHUNK_SIZE + WSIZE);
  assert!(heap.check(line!()));
}

#[test]
fn test_exhaustion_is_side_effect_free() {
  let mut heap = Heap::new(MmapArena::with_capacity(4 * CHUNK_SIZE));
  let keep = heap.allocate(512).unwrap();
  let stats = heap.stats();

  assert_eq!(heap.try_allocate(8 * CHUNK_SIZE), Err(HeapError::ArenaExhausted));
  assert!(heap.allocate(8 * CHUNK_SIZE).is_none());
  assert!(heap.zero_allocate(8, CHUNK_SIZE).is_none());
  assert!(unsafe { heap.resize(Some(keep), 8 * CHUNK_SIZE) }.is_none());

  assert_eq!(heap.stats(), stats);
  assert!(heap.check(line!()));
}

#[test]
fn test_stress_mixed_operations() {
  let mut heap = heap();
  let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
  let mut rng_state = 12345u32;

  // Simple LCG for deterministic testing
  let mut next_random = || {
    rng_state = rng_state.wrapping_mul(1103515245).wrapping_add(12345);
    rng_state >> 8
  };

  for step in 0..4000 {
    let roll = next_random() % 10;
    if roll < 5 || live.is_empty() {
      let size = 1 + (next_random() as usize % 3000);
      let tag = step as u8;
      let ptr = heap.allocate(size).unwrap();
      unsafe { ptr.as_ptr().write_bytes(tag, size) };
      live.push((ptr, size, tag));
    } else if roll < 8 {
      let idx = next_random() as usize % live.len();
      let (ptr, size, tag) = live.swap_remove(idx);
      let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
      assert!(bytes.iter().all(|&b| b == tag), "payload clobbered at step {step}");
      unsafe { heap.release(Some(ptr)) };
    } else {
      let idx = next_random() as usize % live.len();
      let (ptr, size, tag) = live[idx];
      let new_size = 1 + (next_random() as usize % 3000);
      let moved = unsafe { heap.resize(Some(ptr), new_size) }.unwrap();
      let kept = size.min(new_size);
      let bytes = unsafe { core::slice::from_raw_parts(moved.as_ptr(), kept) };
      assert!(bytes.iter().all(|&b| b == tag), "resize lost data at step {step}");
      unsafe { moved.as_ptr().write_bytes(tag, new_size) };
      live[idx] = (moved, new_size, tag);
    }

    if step % 250 == 0 {
      assert!(heap.check(line!()), "heap inconsistent at step {step}");
    }
  }

  for (ptr, _, _) in live {
    unsafe { heap.release(Some(ptr)) };
  }
  assert!(heap.check(line!()));
  assert_eq!(heap.free_blocks(), 1);
  assert_eq!(heap.stats().allocated_blocks, 0);
}

#[test]
fn test_independent_instances() {
  let mut a = heap();
  let mut b = heap();
  let pa = a.allocate(64).unwrap();
  let pb = b.allocate(64).unwrap();
  assert_ne!(pa, pb);
  unsafe { a.release(Some(pa)) };
  assert_eq!(a.free_blocks(), 1);
  assert_eq!(b.free_blocks(), 1);
  assert_eq!(b.stats().allocated_blocks, 1);
  assert!(a.check(line!()) && b.check(line!()));
}
