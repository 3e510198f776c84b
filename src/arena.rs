use core::ptr::{NonNull, null, null_mut};

use crate::config;

/// Source of heap memory: one contiguous region that only grows.
///
/// # Safety
/// Implementors must guarantee that
/// - successive successful `grow` calls return adjacent regions, each starting
///   where the previous one ended;
/// - the first region starts on a 16-byte boundary;
/// - memory handed out stays valid and is never released while the arena lives;
/// - `low()` and `high()` report the first and last byte handed out so far
///   (null before the first growth).
pub unsafe trait Arena {
  /// Extend the arena by exactly `bytes` bytes. A failed call leaves the
  /// arena unchanged; it is never retried by the heap.
  fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>>;

  fn low(&self) -> *const u8;

  fn high(&self) -> *const u8;
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// MmapArena
// =============================================================================

/// `sbrk`-style arena over one reserved virtual range.
///
/// The range is mapped lazily on the first `grow`, so the arena can live in a
/// `static`. Pages are only backed once touched.
pub struct MmapArena {
  base: *mut u8,
  /// Bytes handed out so far.
  brk: usize,
  /// Reserved bytes; `None` until resolved from the environment.
  capacity: Option<usize>,
}

// The arena owns its mapping exclusively.
unsafe impl Send for MmapArena {}

impl MmapArena {
  /// Arena of at most `capacity` bytes.
  pub const fn with_capacity(capacity: usize) -> Self {
    Self {
      base: null_mut(),
      brk: 0,
      capacity: Some(capacity),
    }
  }

  /// Arena sized from `SEGALLOC_ARENA_SIZE`, or the default capacity.
  pub const fn configured() -> Self {
    Self {
      base: null_mut(),
      brk: 0,
      capacity: None,
    }
  }

  /// Reserved capacity in bytes, resolving the environment if needed.
  pub fn capacity(&mut self) -> usize {
    *self.capacity.get_or_insert_with(config::arena_capacity)
  }

  /// Bytes handed out so far.
  pub fn len(&self) -> usize {
    self.brk
  }

  pub fn is_empty(&self) -> bool {
    self.brk == 0
  }

  fn reserve(&mut self) -> bool {
    let capacity = self.capacity();
    if capacity == 0 {
      return false;
    }
    let base = unsafe { os_mmap(capacity) };
    if base.is_null() {
      return false;
    }
    debug_assert!(base as usize % config::ALIGNMENT == 0);
    self.base = base;
    true
  }
}

unsafe impl Arena for MmapArena {
  fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    if self.base.is_null() && !self.reserve() {
      return None;
    }
    let capacity = self.capacity();
    if bytes > capacity - self.brk {
      return None;
    }
    let region = unsafe { self.base.add(self.brk) };
    self.brk += bytes;
    NonNull::new(region)
  }

  fn low(&self) -> *const u8 {
    self.base
  }

  fn high(&self) -> *const u8 {
    if self.brk == 0 {
      null()
    } else {
      unsafe { self.base.add(self.brk - 1) }
    }
  }
}

impl Drop for MmapArena {
  fn drop(&mut self) {
    if let (false, Some(capacity)) = (self.base.is_null(), self.capacity) {
      unsafe { os_munmap(self.base, capacity) };
    }
  }
}
