//! Process-wide allocator.
//!
//! The heap algorithms assume a total order of mutations, so every entry point
//! runs under one spin lock around the whole heap.
//!
//! ```rust,ignore
//! use segalloc::SegAlloc;
//!
//! #[global_allocator]
//! static GLOBAL: SegAlloc = SegAlloc::new();
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::arena::MmapArena;
use crate::config::ALIGNMENT;
use crate::heap::Heap;

// =============================================================================
// Lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }
}

struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// SegAlloc
// =============================================================================

/// A [`Heap`] over an [`MmapArena`] behind a global critical section.
///
/// Supports alignments up to 16 bytes; stricter layouts get a null pointer.
pub struct SegAlloc {
  lock: SpinLock,
  heap: UnsafeCell<Heap<MmapArena>>,
}

// All access to `heap` goes through `lock`.
unsafe impl Sync for SegAlloc {}

impl SegAlloc {
  /// Arena sized from `SEGALLOC_ARENA_SIZE`, or 1GB.
  pub const fn new() -> Self {
    Self::with_arena(MmapArena::configured())
  }

  pub const fn with_capacity(capacity: usize) -> Self {
    Self::with_arena(MmapArena::with_capacity(capacity))
  }

  const fn with_arena(arena: MmapArena) -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(Heap::new(arena)),
    }
  }

  /// Run `f` with exclusive access to the heap.
  pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<MmapArena>) -> R) -> R {
    let _guard = self.lock.lock();
    f(unsafe { &mut *self.heap.get() })
  }

  /// Diagnostic pass over the whole heap, see [`Heap::check`].
  pub fn check(&self, lineno: u32) -> bool {
    self.with_heap(|heap| heap.check(lineno))
  }
}

impl Default for SegAlloc {
  fn default() -> Self {
    Self::new()
  }
}

unsafe impl GlobalAlloc for SegAlloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with_heap(|heap| heap.allocate(layout.size().max(1)))
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    self.with_heap(|heap| unsafe { heap.release(NonNull::new(ptr)) });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with_heap(|heap| unsafe { heap.resize(NonNull::new(ptr), new_size.max(1)) })
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with_heap(|heap| heap.zero_allocate(1, layout.size().max(1)))
      .map_or(null_mut(), NonNull::as_ptr)
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static C_HEAP: SegAlloc = SegAlloc::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  C_HEAP
    .with_heap(|heap| heap.allocate(size))
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  C_HEAP.with_heap(|heap| unsafe { heap.release(NonNull::new(ptr)) });
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  C_HEAP
    .with_heap(|heap| unsafe { heap.resize(NonNull::new(ptr), size) })
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  C_HEAP
    .with_heap(|heap| heap.zero_allocate(nmemb, size))
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  match NonNull::new(ptr) {
    Some(ptr) => C_HEAP.with_heap(|heap| unsafe { heap.usable_size(ptr) }),
    None => 0,
  }
}
