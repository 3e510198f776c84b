// =============================================================================
// Constants
// =============================================================================

/// Tag, footer and link word type. Fixed at 64 bits so the block format is
/// identical on every target.
pub type Word = u64;

/// Word and tag size (bytes).
pub const WSIZE: usize = size_of::<Word>();
/// Double word size (bytes).
pub const DSIZE: usize = 2 * WSIZE;

/// Alignment of every block start and payload.
pub const ALIGNMENT: usize = 16;

/// Tag + footer + two link words.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// Granularity of arena growth when the request itself is smaller.
pub const CHUNK_SIZE: usize = 1 << 12;

/// Number of segregated size classes.
pub const BUCKET_COUNT: usize = 5;

/// Virtual range reserved by a configured `MmapArena` unless overridden.
pub const DEFAULT_ARENA_CAPACITY: usize = 1 << 30; // 1GB

/// Environment variable overriding [`DEFAULT_ARENA_CAPACITY`] (bytes).
pub const ENV_ARENA_SIZE: &[u8] = b"SEGALLOC_ARENA_SIZE\0";

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(DSIZE == ALIGNMENT);
const _: () = assert!(MIN_BLOCK_SIZE == 4 * WSIZE);
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(DEFAULT_ARENA_CAPACITY % CHUNK_SIZE == 0);

// =============================================================================
// Environment
// =============================================================================

/// Capacity for arenas that defer to the environment.
///
/// Falls back to [`DEFAULT_ARENA_CAPACITY`] when the variable is unset, not a
/// decimal number, or too small to hold the initial heap. The result is rounded
/// up to a whole number of chunks.
pub fn arena_capacity() -> usize {
  // SAFETY: called while the arena reserves its range, before any block exists.
  let requested = unsafe { getenv_usize(ENV_ARENA_SIZE) };
  match requested {
    Some(bytes) if bytes >= CHUNK_SIZE + DSIZE => {
      round_up(bytes, CHUNK_SIZE).unwrap_or(DEFAULT_ARENA_CAPACITY)
    }
    _ => DEFAULT_ARENA_CAPACITY,
  }
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls `libc::getenv`, which races with concurrent `setenv`.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
  debug_assert_eq!(key.last(), Some(&0));
  let val = unsafe { libc::getenv(key.as_ptr() as *const libc::c_char) };
  if val.is_null() {
    return None;
  }

  // Parse manually (no allocation)
  let mut result: usize = 0;
  let mut ptr = val as *const u8;
  loop {
    let byte = unsafe { *ptr };
    if byte == 0 {
      break;
    }
    if !byte.is_ascii_digit() {
      return None;
    }
    result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
    ptr = unsafe { ptr.add(1) };
  }
  Some(result)
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of `align` (a power of two).
/// Returns `None` on overflow.
#[inline(always)]
pub const fn round_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}
