/// Recoverable allocation failures.
///
/// None of these leave a partial mutation behind: the caller's existing
/// allocations and the heap structure are unchanged when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
  /// The arena could not grow by the requested amount
  ArenaExhausted,
  /// `count * size` (or a size plus overhead) does not fit in a `usize`
  SizeOverflow,
  /// Zero-byte request; the allocator hands out nothing
  ZeroSize,
}

impl core::fmt::Display for HeapError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      Self::ArenaExhausted => write!(f, "Arena exhausted"),
      Self::SizeOverflow => write!(f, "Requested size overflows"),
      Self::ZeroSize => write!(f, "Zero-size request"),
    }
  }
}
impl core::error::Error for HeapError {}

pub type Result<T> = core::result::Result<T, HeapError>;
