//! Block codec.
//!
//! A block is addressed by the offset of its tag word from the arena base.
//! Layout, with `W` = [`WSIZE`]:
//!
//! ```text
//!   allocated:  | tag | payload ...................................... |
//!   free:       | tag | prev_link | next_link | ...unused... | footer |
//!               ^     ^                                      ^
//!               off   off + W                                off + size - W
//! ```
//!
//! The tag packs `size` (bits 4..), `allocated` (bit 0) and `prev_allocated`
//! (bit 1). Allocated blocks carry no footer; the next block's
//! `prev_allocated` bit stands in for it.

use core::fmt;
use core::ptr::NonNull;

use crate::config::{ALIGNMENT, DSIZE, WSIZE, Word};

// =============================================================================
// Tag
// =============================================================================

/// Packed tag or footer word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tag(Word);

impl Tag {
  const ALLOC_MASK: Word = 0x1;
  const PREV_ALLOC_MASK: Word = 0x2;
  const SIZE_MASK: Word = !0xF;

  /// Zero-size, allocated tag of the prologue and epilogue.
  pub const SENTINEL: Tag = Tag::pack(0, true);

  /// Tag for a block of `size` bytes with `prev_allocated` cleared.
  #[inline(always)]
  pub const fn pack(size: usize, allocated: bool) -> Self {
    debug_assert!(size % ALIGNMENT == 0);
    let alloc = if allocated { Self::ALLOC_MASK } else { 0 };
    Self(size as Word | alloc)
  }

  #[inline(always)]
  pub const fn from_bits(bits: Word) -> Self {
    Self(bits)
  }

  #[inline(always)]
  pub const fn bits(self) -> Word {
    self.0
  }

  #[inline(always)]
  pub const fn size(self) -> usize {
    (self.0 & Self::SIZE_MASK) as usize
  }

  #[inline(always)]
  pub const fn allocated(self) -> bool {
    self.0 & Self::ALLOC_MASK != 0
  }

  #[inline(always)]
  pub const fn prev_allocated(self) -> bool {
    self.0 & Self::PREV_ALLOC_MASK != 0
  }

  #[inline(always)]
  pub const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
    if prev_allocated {
      Self(self.0 | Self::PREV_ALLOC_MASK)
    } else {
      Self(self.0 & !Self::PREV_ALLOC_MASK)
    }
  }

  /// Size and allocation bits only, as stored in a footer.
  #[inline(always)]
  pub const fn footer_bits(self) -> Word {
    self.0 & (Self::SIZE_MASK | Self::ALLOC_MASK)
  }
}

impl fmt::Debug for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Tag")
      .field("size", &self.size())
      .field("allocated", &self.allocated())
      .field("prev_allocated", &self.prev_allocated())
      .finish()
  }
}

// =============================================================================
// Block addressing
// =============================================================================

/// Arena offset of a block's tag word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Block(usize);

impl Block {
  #[inline(always)]
  pub const fn at(offset: usize) -> Self {
    Self(offset)
  }

  #[inline(always)]
  pub const fn offset(self) -> usize {
    self.0
  }

  #[inline(always)]
  pub const fn payload(self) -> usize {
    self.0 + WSIZE
  }

  #[inline(always)]
  pub const fn from_payload(payload: usize) -> Self {
    Self(payload - WSIZE)
  }

  /// Footer offset for a block of `size` bytes.
  #[inline(always)]
  pub const fn footer(self, size: usize) -> usize {
    self.payload() + size - DSIZE
  }

  #[inline(always)]
  pub const fn next(self, size: usize) -> Self {
    Self(self.0 + size)
  }

  /// Offset of the word just before this tag: the previous block's footer
  /// when that block is free.
  #[inline(always)]
  pub const fn prev_footer(self) -> usize {
    self.0 - WSIZE
  }

  #[inline(always)]
  pub const fn prev(self, prev_size: usize) -> Self {
    Self(self.0 - prev_size)
  }

  #[inline(always)]
  const fn prev_link(self) -> usize {
    self.payload()
  }

  #[inline(always)]
  const fn next_link(self) -> usize {
    self.payload() + WSIZE
  }
}

// =============================================================================
// Codec
// =============================================================================

/// Reads and writes block metadata in arena memory.
///
/// This is the only code that dereferences arena memory on behalf of the
/// heap. Every method is `unsafe` with the same contract: the arena starting
/// at `base` must be live and the offsets touched must lie inside its current
/// bounds. Link accessors additionally require the block to be free and at
/// least `MIN_BLOCK_SIZE` bytes, so the two link words overlay its payload.
#[derive(Clone, Copy)]
pub(crate) struct Codec {
  base: NonNull<u8>,
}

impl Codec {
  pub(crate) const fn new(base: NonNull<u8>) -> Self {
    Self { base }
  }

  #[inline(always)]
  pub(crate) fn base(self) -> NonNull<u8> {
    self.base
  }

  /// Block owning the payload at `ptr`.
  #[inline(always)]
  pub(crate) fn block_of(self, ptr: NonNull<u8>) -> Block {
    Block::from_payload(ptr.addr().get() - self.base.addr().get())
  }

  #[inline(always)]
  pub(crate) fn payload_ptr(self, block: Block) -> NonNull<u8> {
    unsafe { self.base.add(block.payload()) }
  }

  #[inline(always)]
  unsafe fn word(self, offset: usize) -> *mut Word {
    debug_assert!(offset % WSIZE == 0);
    unsafe { self.base.as_ptr().add(offset).cast::<Word>() }
  }

  #[inline(always)]
  unsafe fn read(self, offset: usize) -> Word {
    unsafe { self.word(offset).read() }
  }

  #[inline(always)]
  unsafe fn write(self, offset: usize, value: Word) {
    unsafe { self.word(offset).write(value) }
  }

  // === Tags ===

  #[inline(always)]
  pub(crate) unsafe fn tag(self, block: Block) -> Tag {
    Tag::from_bits(unsafe { self.read(block.offset()) })
  }

  /// Overwrite the whole tag word, `prev_allocated` included.
  #[inline(always)]
  pub(crate) unsafe fn set_tag(self, block: Block, tag: Tag) {
    unsafe { self.write(block.offset(), tag.bits()) }
  }

  /// Overwrite size and allocation bits, keeping `prev_allocated`.
  #[inline(always)]
  pub(crate) unsafe fn write_tag(self, block: Block, size: usize, allocated: bool) {
    let prev = unsafe { self.tag(block) }.prev_allocated();
    unsafe { self.set_tag(block, Tag::pack(size, allocated).with_prev_allocated(prev)) }
  }

  /// Only meaningful for free blocks.
  #[inline(always)]
  pub(crate) unsafe fn write_footer(self, block: Block, size: usize, allocated: bool) {
    unsafe { self.write(block.footer(size), Tag::pack(size, allocated).bits()) }
  }

  #[inline(always)]
  pub(crate) unsafe fn footer(self, block: Block) -> Tag {
    let size = unsafe { self.size(block) };
    Tag::from_bits(unsafe { self.read(block.footer(size)) })
  }

  #[inline(always)]
  pub(crate) unsafe fn set_prev_allocated(self, block: Block) {
    let tag = unsafe { self.tag(block) };
    unsafe { self.set_tag(block, tag.with_prev_allocated(true)) }
  }

  #[inline(always)]
  pub(crate) unsafe fn clear_prev_allocated(self, block: Block) {
    let tag = unsafe { self.tag(block) };
    unsafe { self.set_tag(block, tag.with_prev_allocated(false)) }
  }

  #[inline(always)]
  pub(crate) unsafe fn size(self, block: Block) -> usize {
    unsafe { self.tag(block) }.size()
  }

  #[inline(always)]
  pub(crate) unsafe fn allocated(self, block: Block) -> bool {
    unsafe { self.tag(block) }.allocated()
  }

  #[inline(always)]
  pub(crate) unsafe fn prev_allocated(self, block: Block) -> bool {
    unsafe { self.tag(block) }.prev_allocated()
  }

  // === Neighbors ===

  #[inline(always)]
  pub(crate) unsafe fn next_block(self, block: Block) -> Block {
    block.next(unsafe { self.size(block) })
  }

  /// Requires the previous block to be free: allocated blocks have no footer.
  #[inline(always)]
  pub(crate) unsafe fn prev_block(self, block: Block) -> Block {
    debug_assert!(!unsafe { self.prev_allocated(block) });
    let footer = Tag::from_bits(unsafe { self.read(block.prev_footer()) });
    block.prev(footer.size())
  }

  // === Free-list links ===

  #[inline(always)]
  fn decode_link(word: Word) -> Option<Block> {
    (word != 0).then(|| Block::at(word as usize))
  }

  #[inline(always)]
  fn encode_link(link: Option<Block>) -> Word {
    match link {
      Some(block) => {
        debug_assert!(block.offset() != 0);
        block.offset() as Word
      }
      None => 0,
    }
  }

  /// Neighbor toward the bucket head (more recently freed).
  #[inline(always)]
  pub(crate) unsafe fn prev_link(self, block: Block) -> Option<Block> {
    Self::decode_link(unsafe { self.read(block.prev_link()) })
  }

  /// Neighbor toward the bucket tail (less recently freed).
  #[inline(always)]
  pub(crate) unsafe fn next_link(self, block: Block) -> Option<Block> {
    Self::decode_link(unsafe { self.read(block.next_link()) })
  }

  #[inline(always)]
  pub(crate) unsafe fn set_prev_link(self, block: Block, link: Option<Block>) {
    unsafe { self.write(block.prev_link(), Self::encode_link(link)) }
  }

  #[inline(always)]
  pub(crate) unsafe fn set_next_link(self, block: Block, link: Option<Block>) {
    unsafe { self.write(block.next_link(), Self::encode_link(link)) }
  }
}
