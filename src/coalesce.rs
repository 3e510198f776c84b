use crate::block::{Block, Codec};
use crate::free_list::{FreeLists, size_class};

/// Merge the free `block` with any free physical neighbor and file the result
/// in its bucket. Returns the surviving block, which is `block` itself or its
/// predecessor when the predecessor was free.
///
/// ```text
///   prev  block  next        survivor
///   A     F      A      ->   block
///   A     F      F      ->   block + next
///   F     F      A      ->   prev + block
///   F     F      F      ->   prev + block + next
/// ```
///
/// # Safety
/// `block` must carry a free tag and footer, must not be linked into any
/// bucket, and the heap around it must otherwise satisfy every invariant.
pub(crate) unsafe fn coalesce(lists: &mut FreeLists, codec: Codec, block: Block) -> Block {
  unsafe {
    let size = codec.size(block);
    let next = codec.next_block(block);
    let prev_free = !codec.prev_allocated(block);
    let next_free = !codec.allocated(next);

    let (survivor, merged) = match (prev_free, next_free) {
      (false, false) => (block, size),
      (false, true) => {
        let next_size = codec.size(next);
        lists.dequeue(codec, next, size_class(next_size));
        (block, size + next_size)
      }
      (true, false) => {
        let prev = codec.prev_block(block);
        let prev_size = codec.size(prev);
        lists.dequeue(codec, prev, size_class(prev_size));
        (prev, prev_size + size)
      }
      (true, true) => {
        let prev = codec.prev_block(block);
        let prev_size = codec.size(prev);
        let next_size = codec.size(next);
        lists.dequeue(codec, prev, size_class(prev_size));
        lists.dequeue(codec, next, size_class(next_size));
        (prev, prev_size + size + next_size)
      }
    };

    codec.write_tag(survivor, merged, false);
    codec.write_footer(survivor, merged, false);
    lists.enqueue(codec, survivor, size_class(merged));
    codec.clear_prev_allocated(survivor.next(merged));
    survivor
  }
}
