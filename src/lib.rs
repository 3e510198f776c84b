//! # segalloc
//!
//! A segregated-fit allocator over a single, monotonically growing arena.
//!
//! Blocks carry a one-word boundary tag holding the block size and two
//! allocation bits. Free blocks also carry a footer and two intrusive list
//! links in their payload; allocated blocks drop the footer and let the next
//! block's `prev_allocated` bit stand in for it.
//!
//! ```text
//!   arena:
//!   ┌──────────┬────────────┬──────────┬─────────────────────┬──────────┐
//!   │ prologue │  block     │  block   │  block              │ epilogue │
//!   │ (0, A)   │  (48, A)   │  (96, F) │  (4000, A)          │ (0, A)   │
//!   └──────────┴────────────┴──────────┴─────────────────────┴──────────┘
//!
//!   buckets:   [0] ≤ 63   [1] 64..127   [2] 128..255   [3] 256..511   [4] 512..
//! ```
//!
//! Free blocks live in five size-class buckets, each a doubly-linked list.
//! Allocation is first fit, starting at the request's own class and scanning
//! each bucket from its oldest entry. Freed blocks are merged with free
//! neighbors immediately, so no two free blocks are ever adjacent.
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── arena      - Arena trait and the mmap-backed arena
//!   ├── block      - Tag encoding and block addressing
//!   ├── free_list  - Size classes and bucket lists
//!   ├── coalesce   - Merging free neighbors
//!   ├── heap       - Heap: allocate / release / resize / zero_allocate
//!   ├── check      - Consistency checker and heap walks
//!   └── global     - Locked GlobalAlloc wrapper and C API
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::{Heap, MmapArena};
//!
//! let mut heap = Heap::new(MmapArena::with_capacity(1 << 20));
//!
//! let ptr = heap.allocate(40).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 16, 0);
//!
//! unsafe { heap.release(Some(ptr)) };
//! assert!(heap.check(line!()));
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded core**: `Heap` has no locking; `SegAlloc` adds one global lock
//! - **Never shrinks**: memory is only returned when the arena is dropped
//! - **No in-place realloc**: `resize` always moves the allocation
//! - **Alignment**: 16 bytes at most
//! - **Unix-only**: the bundled arena uses `mmap`
//!
//! ## Features
//!
//! - `heap-check`: verify the whole heap around every call in debug builds
//! - `c_api`: export `malloc`, `free`, `realloc`, `calloc`, `malloc_usable_size`
#![allow(clippy::missing_safety_doc)]

mod arena;
mod block;
mod check;
mod coalesce;
mod config;
mod diag;
mod error;
mod free_list;
mod global;
mod heap;

pub use arena::{Arena, MmapArena};
pub use block::Tag;
pub use check::{BlockInfo, Blocks, HeapStats, Violation};
pub use config::{ALIGNMENT, BUCKET_COUNT, CHUNK_SIZE, MIN_BLOCK_SIZE, WSIZE};
pub use error::{HeapError, Result};
pub use free_list::size_class;
pub use global::SegAlloc;
pub use heap::Heap;

#[cfg(feature = "c_api")]
pub use global::{calloc, free, malloc, malloc_usable_size, realloc};
