//! # clusterheap - A Cluster-Backed General-Purpose Heap
//!
//! This crate provides a **size-class pool allocator** with a variable-size
//! overflow heap behind it. All memory comes from the OS in fixed-size
//! anonymous mappings called *clusters* (64 KiB by default).
//!
//! ## Overview
//!
//! Every request gets one extra word in front of it, then goes to one of
//! two places:
//!
//! ```text
//!   allocate(n)
//!       │
//!       ▼
//!   n + 8 <= 16384 ?
//!       │ yes                                   │ no
//!       ▼                                       ▼
//!   ┌──────────────────────────────┐    ┌──────────────────────────────┐
//!   │ size classes 32 .. 16384     │    │ overflow heap                │
//!   │                              │    │                              │
//!   │ class ─► pool ─► pool ─► ... │    │ address-ordered free list    │
//!   │          │       │           │    │ first fit, coalescing        │
//!   │        bitmap  bitmap        │    │ grows by whole slabs         │
//!   │        cluster cluster       │    │                              │
//!   └──────────────────────────────┘    └──────────────────────────────┘
//! ```
//!
//! The word in front of each address is a *back-pointer*: the pool that
//! owns the block, or null for the overflow heap. Release reads it and
//! dispatches in constant time.
//!
//! ## Crate Structure
//!
//! ```text
//!   clusterheap
//!   ├── align      - Alignment helpers (align_to!)
//!   ├── arena      - Directory of arena clusters (internal)
//!   ├── bitmap     - Occupancy bitmaps and their arena (internal)
//!   ├── block      - Overflow block header (internal)
//!   ├── cluster    - mmap-backed cluster provider (internal)
//!   ├── config     - Constants and HeapConfig
//!   ├── error      - ClusterError, HeapError
//!   ├── header     - Back-pointer word and Owner
//!   ├── heap       - Heap, the size-class dispatcher
//!   ├── pool       - Fixed-size pools and their arena (internal)
//!   ├── shared     - SharedHeap, a locked Heap
//!   ├── stats      - Diagnostic snapshots
//!   └── varsize    - Overflow heap (internal)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use clusterheap::{Heap, Owner};
//!
//! let mut heap = Heap::new();
//!
//! let small = heap.allocate(40).unwrap();
//! let large = heap.allocate(20_000).unwrap();
//!
//! unsafe {
//!     small.as_ptr().write_bytes(0xAB, 40);
//!
//!     match heap.owner(small) {
//!         Owner::Pool(pool) => assert_eq!(pool.block_size(), 64),
//!         Owner::Overflow => unreachable!(),
//!     }
//!     assert_eq!(heap.owner(large), Owner::Overflow);
//!
//!     heap.release(small.as_ptr());
//!     heap.release(large.as_ptr());
//! }
//!
//! assert_eq!(heap.stats().live_blocks(), 0);
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded core**: `Heap` takes `&mut self`; `SharedHeap` puts one
//!   lock around it
//! - **8-byte alignment**: addresses follow the back-pointer word
//! - **No `GlobalAlloc`**: the heap logs through `tracing`, which allocates
//! - **Unix-only**: requires `libc` and `mmap(2)`
//!
//! ## Safety
//!
//! Releasing goes through raw addresses, so [`Heap::release`] is `unsafe`.
//! Passing an address this heap did not hand out is undefined behavior.

pub mod align;
mod arena;
mod bitmap;
mod block;
mod cluster;
pub mod config;
mod error;
mod header;
mod heap;
mod pool;
mod shared;
pub mod stats;
mod varsize;

pub use config::HeapConfig;
pub use error::{ClusterError, HeapError};
pub use header::Owner;
pub use heap::Heap;
pub use pool::PoolHandle;
pub use shared::SharedHeap;
pub use stats::{BlockInfo, ClassStats, HeapStats, ProviderStats, VarSizeReport};
