//! Shared-memory buffer pool (SMP) and the tagged network buffer (NB) built
//! on top of it.
//!
//! Grounded on `shm_alloc.c`/`netbuf.c`: a slab allocator over anonymous
//! shared memory with bump-pointer allocation and a per-slab LIFO free list,
//! realized with the `shared_memory` crate instead of raw `shm_open`/`mmap`.

mod netbuf;
mod pool;

pub use netbuf::NetBuf;
pub use pool::{PoolError, ShmAllocation, SharedBufferPool};
