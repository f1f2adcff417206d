use std::collections::VecDeque;
use std::sync::Mutex;

use reactor_util::safe_assert;
use shared_memory::{Shmem, ShmemConf, ShmemError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to map shared memory slab: {0}")]
    Map(#[from] ShmemError),
    #[error("mlock failed: {0}")]
    Mlock(std::io::Error),
}

/// A single allocation handed out of a [`SharedBufferPool`]. Opaque to
/// callers beyond its length; returned to the owning pool's free list on
/// drop via [`SharedBufferPool::free`].
pub struct ShmAllocation {
    slab: usize,
    offset: usize,
    len: usize,
    ptr: *mut u8,
}

// SAFETY: the backing slab outlives every allocation handed out of it (the
// pool only ever grows its `slabs` vec, never removes an entry), and each
// allocation's byte range is exclusively owned by whoever holds the
// `ShmAllocation` -- the free list only ever reuses a range after `free`
// hands it back.
unsafe impl Send for ShmAllocation {}

impl ShmAllocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

struct Slab {
    // Kept alive for the lifetime of the pool; never read through directly
    // after `base` is cached, but dropping it would unmap the region.
    _shmem: Shmem,
    base: *mut u8,
    size: usize,
    cur_offset: usize,
    free_list: VecDeque<(usize, usize)>,
}

unsafe impl Send for Slab {}

struct PoolInner {
    slabs: Vec<Slab>,
    slab_size: usize,
    lock_pages: bool,
}

impl PoolInner {
    fn new_slab(&self) -> Result<Slab, PoolError> {
        let mut shmem = ShmemConf::new().size(self.slab_size).create()?;
        let base = shmem.as_ptr();
        if self.lock_pages {
            let rc = unsafe { libc::mlock(base.cast(), self.slab_size) };
            if rc != 0 {
                return Err(PoolError::Mlock(std::io::Error::last_os_error()));
            }
        }
        Ok(Slab { _shmem: shmem, base, size: self.slab_size, cur_offset: 0, free_list: VecDeque::new() })
    }

    fn alloc(&mut self, len: usize) -> Option<ShmAllocation> {
        for (slab_idx, slab) in self.slabs.iter_mut().enumerate() {
            if let Some(pos) = slab.free_list.iter().position(|&(_, l)| l == len) {
                let (offset, _) = slab.free_list.remove(pos).expect("position just checked");
                return Some(ShmAllocation { slab: slab_idx, offset, len, ptr: unsafe { slab.base.add(offset) } });
            }
        }

        for (slab_idx, slab) in self.slabs.iter_mut().enumerate() {
            if slab.cur_offset + len > slab.size {
                continue;
            }
            let offset = slab.cur_offset;
            slab.cur_offset += len;
            return Some(ShmAllocation { slab: slab_idx, offset, len, ptr: unsafe { slab.base.add(offset) } });
        }

        None
    }

    fn free(&mut self, alloc: ShmAllocation) {
        safe_assert!(alloc.slab < self.slabs.len(), "freed allocation must name a slab this pool owns");
        let slab = &mut self.slabs[alloc.slab];
        slab.free_list.push_front((alloc.offset, alloc.len));
    }
}

/// Slab allocator over one or more anonymous shared-memory regions.
///
/// Mirrors `shm_alloc_init`/`shm_alloc_alloc`/`shm_alloc_free`: a single slab
/// is mapped up front, allocations come first from an exact-size match on the
/// slab's free list (preferring whatever was freed most recently, so it's
/// likely still cache-hot), then from bump-pointer space at the end of the
/// slab. A request that fits in neither fails outright -- the pool never maps
/// a second slab to satisfy it, matching the original's behavior of never
/// growing past the first slab on allocation failure.
pub struct SharedBufferPool {
    inner: Mutex<PoolInner>,
}

impl SharedBufferPool {
    /// Maps one slab of `slab_size` bytes. `lock_pages` mirrors the
    /// original's `do_mlock` flag: if set, the slab is `mlock(2)`'d so it can
    /// never be paged out.
    pub fn new(slab_size: usize, lock_pages: bool) -> Result<Self, PoolError> {
        let inner = PoolInner { slabs: Vec::new(), slab_size, lock_pages };
        let mut inner = inner;
        let first = inner.new_slab()?;
        inner.slabs.push(first);
        Ok(SharedBufferPool { inner: Mutex::new(inner) })
    }

    pub fn alloc(&self, len: usize) -> Option<ShmAllocation> {
        self.inner.lock().expect("shared buffer pool mutex poisoned").alloc(len)
    }

    pub fn free(&self, alloc: ShmAllocation) {
        self.inner.lock().expect("shared buffer pool mutex poisoned").free(alloc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocates_until_slab_exhausted() {
        let pool = SharedBufferPool::new(64, false).unwrap();
        let a = pool.alloc(32).unwrap();
        let b = pool.alloc(32).unwrap();
        assert!(pool.alloc(1).is_none());
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn freed_allocation_is_reused_on_matching_size_request() {
        let pool = SharedBufferPool::new(4096, false).unwrap();
        let a = pool.alloc(128).unwrap();
        let ptr_before = a.as_slice().as_ptr();
        pool.free(a);

        let b = pool.alloc(128).unwrap();
        assert_eq!(b.as_slice().as_ptr(), ptr_before);
    }

    #[test]
    fn mismatched_size_does_not_reuse_freelist_entry() {
        let pool = SharedBufferPool::new(4096, false).unwrap();
        let a = pool.alloc(128).unwrap();
        pool.free(a);

        // Doesn't match the freelist entry's size, so it bump-allocates a
        // fresh range instead of reusing the freed 128-byte slot.
        let b = pool.alloc(64).unwrap();
        assert_eq!(b.len(), 64);
    }
}
