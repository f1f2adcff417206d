use std::sync::Arc;

use crate::pool::{ShmAllocation, SharedBufferPool};

/// The unit of write I/O handed to and from a comm object.
///
/// Grounded on `iapp_netbuf`'s `{NB_ALLOC_MALLOC, NB_ALLOC_POSIXSHM}` tagged
/// allocation: a `NetBuf` is either a plain heap buffer or an allocation out
/// of a [`SharedBufferPool`] slab, and either one exposes the same
/// byte-slice view to callers regardless of where its storage came from.
pub enum NetBuf {
    Heap(Vec<u8>),
    Shm { pool: Arc<SharedBufferPool>, alloc: Option<ShmAllocation> },
}

impl NetBuf {
    pub fn heap(size: usize) -> Self {
        NetBuf::Heap(vec![0u8; size])
    }

    /// Allocate `size` bytes from `pool`, falling back to a heap buffer if
    /// the pool has neither a matching freed entry nor enough bump space
    /// left (matching the original's commented-out malloc fallback path).
    pub fn shm(pool: Arc<SharedBufferPool>, size: usize) -> Self {
        match pool.alloc(size) {
            Some(alloc) => NetBuf::Shm { pool, alloc: Some(alloc) },
            None => NetBuf::Heap(vec![0u8; size]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NetBuf::Heap(buf) => buf.len(),
            NetBuf::Shm { alloc, .. } => alloc.as_ref().map(ShmAllocation::len).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            NetBuf::Heap(buf) => buf.as_slice(),
            NetBuf::Shm { alloc, .. } => alloc.as_ref().expect("freed before last use").as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            NetBuf::Heap(buf) => buf.as_mut_slice(),
            NetBuf::Shm { alloc, .. } => alloc.as_mut().expect("freed before last use").as_mut_slice(),
        }
    }
}

impl Drop for NetBuf {
    fn drop(&mut self) {
        if let NetBuf::Shm { pool, alloc } = self {
            if let Some(alloc) = alloc.take() {
                pool.free(alloc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_netbuf_round_trips_content() {
        let mut nb = NetBuf::heap(16);
        nb.as_mut_slice().copy_from_slice(&[7u8; 16]);
        assert_eq!(nb.as_slice(), &[7u8; 16]);
    }

    #[test]
    fn shm_netbuf_falls_back_to_heap_when_pool_exhausted() {
        let pool = Arc::new(SharedBufferPool::new(8, false).unwrap());
        let _a = NetBuf::shm(pool.clone(), 8);
        let b = NetBuf::shm(pool, 8);
        assert!(matches!(b, NetBuf::Heap(_)));
    }
}
