use super::numa::AllocError;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::Mutex;
use std::ptr::NonNull;

/// Contiguous region placed on one NUMA node, carved out in batches under a
/// mutex. The watermark only ever advances; freed blocks are recycled by
/// thread caches, never returned here.
pub(crate) struct NodePool {
    node: usize,
    base: NonNull<u8>,
    size: usize,
    used: Mutex<usize>,
}

// Safety: the mapping is owned by the pool and the watermark is guarded by
// its mutex; base/size are immutable after construction.
unsafe impl Send for NodePool {}
unsafe impl Sync for NodePool {}

impl NodePool {
    /// Map `size` bytes placed on `node` and first-touch the whole region
    /// so the kernel commits the pages while the binding is in effect.
    pub fn new(node: usize, size: usize) -> Result<Self, AllocError> {
        let size = size.next_multiple_of(PlatformVmOps::page_size());
        // Safety: FFI mapping call; size is page-rounded (mmap rejects 0).
        let base = unsafe { PlatformVmOps::alloc_on_node(size, node)? };
        // Safety: the mapping is readable and writable for `size` bytes.
        unsafe { std::ptr::write_bytes(base.as_ptr(), 0, size) };

        stats::TOTAL_RESERVED.add(size);
        stats::TOTAL_COMMITTED.add(size);
        stats::NODE_POOL_COMMITTED.add(size);

        Ok(Self {
            node,
            base,
            size,
            used: Mutex::new(0),
        })
    }

    #[allow(dead_code)]
    pub fn node(&self) -> usize {
        self.node
    }

    #[allow(dead_code)]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[allow(dead_code)]
    pub fn used_bytes(&self) -> usize {
        *self
            .used
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Advance the watermark by `bytes` and return the start of the span.
    /// The critical section is watermark arithmetic only.
    pub fn reserve_batch(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let mut used = self
            .used
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *used + bytes > self.size {
            drop(used);
            #[cfg(debug_assertions)]
            eprintln!(
                "[numalloc] node {} pool exhausted ({} byte batch refused)",
                self.node, bytes
            );
            return Err(AllocError::NodeExhausted { node: self.node });
        }
        let offset = *used;
        *used += bytes;
        drop(used);

        // Safety: offset + bytes <= size, so the span lies inside the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        // Safety: base/size describe the mapping created in `new`.
        unsafe { drop(PlatformVmOps::release(self.base, self.size)) };
        stats::TOTAL_RESERVED.sub(self.size);
        stats::TOTAL_COMMITTED.sub(self.size);
        stats::NODE_POOL_COMMITTED.sub(self.size);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_pool_rounds_to_page_size() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = NodePool::new(0, 100).unwrap();
        assert_eq!(pool.capacity() % PlatformVmOps::page_size(), 0);
        assert!(pool.capacity() >= 100);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn test_reserve_batch_advances_watermark() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = NodePool::new(0, 64 * 1024).unwrap();

        let a = pool.reserve_batch(1024).unwrap();
        assert_eq!(pool.used_bytes(), 1024);
        let b = pool.reserve_batch(2048).unwrap();
        assert_eq!(pool.used_bytes(), 1024 + 2048);

        // Consecutive batches are adjacent and writable end to end.
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 1024);
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xAA, 1024);
            std::ptr::write_bytes(b.as_ptr(), 0xBB, 2048);
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*b.as_ptr(), 0xBB);
        }
    }

    #[test]
    fn test_reserve_batch_exhaustion() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let pool = NodePool::new(0, page).unwrap();

        assert!(pool.reserve_batch(page).is_ok());
        let err = pool.reserve_batch(1).unwrap_err();
        assert!(matches!(err, AllocError::NodeExhausted { node: 0 }));
        // Exhaustion does not disturb the watermark.
        assert_eq!(pool.used_bytes(), page);
    }

    #[test]
    fn test_oversized_batch_leaves_capacity_for_smaller_ones() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let pool = NodePool::new(0, page).unwrap();

        assert!(pool.reserve_batch(page * 2).is_err());
        // Smaller requests still succeed from the untouched capacity.
        assert!(pool.reserve_batch(page / 2).is_ok());
    }

    #[test]
    fn test_concurrent_reserve_batches_are_disjoint() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = Arc::new(NodePool::new(0, 1024 * 1024).unwrap());
        let num_threads = 8;
        let batches_per_thread = 50;
        let batch = 256;

        let mut handles = vec![];
        for _ in 0..num_threads {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let mut spans = Vec::with_capacity(batches_per_thread);
                for _ in 0..batches_per_thread {
                    spans.push(pool.reserve_batch(batch).unwrap().as_ptr() as usize);
                }
                spans
            }));
        }

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        for w in all.windows(2) {
            assert!(w[1] - w[0] >= batch, "overlapping batches handed out");
        }
        assert_eq!(
            pool.used_bytes(),
            num_threads * batches_per_thread * batch
        );
    }
}
