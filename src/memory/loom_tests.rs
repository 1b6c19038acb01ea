/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the Mutex-protected node-pool watermark and the diagnostic
/// counters under every thread interleaving loom can explore.
///
/// # Design notes
///
///   - Thread counts kept to 2–3 (state space is exponential).
///   - Loop iterations minimised to 1–3 per thread.
///   - Pools are created fresh per iteration; under cfg(loom) the VM shim
///     is a heap-backed mock, so no real mmap happens.
///   - The global facade is NOT modelled: its RwLock'd instance and TLS
///     handles sit above the pool mutex, which is the only contended lock
///     in steady state and is covered by the instance tests below.
#[cfg(loom)]
mod tests {
    use crate::memory::node_pool::NodePool;
    use crate::memory::numa::{NumaAllocator, NumaAllocatorConfig};
    use crate::memory::stats::Gauge;
    use crate::sync::Arc;
    use crate::sync::atomic::Ordering;

    #[test]
    fn loom_gauge_add_sub() {
        loom::model(|| {
            let gauge = Arc::new(Gauge::new());
            let g1 = gauge.clone();
            let g2 = gauge.clone();

            let t1 = loom::thread::spawn(move || g1.add(10));
            let t2 = loom::thread::spawn(move || g2.add(5));
            t1.join().unwrap();
            t2.join().unwrap();

            gauge.sub(5);
            assert_eq!(gauge.load(Ordering::Relaxed), 10);
        });
    }

    #[test]
    fn loom_node_pool_batches_never_overlap() {
        loom::model(|| {
            let pool = Arc::new(NodePool::new(0, 4096).unwrap());
            let p1 = pool.clone();
            let p2 = pool.clone();

            let t1 = loom::thread::spawn(move || {
                p1.reserve_batch(64).unwrap().as_ptr() as usize
            });
            let t2 = loom::thread::spawn(move || {
                p2.reserve_batch(64).unwrap().as_ptr() as usize
            });

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();

            assert_ne!(a, b);
            assert!(a.abs_diff(b) >= 64, "batches overlap");
            assert_eq!(pool.used_bytes(), 128);
        });
    }

    #[test]
    fn loom_node_pool_exhaustion_is_exclusive() {
        loom::model(|| {
            // Capacity for exactly one batch: precisely one thread wins.
            let pool = Arc::new(NodePool::new(0, 4096).unwrap());
            let p1 = pool.clone();
            let p2 = pool.clone();

            let t1 = loom::thread::spawn(move || p1.reserve_batch(4096).is_ok());
            let t2 = loom::thread::spawn(move || p2.reserve_batch(4096).is_ok());

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();
            assert!(a ^ b, "exactly one batch fits");
            assert_eq!(pool.used_bytes(), 4096);
        });
    }

    #[test]
    fn loom_two_caches_refill_from_shared_pool() {
        loom::model(|| {
            let allocator = Arc::new(
                NumaAllocator::with_config(NumaAllocatorConfig {
                    pool_size_per_node: 16 * 1024,
                    refill_batch: 2,
                    use_huge_pages: false,
                })
                .unwrap(),
            );
            let a1 = allocator.clone();
            let a2 = allocator.clone();

            let t1 = loom::thread::spawn(move || {
                let mut cache = a1.new_cache();
                let p = a1.alloc_with_cache(&mut cache, 64).unwrap();
                // Safety: Test code — the block owns 64 bytes.
                unsafe {
                    std::ptr::write_bytes(p.as_ptr(), 0x11, 64);
                    assert_eq!(*p.as_ptr(), 0x11);
                    a1.free_with_cache(&mut cache, p);
                }
                cache.stats()
            });
            let t2 = loom::thread::spawn(move || {
                let mut cache = a2.new_cache();
                let p = a2.alloc_with_cache(&mut cache, 64).unwrap();
                // Safety: Test code.
                unsafe {
                    std::ptr::write_bytes(p.as_ptr(), 0x22, 64);
                    assert_eq!(*p.as_ptr(), 0x22);
                    a2.free_with_cache(&mut cache, p);
                }
                cache.stats()
            });

            assert_eq!(t1.join().unwrap(), (1, 1));
            assert_eq!(t2.join().unwrap(), (1, 1));
        });
    }
}
