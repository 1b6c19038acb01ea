#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::arena::LinearArena;
    use crate::memory::numa::GlobalNumaAllocator;
    use crate::memory::stats;
    use crate::sync::atomic::Ordering;
    use crate::sync::barrier::Barrier;
    use crate::sync::{Arc, thread};

    #[test]
    fn test_integration_numa_and_arena_mix() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // Interleave cached allocations with per-phase arena scratch, the
        // two lifetimes this crate is built around.
        GlobalNumaAllocator::init(4 * 1024 * 1024).unwrap();
        let mut arena = LinearArena::create(256 * 1024, 16 * 1024).unwrap();

        let mut held = Vec::new();
        for i in 0u8..100 {
            if i % 3 == 0 {
                let p = GlobalNumaAllocator::allocate(48).unwrap();
                // Safety: Test code.
                unsafe { std::ptr::write_bytes(p.as_ptr(), i, 48) };
                held.push((p, i));
            } else {
                let scratch = arena.alloc(200).unwrap();
                // Safety: Test code.
                unsafe { std::ptr::write_bytes(scratch.as_ptr(), i, 200) };
            }

            if i % 10 == 9 {
                arena.reset();
            }
        }

        for (p, stamp) in held {
            // Safety: Test code.
            unsafe {
                assert_eq!(*p.as_ptr(), stamp);
                assert_eq!(*p.as_ptr().add(47), stamp);
                GlobalNumaAllocator::free(p);
            }
        }

        GlobalNumaAllocator::cleanup();
    }

    #[test]
    fn test_integration_thread_contention_on_facade() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        GlobalNumaAllocator::init(16 * 1024 * 1024).unwrap();

        let num_threads = 8;
        let iterations = 10_000;
        let blocks_per_iter = 10;
        let barrier = Arc::new(Barrier::new(num_threads));

        let mut handles = vec![];
        for t in 0..num_threads as u8 {
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..iterations {
                    let mut ptrs = Vec::with_capacity(blocks_per_iter);
                    for _ in 0..blocks_per_iter {
                        let p = GlobalNumaAllocator::allocate(64).unwrap();
                        // Safety: Test code.
                        unsafe { std::ptr::write_bytes(p.as_ptr(), t, 64) };
                        ptrs.push(p);
                    }
                    for p in ptrs {
                        // Safety: Test code.
                        unsafe {
                            for off in [0, 31, 63] {
                                assert_eq!(*p.as_ptr().add(off), t, "cross-thread corruption");
                            }
                            GlobalNumaAllocator::free(p);
                        }
                    }
                }
                GlobalNumaAllocator::thread_stats()
            }));
        }

        let expected = (iterations * blocks_per_iter) as u64;
        for h in handles {
            let (allocs, frees) = h.join().unwrap();
            assert_eq!(allocs, expected);
            assert_eq!(frees, expected);
        }

        GlobalNumaAllocator::cleanup();
    }

    #[test]
    fn test_integration_global_counters_return_to_baseline() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let reserved_before = stats::TOTAL_RESERVED.load(Ordering::Relaxed);

        GlobalNumaAllocator::init(1024 * 1024).unwrap();
        assert!(stats::TOTAL_RESERVED.load(Ordering::Relaxed) >= reserved_before + 1024 * 1024);

        {
            let mut arena = LinearArena::create(128 * 1024, 16 * 1024).unwrap();
            arena.alloc(1024).unwrap();

            // A large block adds its whole mapping while it lives.
            let big = GlobalNumaAllocator::allocate(1024 * 1024).unwrap();
            assert!(stats::LARGE_BLOCK_COMMITTED.load(Ordering::Relaxed) >= 1024 * 1024);
            // Safety: Test code.
            unsafe { GlobalNumaAllocator::free(big) };
        }

        GlobalNumaAllocator::cleanup();
        assert_eq!(
            stats::TOTAL_RESERVED.load(Ordering::Relaxed),
            reserved_before
        );
    }
}
