#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::block::{ALIGN, BLOCK_HEADER_SIZE, MAX_SLOTS, align_allocation};
    use crate::memory::pool::{Pool, PoolConfig, PoolError};
    use crate::memory::stats::PoolStats;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn ranges_disjoint(mut ranges: Vec<(usize, usize)>) -> bool {
        ranges.sort_unstable();
        ranges.windows(2).all(|w| w[0].0 + w[0].1 <= w[1].0)
    }

    #[test]
    fn test_bump_monotonicity() {
        let pool = Pool::new(0).unwrap();
        let mut ranges = Vec::new();
        for size in [1usize, 7, 16, 33, 100, 250, 1024] {
            let before = pool.free_size();
            let p = pool.alloc(size).unwrap();
            let aligned = align_allocation(size).unwrap();
            assert_eq!(pool.free_size(), before - aligned, "size {size}");
            ranges.push((p.as_ptr() as usize, aligned));
        }
        assert!(ranges_disjoint(ranges));
    }

    #[test]
    fn test_clear_resets_exactly() {
        let pool = Pool::new(4096).unwrap();
        let fresh = pool.free_size();
        let first = pool.alloc(300).unwrap();
        pool.alloc(64).unwrap();
        assert!(pool.free_size() < fresh);

        pool.clear();
        assert_eq!(pool.free_size(), fresh);
        assert_eq!(pool.alloc(300).unwrap(), first);
    }

    #[test]
    fn test_clear_keeps_blocks_and_children() {
        let root = Pool::new(0).unwrap();
        let child = root.create_child(0).unwrap();
        let page = root.page_size();
        root.alloc(3 * page).unwrap();
        child.alloc(page).unwrap();
        let blocks = root.block_count();
        let reserved = root.reserved_size();
        let child_fresh = {
            let probe = Pool::new(0).unwrap().create_child(0).unwrap();
            probe.free_size()
        };

        root.clear();
        assert_eq!(root.block_count(), blocks);
        assert_eq!(root.reserved_size(), reserved);
        assert!(child.is_live());
        assert_eq!(child.block_count(), 2);
        assert!(child.free_size() > child_fresh);
    }

    #[test]
    fn test_destroy_is_subtree_complete() {
        static DESTROYED: [AtomicBool; 3] = [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)];
        fn mark(data: *mut u8) {
            DESTROYED[data as usize].store(true, Ordering::SeqCst);
        }

        let root = Pool::new(0).unwrap();
        let child = root.create_child(0).unwrap();
        let grandchild = child.create_child(0).unwrap();
        root.register_cleanup(std::ptr::without_provenance_mut(0), mark).unwrap();
        child.register_cleanup(std::ptr::without_provenance_mut(1), mark).unwrap();
        grandchild.register_cleanup(std::ptr::without_provenance_mut(2), mark).unwrap();

        let stats = root.stats();
        assert_eq!(stats.pools_live, 3);

        root.clone().destroy();
        assert!(DESTROYED.iter().all(|d| d.load(Ordering::SeqCst)));
        for pool in [&root, &child, &grandchild] {
            assert!(!pool.is_live());
            assert!(pool.alloc(8).is_none());
            assert!(matches!(pool.create_child(0), Err(PoolError::Destroyed)));
            assert_eq!(pool.logical_size(), 0);
            assert_eq!(pool.reserved_size(), 0);
        }
        let stats = grandchild.stats();
        assert_eq!(stats.pools_live, 0);
        assert_eq!(stats.blocks_live, 0);
        assert_eq!(stats.bytes_mapped, 0);
    }

    #[test]
    fn test_cleanup_order_is_reverse_registration() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pool = Pool::new(0).unwrap();
        for name in ["A", "B", "C"] {
            let order = order.clone();
            pool.on_cleanup(move || order.lock().unwrap().push(name)).unwrap();
        }
        pool.clear();
        pool.clear();
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_own_cleanups_run_before_children_are_torn_down() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let root = Pool::new(0).unwrap();
        let older = root.create_child(0).unwrap();
        let newer = root.create_child(0).unwrap();
        for (pool, name) in [(&root, "root"), (&older, "older"), (&newer, "newer")] {
            let order = order.clone();
            pool.on_cleanup(move || order.lock().unwrap().push(name)).unwrap();
        }
        root.destroy();
        assert_eq!(*order.lock().unwrap(), vec!["root", "newer", "older"]);
    }

    #[test]
    fn test_oversized_round_trip() {
        static FREED_AFTER: AtomicUsize = AtomicUsize::new(0);
        fn sentinel(_: *mut u8) {
            FREED_AFTER.fetch_add(1, Ordering::SeqCst);
        }

        let stats = Arc::new(PoolStats::new());
        let pool = Pool::with_config(0, PoolConfig::default().with_stats(stats.clone())).unwrap();
        // Registered first so it runs after the oversized memory is freed.
        pool.register_cleanup(std::ptr::null_mut(), sentinel).unwrap();

        let size = (MAX_SLOTS + 4) * pool.page_size();
        let blocks = pool.block_count();
        let mem = pool.alloc(size).unwrap();
        assert_eq!(mem.as_ptr() as usize % ALIGN, 0);
        // Safety: Test code; `size` bytes were requested.
        unsafe {
            mem.as_ptr().write_bytes(0x5A, size);
            assert_eq!(*mem.as_ptr().add(size - 1), 0x5A);
        }
        // Bypasses the arena entirely.
        assert_eq!(pool.block_count(), blocks);
        assert_eq!(pool.cleanup_count(), 2);
        assert_eq!(stats.snapshot().oversized_allocated, size);

        pool.clear();
        assert_eq!(pool.cleanup_count(), 0);
        assert_eq!(FREED_AFTER.load(Ordering::SeqCst), 1);
        // The pool remains usable for both paths.
        assert!(pool.alloc(size).is_some());
        assert!(pool.alloc(64).is_some());
    }

    #[test]
    fn test_slot_limit_routes_to_oversized() {
        let stats = Arc::new(PoolStats::new());
        let config = PoolConfig::default().with_slot_limit(1).with_stats(stats.clone());
        let pool = Pool::with_config(0, config).unwrap();
        // Two pages of need lands in slot 1, which equals the limit.
        pool.alloc(pool.page_size()).unwrap();
        assert_eq!(pool.block_count(), 1);
        assert!(stats.snapshot().oversized_allocated > 0);
    }

    #[test]
    fn test_allocation_scenario() {
        let root = Pool::new(4096).unwrap();
        let page = root.page_size();
        root.alloc(100).unwrap();
        root.alloc(50).unwrap();
        root.alloc(4096).unwrap();
        if root.block_count() < 2 {
            // The creation hint left room for all three; force the next block.
            root.alloc(root.free_size() + ALIGN).unwrap();
        }
        assert!(root.block_count() >= 2);
        assert_eq!(root.reserved_size() % page, 0);
        assert!(root.logical_size() >= 4096 + 100 + 50);
        assert!(root.logical_size() + root.block_count() * BLOCK_HEADER_SIZE <= root.reserved_size());
    }

    #[test]
    fn test_new_block_shadows_older_block_of_same_slot() {
        let pool = Pool::new(0).unwrap();
        let page = pool.page_size();
        // Leave the first block with a little room, then force a fresh one.
        pool.alloc(pool.free_size() - 64).unwrap();
        let big = pool.alloc(page / 2).unwrap();
        assert_eq!(pool.block_count(), 2);
        // A small request now prefers the freshest block.
        let small = pool.alloc(16).unwrap();
        assert_eq!(small.as_ptr() as usize, big.as_ptr() as usize + page / 2);
    }

    // Captures a pool handle in a `Send` closure.
    #[cfg(feature = "thread-safety")]
    #[test]
    fn test_cleanup_reenters_pool() {
        let pool = Pool::new(0).unwrap();
        let inner = pool.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        pool.on_cleanup(move || {
            let p = inner.alloc(128).unwrap();
            // Safety: Test code.
            unsafe { p.as_ptr().write_bytes(1, 128) };
            // Clearing or destroying a pool mid-teardown does nothing.
            inner.clear();
            inner.clone().destroy();
            assert!(inner.is_live());
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let fresh_after_clear = {
            pool.clear();
            pool.free_size()
        };
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // The nested allocation was rewound with everything else.
        assert!(pool.is_live());
        pool.alloc(8).unwrap();
        assert!(pool.free_size() < fresh_after_clear);
    }

    // Captures a pool handle in a `Send` closure.
    #[cfg(feature = "thread-safety")]
    #[test]
    fn test_cleanups_registered_during_clear_run_at_next_clear() {
        let root = Pool::new(0).unwrap();
        let child = root.create_child(0).unwrap();
        let late = Arc::new(AtomicUsize::new(0));

        let (inner, l) = (root.clone(), late.clone());
        root.on_cleanup(move || {
            inner
                .on_cleanup(move || {
                    l.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();
        // A child's cleanup registering on its parent mid-clear.
        let (parent, l) = (root.clone(), late.clone());
        child
            .on_cleanup(move || {
                parent
                    .on_cleanup(move || {
                        l.fetch_add(10, Ordering::SeqCst);
                    })
                    .unwrap();
            })
            .unwrap();

        root.clear();
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(root.cleanup_count(), 2);
        assert_eq!(child.cleanup_count(), 0);

        root.clear();
        assert_eq!(late.load(Ordering::SeqCst), 11);
        assert_eq!(root.cleanup_count(), 0);
    }

    #[test]
    fn test_rearming_cleanup_runs_once_per_clear() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        static REFUSED: AtomicUsize = AtomicUsize::new(0);
        fn rearm(data: *mut u8) {
            // Safety: Test code; `data` points at the handle boxed below.
            let pool = unsafe { &*data.cast::<Pool>() };
            RUNS.fetch_add(1, Ordering::SeqCst);
            if pool.register_cleanup(data, rearm).is_err() {
                REFUSED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = Pool::new(0).unwrap();
        let handle = Box::new(pool.clone());
        let data = std::ptr::from_ref::<Pool>(&handle).cast_mut().cast::<u8>();
        pool.register_cleanup(data, rearm).unwrap();

        for cycle in 1..=3 {
            pool.clear();
            assert_eq!(RUNS.load(Ordering::SeqCst), cycle);
            assert_eq!(pool.cleanup_count(), 1);
        }
        // The re-registration can still be removed before the next cycle.
        pool.unregister_cleanup(data, rearm);
        assert_eq!(pool.cleanup_count(), 0);
        pool.register_cleanup(data, rearm).unwrap();

        // Destroy runs the registration, then once more the one it made,
        // whose own attempt is refused.
        pool.clone().destroy();
        assert_eq!(RUNS.load(Ordering::SeqCst), 5);
        assert_eq!(REFUSED.load(Ordering::SeqCst), 1);
        assert!(!pool.is_live());
        drop(handle);
    }

    // Captures a pool handle in a `Send` closure.
    #[cfg(feature = "thread-safety")]
    #[test]
    fn test_destroy_runs_late_registrations_once() {
        let stats = Arc::new(PoolStats::new());
        let root = Pool::with_config(0, PoolConfig::default().with_slot_limit(1).with_stats(stats.clone())).unwrap();
        let inner = root.clone();
        let refused = Arc::new(AtomicBool::new(false));
        let r = refused.clone();
        root.on_cleanup(move || {
            // Deferred, then freed by the destroy's last pass.
            inner.alloc(4 * inner.page_size()).unwrap();
            let again = inner.clone();
            inner
                .on_cleanup(move || {
                    // Nothing runs after this pass, so the pool refuses.
                    r.store(
                        matches!(again.try_alloc(4 * again.page_size()), Err(PoolError::Destroyed)),
                        Ordering::SeqCst,
                    );
                })
                .unwrap();
        })
        .unwrap();
        root.clone().destroy();
        assert!(refused.load(Ordering::SeqCst));
        assert!(!root.is_live());
        assert_eq!(stats.snapshot().pools_live, 0);
    }

    #[test]
    fn test_panicking_cleanup_leaves_pool_usable() {
        let root = Pool::new(0).unwrap();
        let pool = root.create_child(0).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pool.on_cleanup(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.on_cleanup(|| panic!("cleanup failed")).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| root.clear()));
        assert!(result.is_err());
        // The cleanup behind the panicking one did not run and is kept.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(pool.cleanup_count(), 1);

        let h = hits.clone();
        pool.on_cleanup(move || {
            h.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();
        pool.alloc(256).unwrap();
        root.clear();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(pool.cleanup_count(), 0);
        assert_eq!(pool.free_size(), pool.logical_size());

        // A panic during destroy leaves the pool live; a second destroy completes.
        pool.on_cleanup(|| panic!("cleanup failed")).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.clone().destroy()));
        assert!(result.is_err());
        assert!(pool.is_live());
        assert_eq!(root.child_count(), 1);
        root.clone().destroy();
        assert!(!pool.is_live());
        assert!(!root.is_live());
    }

    #[test]
    fn test_run_cleanup_that_clears_its_pool() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn noop(_: *mut u8) {}
        fn clear_through(data: *mut u8) {
            // Safety: Test code; `data` is the boxed handle leaked below.
            let pool = unsafe { Box::from_raw(data.cast::<Pool>()) };
            pool.clear();
        }

        let pool = Pool::new(0).unwrap();
        pool.register_cleanup(std::ptr::null_mut(), noop).unwrap();
        pool.on_cleanup(|| {
            RAN.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let trigger = Box::into_raw(Box::new(pool.clone())).cast::<u8>();
        pool.register_cleanup(trigger, clear_through).unwrap();
        pool.run_cleanup(trigger, clear_through);

        assert_eq!(RAN.load(Ordering::SeqCst), 1);
        assert_eq!(pool.cleanup_count(), 0);
        // Registering again after the rewind must not reuse stale nodes.
        pool.register_cleanup(std::ptr::null_mut(), noop).unwrap();
        pool.on_cleanup(|| {}).unwrap();
        assert_eq!(pool.cleanup_count(), 2);
        pool.clear();
        assert_eq!(pool.cleanup_count(), 0);
    }

    #[test]
    fn test_destroy_child_directly_unlinks_it() {
        let root = Pool::new(0).unwrap();
        let a = root.create_child(0).unwrap();
        let b = root.create_child(0).unwrap();
        let c = root.create_child(0).unwrap();
        b.clone().destroy();
        assert_eq!(root.child_count(), 2);
        assert!(a.is_live() && c.is_live());
        // Later teardown of the root never touches the destroyed child.
        root.clear();
        root.destroy();
        assert!(!a.is_live() && !c.is_live());
    }

    #[test]
    fn test_stale_handle_operations_are_inert() {
        fn noop(_: *mut u8) {}
        let root = Pool::new(0).unwrap();
        let child = root.create_child(0).unwrap();
        child.clone().destroy();
        assert!(matches!(child.try_alloc(8), Err(PoolError::Destroyed)));
        assert!(matches!(child.try_alloc(1 << 30), Err(PoolError::Destroyed)));
        assert!(matches!(
            child.register_cleanup(std::ptr::null_mut(), noop),
            Err(PoolError::Destroyed)
        ));
        assert!(child.on_cleanup(|| {}).is_err());
        child.run_cleanup(std::ptr::null_mut(), noop);
        child.unregister_cleanup(std::ptr::null_mut(), noop);
        child.clear();
        assert_eq!(child.free_size(), 0);
        assert_eq!(child.block_count(), 0);
        assert!(child.parent().is_none());
        assert!(root.is_live());
    }

    #[test]
    fn test_dropping_last_handle_destroys_tree() {
        let stats = Arc::new(PoolStats::new());
        let dropped = Arc::new(AtomicBool::new(false));
        {
            let root = Pool::with_config(0, PoolConfig::default().with_stats(stats.clone())).unwrap();
            let child = root.create_child(0).unwrap();
            let d = dropped.clone();
            child
                .on_cleanup(move || d.store(true, Ordering::SeqCst))
                .unwrap();
            child.alloc(10 * root.page_size()).unwrap();
        }
        assert!(dropped.load(Ordering::SeqCst));
        let snap = stats.snapshot();
        assert_eq!(snap.pools_live, 0);
        assert_eq!(snap.bytes_mapped, 0);
        assert!(snap.bytes_allocated > 0);
    }

    #[cfg(feature = "thread-safety")]
    #[test]
    fn test_owner_thread_guard() {
        let pool = Pool::new(0).unwrap();
        pool.alloc(512).unwrap();
        let before = pool.free_size();

        let remote = pool.clone();
        std::thread::spawn(move || {
            remote.clear();
            remote.clone().destroy();
            // Allocation from another thread is fine.
            remote.alloc(64).unwrap();
        })
        .join()
        .unwrap();

        assert!(pool.is_live());
        assert_eq!(pool.free_size(), before - 64);
        pool.clear();
        assert!(pool.free_size() > before);
    }

    #[cfg(feature = "thread-safety")]
    #[test]
    fn test_concurrent_allocations_never_overlap() {
        let threads = 8;
        let iters = 200;
        let root = Pool::new(0).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let pool = root.clone();
                let b = barrier.clone();
                std::thread::spawn(move || {
                    b.wait();
                    let mut ranges = Vec::with_capacity(iters);
                    for i in 0..iters {
                        let size = 16 << (i % 6);
                        let p = pool.alloc(size).unwrap();
                        #[allow(clippy::cast_possible_truncation)]
                        // Safety: Test code.
                        unsafe { p.as_ptr().write_bytes(t as u8, size) };
                        ranges.push((p.as_ptr() as usize, size, t));
                    }
                    ranges
                })
            })
            .collect();

        let all: Vec<(usize, usize, usize)> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        for &(addr, size, t) in &all {
            // Safety: Test code; the pool is still live.
            let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
            #[allow(clippy::cast_possible_truncation)]
            let tag = t as u8;
            assert!(bytes.iter().all(|&b| b == tag), "thread {t} data was overwritten");
        }
        assert!(ranges_disjoint(all.into_iter().map(|(a, s, _)| (a, s)).collect()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_allocations_are_disjoint_and_accounted(sizes in prop::collection::vec(0usize..20_000, 1..64)) {
            let stats = Arc::new(PoolStats::new());
            let pool = Pool::with_config(0, PoolConfig::default().with_stats(stats.clone())).unwrap();
            let mut ranges = Vec::with_capacity(sizes.len());
            let mut total = 0;
            for &size in &sizes {
                let p = pool.alloc(size).unwrap();
                let aligned = align_allocation(size).unwrap();
                prop_assert_eq!(p.as_ptr() as usize % ALIGN, 0);
                ranges.push((p.as_ptr() as usize, aligned));
                total += aligned;
            }
            prop_assert!(ranges_disjoint(ranges));
            prop_assert_eq!(stats.snapshot().bytes_allocated, total);
            prop_assert_eq!(pool.reserved_size() % pool.page_size(), 0);

            let free = pool.free_size();
            pool.clear();
            prop_assert!(pool.free_size() >= free);
            prop_assert_eq!(pool.free_size(), pool.logical_size());
        }
    }
}
