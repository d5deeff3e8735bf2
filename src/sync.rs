// Unified synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from `loom` and models the recursive tree lock
// on top of loom's `Mutex`/`Condvar`.  Otherwise, re-exports from `std` and
// `parking_lot`.
//
// **Every** file in the crate must import sync primitives through this module.
// A single direct `use std::sync::atomic::*` would bypass loom's scheduler and
// silently break exhaustive testing. The exception is the `std::sync::Arc`
// around a caller-supplied `PoolStats` (see `PoolConfig::stats`): it is part of
// the public API and is only cloned while a tree is built.
#![allow(unused_imports, unused_macros, dead_code)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Mutex, Arc, Condvar)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Condvar, Mutex};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Condvar, Mutex};

// ---------------------------------------------------------------------------
// cell (UnsafeCell)
//
// loom's UnsafeCell differs from std: `.get()` returns a `ConstPtr<T>` wrapper
// instead of `*mut T`.  To write code that compiles under both, use the
// `unsafe_cell_get_mut!` helper macro.
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::UnsafeCell;

    #[cfg(not(loom))]
    pub(crate) use std::cell::UnsafeCell;
}

/// Access the contents of an `UnsafeCell` as `&mut T`.
///
/// Under std: `&mut *cell.get()`
/// Under loom: `cell.with_mut(|p| &mut *p)`
///
/// # Safety
/// Caller must guarantee exclusive access (same as `UnsafeCell::get`).
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: upheld by caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: upheld by caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, ThreadId, current, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, ThreadId, current, spawn, yield_now};
}

// ---------------------------------------------------------------------------
// Barrier: loom does not provide one, so it is shimmed with an atomic countdown.
// Standard tests keep std::sync::Barrier.
// ---------------------------------------------------------------------------
pub(crate) mod barrier {
    #[cfg(not(loom))]
    pub(crate) use std::sync::Barrier;

    /// Under loom, Barrier is not available.  Minimal spin-barrier built on
    /// loom atomics so that shared test helpers compile unmodified.
    #[cfg(loom)]
    pub(crate) struct Barrier {
        total: usize,
        count: super::atomic::AtomicUsize,
    }

    #[cfg(loom)]
    impl Barrier {
        pub(crate) fn new(n: usize) -> Self {
            Self {
                total: n,
                count: super::atomic::AtomicUsize::new(0),
            }
        }

        pub(crate) fn wait(&self) {
            use super::atomic::Ordering;
            let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
            if arrived < self.total {
                while self.count.load(Ordering::Acquire) < self.total {
                    loom::thread::yield_now();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OnceLock shim
//
// loom does not provide OnceLock.  Under cfg(loom) we use a std Mutex<Option<T>>
// (not a loom Mutex) because OnceLock is used in `static` items and loom's
// Mutex::new() is not const.  The inner Mutex only serialises the one-shot
// initialisation, so it is not a synchronization point loom needs to explore.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    inner: std::sync::Mutex<Option<T>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &T {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_none() {
            *guard = Some(f());
        }
        let ptr: *const T = guard.as_ref().unwrap();
        // Safety: the value is never moved or dropped while &self is live.
        unsafe { &*ptr }
    }
}

#[cfg(loom)]
// Safety: access is serialised by the inner Mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

// ---------------------------------------------------------------------------
// ReentrantMutex
//
// The pool tree lock must tolerate re-acquisition by the thread that already
// holds it (cleanup callbacks allocate from the pool being cleared).  Outside
// loom this is `parking_lot::ReentrantMutex`; under loom it is modelled with an
// owner/depth pair guarded by a loom Mutex and a Condvar for waiters.
// ---------------------------------------------------------------------------
#[cfg(all(feature = "thread-safety", not(loom)))]
pub(crate) use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

#[cfg(all(feature = "thread-safety", loom))]
pub(crate) struct ReentrantMutex<T> {
    owner: Mutex<(Option<thread::ThreadId>, usize)>,
    released: Condvar,
    data: T,
}

#[cfg(all(feature = "thread-safety", loom))]
impl<T> ReentrantMutex<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            owner: Mutex::new((None, 0)),
            released: Condvar::new(),
            data,
        }
    }

    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.owner.lock().unwrap();
        loop {
            match state.0 {
                None => {
                    *state = (Some(me), 1);
                    break;
                }
                Some(id) if id == me => {
                    state.1 += 1;
                    break;
                }
                Some(_) => state = self.released.wait(state).unwrap(),
            }
        }
        ReentrantMutexGuard { mutex: self }
    }
}

#[cfg(all(feature = "thread-safety", loom))]
pub(crate) struct ReentrantMutexGuard<'a, T> {
    mutex: &'a ReentrantMutex<T>,
}

#[cfg(all(feature = "thread-safety", loom))]
impl<T> std::ops::Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.mutex.data
    }
}

#[cfg(all(feature = "thread-safety", loom))]
impl<T> Drop for ReentrantMutexGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.mutex.owner.lock().unwrap();
        state.1 -= 1;
        if state.1 == 0 {
            state.0 = None;
            drop(state);
            self.mutex.released.notify_one();
        }
    }
}
