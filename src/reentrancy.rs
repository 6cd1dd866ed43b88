//! Per-thread dispatch reentrancy guard.
//!
//! One counter per thread, incremented on entry and decremented on exit.
//! For a well-behaved caller the counter is only ever 0 or 1: a second
//! entry on the same thread is refused rather than nested, which is what
//! prevents a trace program whose side effects re-trigger a trace point
//! from recursing through the dispatch path. Other threads are unaffected.

use core::cell::Cell;
use core::marker::PhantomData;

thread_local! {
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Entry point for the per-thread dispatch counter. Guard public dispatch
/// paths with `let Some(_permit) = DispatchGuard::try_enter() else ...`.
#[derive(Debug)]
pub struct DispatchGuard;

impl DispatchGuard {
    /// Attempt to mark this thread as dispatching. Returns `None` when a
    /// dispatch is already active on the current thread; the caller is
    /// expected to skip rather than recurse.
    #[inline]
    pub fn try_enter() -> Option<DispatchPermit> {
        DISPATCH_DEPTH.with(|depth| {
            if depth.get() != 0 {
                return None;
            }
            depth.set(1);
            Some(DispatchPermit {
                _nosend: PhantomData,
            })
        })
    }

    /// Whether the current thread is inside a dispatch.
    #[inline]
    pub fn is_active() -> bool {
        DISPATCH_DEPTH.with(|depth| depth.get() != 0)
    }
}

/// RAII permit returned by `DispatchGuard::try_enter`. Dropping it clears
/// the thread's counter on every exit path, including early returns.
///
/// `!Send`: the permit must be released on the thread that acquired it.
pub struct DispatchPermit {
    _nosend: PhantomData<*mut ()>,
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| {
            let d = depth.get();
            debug_assert!(d > 0);
            depth.set(d - 1);
        });
    }
}
