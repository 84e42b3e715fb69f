//! Pinning and deferred reclamation.
//!
//! Threads reading a [crate::SyncMap] or [crate::Cache] are pinned for the duration of the
//! operation. Tables and values that are replaced while a thread is pinned are only freed once
//! every thread that could observe them has unpinned. This is a thin layer over `crossbeam-epoch`.

use crossbeam_epoch::Guard;
use std::cell::Cell;

/// A pinned region. References handed out by a [crate::sync_map::Read] handle are valid for its
/// lifetime.
#[derive(Clone, Copy)]
pub struct Pin<'a> {
    guard: &'a Guard,
}

impl<'a> Pin<'a> {
    /// Returns the epoch guard backing this pin.
    #[inline]
    pub fn guard(&self) -> &'a Guard {
        self.guard
    }
}

thread_local! {
    static PINNED: Cell<usize> = const { Cell::new(0) };
}

#[inline(never)]
#[cold]
fn panic_pinned() {
    panic!("The current thread was pinned");
}

#[inline]
fn assert_unpinned() {
    if PINNED.with(|pinned| pinned.get()) != 0 {
        panic_pinned()
    }
}

struct Unpin;

impl Drop for Unpin {
    #[inline]
    fn drop(&mut self) {
        PINNED.with(|pinned| pinned.set(pinned.get() - 1));
    }
}

/// Pins the current thread for the duration of `f`.
#[inline]
pub fn pin<R>(f: impl FnOnce(Pin<'_>) -> R) -> R {
    let guard = crossbeam_epoch::pin();
    PINNED.with(|pinned| pinned.set(pinned.get() + 1));
    let _unpin = Unpin;
    f(Pin { guard: &guard })
}

/// Returns true if the current thread is inside a [pin] call.
#[inline]
pub fn is_pinned() -> bool {
    PINNED.with(|pinned| pinned.get() != 0)
}

/// Defers `f` until no thread that is pinned right now remains pinned.
///
/// # Safety
/// `f` must be safe to run on any thread at any later point.
pub unsafe fn defer_unchecked<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    pin(|pin| unsafe { pin.guard().defer_unchecked(f) })
}

/// Pushes garbage deferred by this thread to the global queue and tries to free what is no
/// longer reachable by any pinned thread.
///
/// Panics if the current thread is pinned.
pub fn collect() {
    assert_unpinned();
    crossbeam_epoch::pin().flush();
}
