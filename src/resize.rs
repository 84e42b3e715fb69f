//! Cooperative migration of a table into a larger (or equally sized, but clean) successor.
//!
//! A table is `Active` until a successor is installed in its `next` pointer. It is then
//! `Draining`: every operation that touches one of its slots first migrates that slot, and a
//! small quota of other slots, into the successor. Once every slot is forwarded the successor is
//! swapped in as the root table and the old one is retired through the epoch collector.
//!
//! Any thread can finish a migration on its own, so a stalled resizer never holds up the others.

use crate::slot_table::{Claim, Expect, Freeze, KeyNode, Put, Table, ValueNode, MAX_CAPACITY};
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::{cmp, ptr, sync::atomic::Ordering};


/// Number of extra slots a helper migrates when it touches a draining table.
pub(crate) const COPY_QUOTA: usize = 16;

/// How many times larger a successor may be than its predecessor.
const MAX_GROWTH: usize = 4;

#[inline]
pub(crate) fn current<'g, K, V>(root: &Atomic<Table<K, V>>, guard: &'g Guard) -> &'g Table<K, V> {
    // The root is never null.
    unsafe { root.load(Ordering::Acquire, guard).deref() }
}

/// Migrates the slot at `index` and a quota of other slots out of `table`.
/// Returns the table the caller should continue in.
pub(crate) fn help_copy<'g, K: Clone + Eq, V: Clone>(
    root: &Atomic<Table<K, V>>,
    table: &'g Table<K, V>,
    index: usize,
    guard: &'g Guard,
) -> &'g Table<K, V> {
    let next = match table.next(guard) {
        Some(next) => next,
        None => return current(root, guard),
    };

    let mut copied = copy_slot(table, index, next, guard) as usize;

    let mask = table.capacity() - 1;
    let start = table.copy_cursor.fetch_add(COPY_QUOTA, Ordering::Relaxed);
    for i in 0..cmp::min(COPY_QUOTA, table.capacity()) {
        if copy_slot(table, start.wrapping_add(i) & mask, next, guard) {
            copied += 1;
        }
    }

    record_copied(root, table, next, copied, guard);

    next
}

/// Handles a [Put::Full] result from `table` and returns the table to retry in.
///
/// If `table` is the root, a successor is allocated (unless one exists) and the whole migration
/// is finished. If `table` is the successor of the root, the root's migration is finished.
#[cold]
#[inline(never)]
pub(crate) fn grow<'g, K: Clone + Eq, V: Clone>(
    root: &Atomic<Table<K, V>>,
    table: &'g Table<K, V>,
    load_factor: f64,
    guard: &'g Guard,
) -> &'g Table<K, V> {
    let root_table = current(root, guard);

    if !ptr::eq(root_table, table) {
        if let Some(next) = root_table.next(guard) {
            if ptr::eq(next, table) {
                finish(root, root_table, next, guard);
            }
        }
        return current(root, guard);
    }

    if !table.accepts_claims() {
        // We were promoted, but the promoting thread hasn't flagged it yet.
        table.set_accepts_claims();
        return table;
    }

    let next = start(table, load_factor, guard);
    finish(root, table, next, guard);
    current(root, guard)
}

/// Returns the successor of `table`, allocating it if no resize is in progress.
pub(crate) fn start<'g, K, V>(
    table: &'g Table<K, V>,
    load_factor: f64,
    guard: &'g Guard,
) -> &'g Table<K, V> {
    if let Some(next) = table.next(guard) {
        return next;
    }

    let capacity = new_capacity(table, load_factor);
    // Room for as many new keys as are carried over, however small the load factor.
    let new = Owned::new(
        Table::new(capacity, load_factor, table.counter(), false)
            .with_min_threshold(table.live().saturating_mul(2)),
    );

    match table
        .next
        .compare_exchange(Shared::null(), new, Ordering::AcqRel, Ordering::Acquire, guard)
    {
        Ok(next) => {
            log::debug!(
                "resizing table from {} to {} slots ({} live, {} claimed, threshold {})",
                table.capacity(),
                capacity,
                table.live(),
                table.claimed(),
                table.threshold()
            );
            unsafe { next.deref() }
        }
        // Someone else won, our allocation is dropped with the error.
        Err(err) => unsafe { err.current.deref() },
    }
}

/// Picks the capacity of the successor of `table`.
///
/// Tables dominated by tombstones are rebuilt at the same size, otherwise they at least double.
/// A successor is never more than [MAX_GROWTH] times larger, nor larger than [MAX_CAPACITY].
pub(crate) fn new_capacity<K, V>(table: &Table<K, V>, load_factor: f64) -> usize {
    let capacity = table.capacity();
    let live = table.live();
    let limit = cmp::min(capacity.saturating_mul(MAX_GROWTH), MAX_CAPACITY);

    // The float conversion saturates for tiny load factors.
    let wanted = ((live as f64 / load_factor).ceil() as usize).saturating_add(1);
    let wanted = cmp::min(wanted, limit).next_power_of_two();

    if live.saturating_mul(2) < table.claimed() {
        cmp::max(capacity, wanted)
    } else {
        cmp::max(cmp::min(capacity * 2, MAX_CAPACITY), wanted)
    }
}

/// Migrates every slot of `old` into `new` and promotes `new`.
pub(crate) fn finish<'g, K: Clone + Eq, V: Clone>(
    root: &Atomic<Table<K, V>>,
    old: &'g Table<K, V>,
    new: &'g Table<K, V>,
    guard: &'g Guard,
) {
    let mut copied = 0;
    for index in 0..old.capacity() {
        if copy_slot(old, index, new, guard) {
            copied += 1;
        }
    }

    if copied > 0 {
        old.copy_done.fetch_add(copied, Ordering::AcqRel);
    }

    debug_assert!((0..old.capacity()).all(|index| old.is_forwarded(index, guard)));
    promote(root, old, new, guard);
}

/// Migrates one slot. Returns true if this call was the one to finish it.
pub(crate) fn copy_slot<'g, K: Clone + Eq, V: Clone>(
    old: &'g Table<K, V>,
    index: usize,
    new: &'g Table<K, V>,
    guard: &'g Guard,
) -> bool {
    match old.mark_forwarded(index, guard) {
        Freeze::Done => false,
        Freeze::Sealed => true,
        Freeze::Primed { key, value } => {
            let mut copy = Some(ValueNode::new(unsafe { value.deref() }.value.clone()));

            let result = new.put_if_match(
                key.hash,
                &key.key,
                Claim::Exhaustive(|| KeyNode::new(key.hash, key.key.clone())),
                &mut copy,
                Expect::Vacant,
                guard,
            );

            if let Put::Full = result {
                // The successor reserves room for every slot of its predecessor.
                panic!("migration target table is full");
            }

            old.complete_forward(index, value, guard)
        }
    }
}

fn record_copied<'g, K, V>(
    root: &Atomic<Table<K, V>>,
    old: &'g Table<K, V>,
    new: &'g Table<K, V>,
    copied: usize,
    guard: &'g Guard,
) {
    if copied == 0 {
        return;
    }

    let done = old.copy_done.fetch_add(copied, Ordering::AcqRel) + copied;
    debug_assert!(done <= old.capacity());

    if done == old.capacity() {
        promote(root, old, new, guard);
    }
}

/// Swaps `new` in as the root if `old` is still the root. Returns true if this call did it.
pub(crate) fn promote<'g, K, V>(
    root: &Atomic<Table<K, V>>,
    old: &'g Table<K, V>,
    new: &'g Table<K, V>,
    guard: &'g Guard,
) -> bool {
    let old = Shared::from(old as *const Table<K, V>);
    let new_ptr = Shared::from(new as *const Table<K, V>);

    match root.compare_exchange(old, new_ptr, Ordering::AcqRel, Ordering::Acquire, guard) {
        Ok(_) => {
            new.set_accepts_claims();
            log::debug!("promoted resized table with {} slots", new.capacity());
            unsafe { guard.defer_destroy(old) };
            true
        }
        // Either someone else promoted it, or the map was cleared meanwhile.
        Err(_) => false,
    }
}
