//! A fixed capacity table of key/value slots with atomic per-slot state.
//!
//! Keys are claimed once and never leave their slot. A deletion replaces the value with a
//! tombstone. During a resize the [crate::resize] module freezes slots through
//! [Table::mark_forwarded] and [Table::complete_forward], after which every operation on the
//! slot continues in the next table.

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use std::{
    borrow::Borrow,
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering},
        Arc,
    },
};

mod tests;

/// The smallest table we allocate.
pub(crate) const MIN_CAPACITY: usize = 8;

/// The largest table we allocate. It fills up without regard to the load factor.
pub(crate) const MAX_CAPACITY: usize = 1 << 30;

const REPROBE_BASE: usize = 10;

// Tags on a value pointer. A null untagged pointer is a value that was never written.
const TOMBSTONE: usize = 1;
const PRIMED: usize = 2;
const FORWARDED: usize = 3;

// Tag on a null key pointer. The slot can no longer be claimed.
const SEALED: usize = 1;

/// A key with its hash cached at insertion time.
pub(crate) struct KeyNode<K> {
    pub(crate) hash: u64,
    pub(crate) key: K,
}

impl<K> KeyNode<K> {
    #[inline]
    pub(crate) fn new(hash: u64, key: K) -> Owned<Self> {
        Owned::new(KeyNode { hash, key })
    }

    #[inline]
    fn matches<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.hash == hash && self.key.borrow() == key
    }
}

// Aligned so the pointer has room for the value tags.
#[repr(align(4))]
pub(crate) struct ValueNode<V> {
    pub(crate) value: V,
}

impl<V> ValueNode<V> {
    #[inline]
    pub(crate) fn new(value: V) -> Owned<Self> {
        Owned::new(ValueNode { value })
    }
}

struct Slot<K, V> {
    key: Atomic<KeyNode<K>>,
    value: Atomic<ValueNode<V>>,
}

/// Live entry counter shared by a table and the tables it is resized into.
pub(crate) type Counter = Arc<CachePadded<AtomicIsize>>;

pub(crate) fn new_counter() -> Counter {
    Arc::new(CachePadded::new(AtomicIsize::new(0)))
}

/// The decoded state of a value pointer.
pub(crate) enum ValueState<'g, V> {
    /// No value was ever written to the slot.
    Vacant,
    Tombstone,
    Live(&'g V),
    /// Frozen for migration. The value is still current until the slot is forwarded.
    Primed(&'g V),
    /// Migrated. The next table holds the entry, if any.
    Forwarded,
}

#[inline]
fn classify<'g, V>(value: Shared<'g, ValueNode<V>>) -> ValueState<'g, V> {
    match value.tag() {
        0 => match unsafe { value.as_ref() } {
            Some(node) => ValueState::Live(&node.value),
            None => ValueState::Vacant,
        },
        TOMBSTONE => ValueState::Tombstone,
        PRIMED => ValueState::Primed(unsafe { &value.deref().value }),
        _ => ValueState::Forwarded,
    }
}

/// The decoded state of a whole slot.
pub(crate) enum SlotState<'g, K, V> {
    Free,
    Sealed,
    Claimed {
        key: &'g KeyNode<K>,
        value: ValueState<'g, V>,
    },
}

/// Result of [Table::find].
pub(crate) enum Lookup<'g, V> {
    Found(&'g V),
    /// The key is definitely not in this table or any later one.
    Missing,
    /// The slot at this index is being migrated, continue in the next table.
    Moved(usize),
    /// The probe limit was hit without finding the key.
    Exhausted,
}

/// Which values an update may replace.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Expect {
    Any,
    /// Only replace a live value. Used by deletion.
    Live,
    /// Only write into a slot whose value was never written. Used by migration.
    Vacant,
}

/// Whether an update may claim a fresh slot for its key.
pub(crate) enum Claim<F> {
    Never,
    /// Claim within the reprobe limit and growth threshold.
    Bounded(F),
    /// Claim anywhere in the table, ignoring the threshold. Used by migration.
    Exhaustive(F),
}

/// Result of [Table::put_if_match].
pub(crate) enum Put<'g, V> {
    /// The update was applied, or there was nothing to delete. Holds the prior live value.
    Done(Option<&'g V>),
    /// The slot did not match [Expect::Vacant].
    Rejected,
    /// The slot at this index is being migrated, continue in the next table.
    Moved(usize),
    /// The probe limit was hit. Without a claim this means the key is not in this table,
    /// otherwise no slot could be claimed and the table must be resized.
    Full,
}

/// Result of [Table::mark_forwarded].
pub(crate) enum Freeze<'g, K, V> {
    /// Someone else already finished this slot.
    Done,
    /// This call finished the slot and there was nothing to copy.
    Sealed,
    /// The value is frozen and must be copied before calling [Table::complete_forward].
    Primed {
        key: &'g KeyNode<K>,
        value: Shared<'g, ValueNode<V>>,
    },
}

pub(crate) struct Table<K, V> {
    slots: Box<[Slot<K, V>]>,

    // Mask to get an index from a hash value. The value is one less than the
    // number of slots in the table.
    mask: usize,

    // Probes allowed before claiming a fresh slot fails.
    reprobe_limit: usize,

    // Probes needed to see every key. Migration may place keys past the reprobe limit.
    probe_limit: AtomicUsize,

    // Number of claimed slots at which we refuse new keys.
    threshold: usize,

    // Number of slots holding a key, live or tombstoned.
    claimed: AtomicUsize,

    live: Counter,

    /// The table we are being migrated into.
    pub(crate) next: Atomic<Table<K, V>>,

    // False for a table created by a resize until it is promoted.
    accepts_claims: AtomicBool,

    /// Sweep position for helpers copying a quota of slots.
    pub(crate) copy_cursor: AtomicUsize,

    /// Number of slots that have been forwarded.
    pub(crate) copy_done: AtomicUsize,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(
        capacity: usize,
        load_factor: f64,
        live: Counter,
        accepts_claims: bool,
    ) -> Self {
        debug_assert!(capacity.is_power_of_two());

        let slots = (0..capacity)
            .map(|_| Slot {
                key: Atomic::null(),
                value: Atomic::null(),
            })
            .collect();

        let reprobe_limit = usize::min(capacity, REPROBE_BASE + capacity / 4);

        Table {
            slots,
            mask: capacity - 1,
            reprobe_limit,
            probe_limit: AtomicUsize::new(reprobe_limit),
            threshold: threshold(capacity, load_factor),
            claimed: AtomicUsize::new(0),
            live,
            next: Atomic::null(),
            accepts_claims: AtomicBool::new(accepts_claims),
            copy_cursor: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
        }
    }

    /// Raises the growth threshold to at least `min`, within the capacity.
    #[inline]
    pub(crate) fn with_min_threshold(mut self, min: usize) -> Self {
        self.threshold = self.threshold.max(min.min(self.capacity()));
        self
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    #[inline]
    fn probe_limit(&self) -> usize {
        self.probe_limit.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Approximate number of live entries in this table generation.
    #[inline]
    pub(crate) fn live(&self) -> usize {
        // Deletes can be counted before the insert they race with.
        self.live.load(Ordering::Relaxed).max(0) as usize
    }

    #[inline]
    pub(crate) fn counter(&self) -> Counter {
        self.live.clone()
    }

    #[inline]
    pub(crate) fn accepts_claims(&self) -> bool {
        self.accepts_claims.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_accepts_claims(&self) {
        self.accepts_claims.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Option<&'g Table<K, V>> {
        unsafe { self.next.load(Ordering::Acquire, guard).as_ref() }
    }

    #[inline]
    fn start(&self, hash: u64) -> usize {
        // On 32-bit platforms we simply ignore the higher hash bits.
        (hash as usize) & self.mask
    }

    #[inline]
    fn adjust_live(&self, was_live: bool, is_live: bool) {
        match (was_live, is_live) {
            (false, true) => {
                self.live.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
            _ => (),
        }
    }

    /// Scans the probe sequence of `hash` for `key`. Never mutates the table.
    ///
    /// Once a resize is under way the scan reports a slot as moved instead of answering, so the
    /// reader migrates it before continuing in the next table.
    pub(crate) fn find<'g, Q>(&self, hash: u64, key: &Q, guard: &'g Guard) -> Lookup<'g, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let draining = !self.next.load(Ordering::Acquire, guard).is_null();
        let mut index = self.start(hash);
        for _ in 0..self.probe_limit() {
            let slot = &self.slots[index];
            let k = slot.key.load(Ordering::Acquire, guard);
            match unsafe { k.as_ref() } {
                None if k.tag() == SEALED || draining => return Lookup::Moved(index),
                None => return Lookup::Missing,
                Some(node) if node.matches(hash, key) => {
                    if draining {
                        return Lookup::Moved(index);
                    }
                    return match classify(slot.value.load(Ordering::Acquire, guard)) {
                        ValueState::Live(value) => Lookup::Found(value),
                        ValueState::Vacant | ValueState::Tombstone => Lookup::Missing,
                        ValueState::Primed(_) | ValueState::Forwarded => Lookup::Moved(index),
                    };
                }
                Some(_) => (),
            }
            index = (index + 1) & self.mask;
        }
        if draining {
            Lookup::Moved(self.start(hash))
        } else {
            Lookup::Exhausted
        }
    }

    /// Writes `value` for `key`, or a tombstone if `value` is `None`.
    ///
    /// On success `value` has been consumed. On any other outcome it is left in place so the
    /// caller can retry against another table.
    pub(crate) fn put_if_match<'g, Q, F>(
        &self,
        hash: u64,
        key: &Q,
        mut claim: Claim<F>,
        value: &mut Option<Owned<ValueNode<V>>>,
        expect: Expect,
        guard: &'g Guard,
    ) -> Put<'g, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnMut() -> Owned<KeyNode<K>>,
    {
        let limit = match claim {
            Claim::Exhaustive(_) => self.capacity(),
            _ => self.probe_limit(),
        };

        let mut index = self.start(hash);
        for probe in 0..limit {
            let slot = &self.slots[index];
            let mut k = slot.key.load(Ordering::Acquire, guard);

            if k.is_null() {
                if k.tag() == SEALED {
                    return Put::Moved(index);
                }

                let make = match &mut claim {
                    Claim::Never if !self.next.load(Ordering::Acquire, guard).is_null() => {
                        return Put::Moved(index);
                    }
                    Claim::Never => return Put::Done(None),
                    Claim::Bounded(make) => {
                        if !self.next.load(Ordering::Acquire, guard).is_null() {
                            return Put::Moved(index);
                        }
                        if probe >= self.reprobe_limit
                            || !self.accepts_claims()
                            || self.claimed() >= self.threshold
                        {
                            return Put::Full;
                        }
                        make
                    }
                    Claim::Exhaustive(make) => {
                        // Raised before the key is visible so lookups never stop short of it.
                        self.probe_limit.fetch_max(probe + 1, Ordering::AcqRel);
                        make
                    }
                };

                match slot.key.compare_exchange(
                    Shared::null(),
                    make(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        self.claimed.fetch_add(1, Ordering::Relaxed);
                        return self.update(slot, index, value, expect, guard);
                    }
                    Err(err) => {
                        k = err.current;
                        if k.is_null() {
                            return Put::Moved(index);
                        }
                    }
                }
            }

            if unsafe { k.deref() }.matches(hash, key) {
                return self.update(slot, index, value, expect, guard);
            }

            index = (index + 1) & self.mask;
        }

        Put::Full
    }

    fn update<'g>(
        &self,
        slot: &Slot<K, V>,
        index: usize,
        value: &mut Option<Owned<ValueNode<V>>>,
        expect: Expect,
        guard: &'g Guard,
    ) -> Put<'g, V> {
        let mut current = slot.value.load(Ordering::Acquire, guard);
        loop {
            let prior = match classify(current) {
                ValueState::Primed(_) | ValueState::Forwarded => return Put::Moved(index),
                ValueState::Live(value) => Some(value),
                ValueState::Vacant | ValueState::Tombstone => None,
            };

            match expect {
                Expect::Vacant if current.tag() != 0 || !current.is_null() => {
                    return Put::Rejected
                }
                Expect::Vacant => (),
                // Writers and deleters go to the next table once a resize is under way.
                _ if !self.next.load(Ordering::Acquire, guard).is_null() => {
                    return Put::Moved(index)
                }
                Expect::Live if prior.is_none() => return Put::Done(None),
                _ => (),
            }

            let result = match value.take() {
                Some(new) => slot
                    .value
                    .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
                    .map_err(|err| (err.current, Some(err.new))),
                None => slot
                    .value
                    .compare_exchange(
                        current,
                        Shared::null().with_tag(TOMBSTONE),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .map_err(|err| (err.current, None)),
            };

            match result {
                Ok(written) => {
                    if expect != Expect::Vacant {
                        self.adjust_live(prior.is_some(), !written.is_null());
                    }
                    if prior.is_some() {
                        unsafe { guard.defer_destroy(current) };
                    }
                    return Put::Done(prior);
                }
                Err((actual, new)) => {
                    current = actual;
                    *value = new;
                }
            }
        }
    }

    /// Freezes a slot against local mutation so it can be migrated.
    pub(crate) fn mark_forwarded<'g>(&self, index: usize, guard: &'g Guard) -> Freeze<'g, K, V> {
        let slot = &self.slots[index];

        let mut key = slot.key.load(Ordering::Acquire, guard);
        if key.is_null() {
            if key.tag() == SEALED {
                return Freeze::Done;
            }
            match slot.key.compare_exchange(
                Shared::null(),
                Shared::null().with_tag(SEALED),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return Freeze::Sealed,
                Err(err) => {
                    key = err.current;
                    if key.is_null() {
                        return Freeze::Done;
                    }
                }
            }
        }
        let key = unsafe { key.deref() };

        let mut current = slot.value.load(Ordering::Acquire, guard);
        loop {
            let frozen = match classify(current) {
                ValueState::Forwarded => return Freeze::Done,
                ValueState::Primed(_) => {
                    return Freeze::Primed {
                        key,
                        value: current,
                    }
                }
                ValueState::Vacant | ValueState::Tombstone => Shared::null().with_tag(FORWARDED),
                ValueState::Live(_) => current.with_tag(PRIMED),
            };

            match slot.value.compare_exchange(
                current,
                frozen,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) if frozen.is_null() => return Freeze::Sealed,
                Ok(_) => {
                    return Freeze::Primed {
                        key,
                        value: frozen,
                    }
                }
                Err(err) => current = err.current,
            }
        }
    }

    /// Marks a primed slot as forwarded once its value has been copied.
    /// Returns true if this call made the transition.
    pub(crate) fn complete_forward<'g>(
        &self,
        index: usize,
        primed: Shared<'g, ValueNode<V>>,
        guard: &'g Guard,
    ) -> bool {
        debug_assert_eq!(primed.tag(), PRIMED);

        match self.slots[index].value.compare_exchange(
            primed,
            Shared::null().with_tag(FORWARDED),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => {
                unsafe { guard.defer_destroy(primed.with_tag(0)) };
                true
            }
            Err(_) => false,
        }
    }

    /// Returns true if operations on this slot must continue in the next table.
    pub(crate) fn is_forwarded(&self, index: usize, guard: &Guard) -> bool {
        match self.slot_state(index, guard) {
            SlotState::Sealed => true,
            SlotState::Claimed {
                value: ValueState::Forwarded,
                ..
            } => true,
            _ => false,
        }
    }

    pub(crate) fn slot_state<'g>(&self, index: usize, guard: &'g Guard) -> SlotState<'g, K, V> {
        let slot = &self.slots[index];
        let key = slot.key.load(Ordering::Acquire, guard);
        match unsafe { key.as_ref() } {
            None if key.tag() == SEALED => SlotState::Sealed,
            None => SlotState::Free,
            Some(key) => SlotState::Claimed {
                key,
                value: classify(slot.value.load(Ordering::Acquire, guard)),
            },
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // The next table is not owned by this one.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            for slot in self.slots.iter() {
                let key = slot.key.load(Ordering::Relaxed, guard);
                if !key.is_null() {
                    drop(key.with_tag(0).into_owned());
                }
                let value = slot.value.load(Ordering::Relaxed, guard);
                if !value.is_null() {
                    drop(value.with_tag(0).into_owned());
                }
            }
        }
    }
}

/// Frees `table` and every table it was being migrated into.
///
/// # Safety
/// No other thread may reach any table in the chain.
pub(crate) unsafe fn destroy_chain<K, V>(table: Owned<Table<K, V>>) {
    let guard = unsafe { crossbeam_epoch::unprotected() };
    let mut table = Some(table);
    while let Some(current) = table.take() {
        let next = current.next.load(Ordering::Relaxed, guard);
        if !next.is_null() {
            table = Some(unsafe { next.into_owned() });
        }
        drop(current);
    }
}

/// Returns the number of claimed slots at which a table of `capacity` refuses new keys.
#[inline]
pub(crate) fn threshold(capacity: usize, load_factor: f64) -> usize {
    if capacity >= MAX_CAPACITY {
        return capacity;
    }
    let threshold = (capacity as f64 * load_factor).floor() as usize;
    threshold.clamp(1, capacity)
}
