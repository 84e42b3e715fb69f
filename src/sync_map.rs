//! A concurrent hash map where reads, writes and deletes are lock-free.
//!
//! Entries live in an open addressed table with linear probing. When a table fills up it is
//! migrated into a successor by whichever threads touch it, see [crate::resize].

use crate::{
    collect::{pin, Pin},
    config::Config,
    resize::{self, current},
    slot_table::{
        destroy_chain, new_counter, Claim, Expect, KeyNode, Lookup, Put, SlotState, Table,
        ValueNode, ValueState,
    },
    util::make_hash,
};
use crossbeam_epoch::{Atomic, Guard, Owned};
use std::{
    borrow::Borrow,
    collections::{hash_map::RandomState, HashMap},
    fmt,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    sync::atomic::Ordering,
};


/// Default hash builder for [SyncMap].
pub type DefaultHashBuilder = RandomState;

/// A hash map with lock-free reads and writes.
pub struct SyncMap<K, V, S = DefaultHashBuilder> {
    hash_builder: S,

    table: Atomic<Table<K, V>>,

    config: Config,

    // Tell dropck that we own instances of K and V.
    marker: PhantomData<(K, V)>,
}

/// A handle to a [SyncMap] with read access.
///
/// It is acquired from a pin and hands out references that live as long as the pin.
pub struct Read<'a, K, V, S = DefaultHashBuilder> {
    map: &'a SyncMap<K, V, S>,
    guard: &'a Guard,
}

impl<K, V, S> Copy for Read<'_, K, V, S> {}
impl<K, V, S> Clone for Read<'_, K, V, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V, S> Drop for SyncMap<K, V, S> {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            let table = self
                .table
                .load(Ordering::Relaxed, crossbeam_epoch::unprotected());
            destroy_chain(table.into_owned());
        }
    }
}

impl<K, V, S: Default> Default for SyncMap<K, V, S> {
    #[inline]
    fn default() -> Self {
        Self::with_config_and_hasher(Config::default(), Default::default())
    }
}

impl<K, V> SyncMap<K, V, DefaultHashBuilder> {
    /// Creates an empty [SyncMap] with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_config(config: Config) -> Self {
        Self::with_config_and_hasher(config, Default::default())
    }
}

impl<K, V, S> SyncMap<K, V, S> {
    #[inline]
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_config_and_hasher(Config::default(), hash_builder)
    }

    pub fn with_config_and_hasher(config: Config, hash_builder: S) -> Self {
        Self {
            hash_builder,
            table: Atomic::new(Self::fresh_table(&config)),
            config,
            marker: PhantomData,
        }
    }

    fn fresh_table(config: &Config) -> Table<K, V> {
        Table::new(
            config.table_capacity(),
            config.load_factor(),
            new_counter(),
            true,
        )
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Creates a [Read] handle from a pinned region.
    ///
    /// Use [crate::collect::pin] to get a `Pin` instance.
    #[inline]
    pub fn read<'a>(&'a self, pin: Pin<'a>) -> Read<'a, K, V, S> {
        Read {
            map: self,
            guard: pin.guard(),
        }
    }

    /// Returns the approximate number of entries.
    ///
    /// Exact when there are no concurrent writers. Entries inserted or removed during the call
    /// may not be counted.
    #[inline]
    pub fn len(&self) -> usize {
        pin(|pin| self.read(pin).len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots in the current table.
    #[inline]
    pub fn capacity(&self) -> usize {
        pin(|pin| self.read(pin).capacity())
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
    {
        make_hash::<K, Q, S>(&self.hash_builder, key)
    }

    /// Returns a clone of the value for `key`.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        pin(|pin| self.read(pin).get(key).cloned())
    }

    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        pin(|pin| self.read(pin).contains_key(key))
    }

    /// Inserts a value for `key`, returning the value it replaced.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let hash = self.hash(&key);
        pin(|pin| self.insert_with_hash(hash, key, value, pin.guard()).cloned())
    }

    /// Removes `key`, returning the value it had.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        pin(|pin| self.remove_with_hash(hash, key, pin.guard()).cloned())
    }

    fn get_with_hash<'g, Q>(&self, hash: u64, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut table = current(&self.table, guard);
        loop {
            match table.find(hash, key, guard) {
                Lookup::Found(value) => return Some(value),
                Lookup::Missing => return None,
                Lookup::Moved(index) => table = resize::help_copy(&self.table, table, index, guard),
                Lookup::Exhausted => match table.next(guard) {
                    Some(next) => table = next,
                    None => return None,
                },
            }
        }
    }

    fn insert_with_hash<'g>(&self, hash: u64, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        let mut value = Some(ValueNode::new(value));
        let mut table = current(&self.table, guard);
        loop {
            match table.put_if_match(
                hash,
                &key,
                Claim::Bounded(|| KeyNode::new(hash, key.clone())),
                &mut value,
                Expect::Any,
                guard,
            ) {
                Put::Done(prior) => return prior,
                Put::Moved(index) => table = resize::help_copy(&self.table, table, index, guard),
                Put::Full => {
                    table = resize::grow(&self.table, table, self.config.load_factor(), guard)
                }
                Put::Rejected => unreachable!("unconditional insert was rejected"),
            }
        }
    }

    fn remove_with_hash<'g, Q>(&self, hash: u64, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut tombstone = None;
        let mut table = current(&self.table, guard);
        loop {
            match table.put_if_match(
                hash,
                key,
                Claim::<fn() -> Owned<KeyNode<K>>>::Never,
                &mut tombstone,
                Expect::Live,
                guard,
            ) {
                Put::Done(prior) => return prior,
                Put::Moved(index) => table = resize::help_copy(&self.table, table, index, guard),
                Put::Full => match table.next(guard) {
                    Some(next) => table = next,
                    None => return None,
                },
                Put::Rejected => unreachable!("deletion was rejected"),
            }
        }
    }

    /// Returns the entries in a single pass over the table.
    ///
    /// Entries that are present for the whole pass are included exactly once. Entries written
    /// during the pass may or may not be included.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        pin(|pin| {
            let guard = pin.guard();
            let mut entries = Vec::new();
            let mut table = current(&self.table, guard);
            let mut chained = false;

            loop {
                for index in 0..table.capacity() {
                    if let SlotState::Claimed { key, value } = table.slot_state(index, guard) {
                        match value {
                            ValueState::Live(value) | ValueState::Primed(value) => {
                                entries.push((key.key.clone(), value.clone()))
                            }
                            _ => (),
                        }
                    }
                }

                // Forwarded entries show up in the successor.
                match table.next(guard) {
                    Some(next) => {
                        table = next;
                        chained = true;
                    }
                    None => break,
                }
            }

            if chained {
                // A key can be seen both before and after it was migrated. Keep the latest.
                let latest: HashMap<K, V> = entries.into_iter().collect();
                latest.into_iter().collect()
            } else {
                entries
            }
        })
    }

    /// Replaces the table with a fresh empty one of the configured initial capacity.
    pub fn clear(&self) {
        let fresh = Owned::new(Self::fresh_table(&self.config));
        pin(|pin| {
            let guard = pin.guard();
            let old = self.table.swap(fresh, Ordering::AcqRel, guard);
            log::trace!("cleared map with {} slots", unsafe { old.deref() }.capacity());
            unsafe {
                guard.defer_unchecked(move || destroy_chain(old.into_owned()));
            }
        })
    }
}

impl<'a, K, V, S> Read<'a, K, V, S> {
    /// Returns the approximate number of entries.
    #[inline]
    pub fn len(self) -> usize {
        current(&self.map.table, self.guard).live()
    }

    /// Returns the number of slots in the current table.
    #[inline]
    pub fn capacity(self) -> usize {
        current(&self.map.table, self.guard).capacity()
    }
}

impl<'a, K, V, S> Read<'a, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    /// Gets a reference to the value for `key`.
    #[inline]
    pub fn get<Q>(self, key: &Q) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.map.hash(key);
        self.map.get_with_hash(hash, key, self.guard)
    }

    #[inline]
    pub fn contains_key<Q>(self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + fmt::Debug + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
