//! A concurrent cache with optional on-miss computation.
//!
//! [Cache] layers fetch semantics over a [SyncMap]. A missing key can be populated either by a
//! default proc given at construction, which `get` consults, or by a callback passed to one of
//! the `fetch_*` methods, whose result is stored.

use crate::{
    config::{Config, Options, CONCURRENCY_LEVEL, INITIAL_CAPACITY, LOAD_FACTOR},
    error::Error,
    sync_map::{DefaultHashBuilder, SyncMap},
};
use std::{
    borrow::Borrow,
    fmt,
    hash::{BuildHasher, Hash},
    ops::ControlFlow,
};


/// Computes a value for a key missing from `get`.
///
/// It receives the cache so it can populate it, but nothing is stored on its behalf.
pub type DefaultProc<K, V, S = DefaultHashBuilder> =
    Box<dyn Fn(&Cache<K, V, S>, &K) -> Option<V> + Send + Sync>;

/// A concurrent key/value cache.
///
/// Values that should be distinguishable from a missing entry can be stored by making them
/// optional themselves, e.g. `Cache<K, Option<T>>`.
pub struct Cache<K, V, S = DefaultHashBuilder> {
    map: SyncMap<K, V, S>,
    default_proc: Option<DefaultProc<K, V, S>>,
}

/// Configures and builds a [Cache].
pub struct CacheBuilder<K, V, S = DefaultHashBuilder> {
    options: Options,
    default_proc: Option<DefaultProc<K, V, S>>,
    hash_builder: S,
}

impl<K, V> CacheBuilder<K, V, DefaultHashBuilder> {
    #[inline]
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for CacheBuilder<K, V, DefaultHashBuilder> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> CacheBuilder<K, V, S> {
    pub fn with_hasher(hash_builder: S) -> Self {
        CacheBuilder {
            options: Options::new(),
            default_proc: None,
            hash_builder,
        }
    }

    /// Number of entries the first table should hold without resizing.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.options.insert(INITIAL_CAPACITY, capacity);
        self
    }

    pub fn load_factor(mut self, load_factor: f64) -> Self {
        self.options.insert(LOAD_FACTOR, load_factor);
        self
    }

    /// Expected number of concurrently writing threads. Used as a lower bound on the table size.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.options.insert(CONCURRENCY_LEVEL, level);
        self
    }

    /// Merges untyped options. Later values replace earlier ones with the same name.
    pub fn options(mut self, options: Options) -> Self {
        self.options.extend(options);
        self
    }

    pub fn default_proc(
        mut self,
        default_proc: impl Fn(&Cache<K, V, S>, &K) -> Option<V> + Send + Sync + 'static,
    ) -> Self {
        self.default_proc = Some(Box::new(default_proc));
        self
    }

    /// Validates the options and creates the cache.
    pub fn build(self) -> Result<Cache<K, V, S>, Error> {
        let config = Config::from_options(&self.options)?;
        Ok(Cache {
            map: SyncMap::with_config_and_hasher(config, self.hash_builder),
            default_proc: self.default_proc,
        })
    }
}

impl<K, V> Cache<K, V, DefaultHashBuilder> {
    /// Creates an empty cache with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache, validating `options` first.
    pub fn with_options(options: &Options) -> Result<Self, Error> {
        let config = Config::from_options(options)?;
        Ok(Cache {
            map: SyncMap::with_config(config),
            default_proc: None,
        })
    }

    #[inline]
    pub fn builder() -> CacheBuilder<K, V, DefaultHashBuilder> {
        CacheBuilder::new()
    }
}

impl<K, V, S: Default> Default for Cache<K, V, S> {
    #[inline]
    fn default() -> Self {
        Cache {
            map: SyncMap::default(),
            default_proc: None,
        }
    }
}

impl<K, V, S> Cache<K, V, S> {
    #[inline]
    pub fn config(&self) -> &Config {
        self.map.config()
    }

    /// Returns the underlying map.
    #[inline]
    pub fn map(&self) -> &SyncMap<K, V, S> {
        &self.map
    }

    #[inline]
    pub fn has_default_proc(&self) -> bool {
        self.default_proc.is_some()
    }

    /// Returns the approximate number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    /// Returns the value for `key`.
    ///
    /// On a miss the default proc, if any, is called and its result returned. Whether anything
    /// is stored is up to the default proc.
    ///
    /// Unlike the other lookups this takes `&K` rather than a borrowed form, since the default
    /// proc is handed the key. Use [Cache::fetch] to look up by a borrowed form.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.map.get(key) {
            Some(value) => Some(value),
            None => self
                .default_proc
                .as_ref()
                .and_then(|default_proc| default_proc(self, key)),
        }
    }

    /// Returns the value for `key` without consulting the default proc.
    #[inline]
    pub fn fetch<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key)
    }

    /// Returns the value for `key`, computing and storing it with `f` if it is missing.
    pub fn fetch_or_insert_with(&self, key: K, f: impl FnOnce(&K) -> V) -> V {
        match self.fetch_or_try_insert_with(key, |key| Ok::<V, std::convert::Infallible>(f(key))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Returns the value for `key`, computing and storing it with `f` if it is missing.
    ///
    /// If `f` fails the error is returned and nothing is stored.
    pub fn fetch_or_try_insert_with<E>(
        &self,
        key: K,
        f: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.map.get(&key) {
            return Ok(value);
        }
        let value = f(&key)?;
        self.map.insert(key, value.clone());
        Ok(value)
    }

    /// Like [Cache::fetch_or_insert_with], but `f` can abort by returning `None`.
    pub fn try_fetch_with(&self, key: K, f: impl FnOnce(&K) -> Option<V>) -> Result<V, Error> {
        self.fetch_or_try_insert_with(key, |key| f(key).ok_or(Error::ComputationAborted))
    }

    /// Like [Cache::fetch_or_insert_with], but `f` can return early with a value of its own.
    ///
    /// A [ControlFlow::Break] is passed back to the caller and nothing is stored.
    pub fn fetch_with<B>(&self, key: K, f: impl FnOnce(&K) -> ControlFlow<B, V>) -> ControlFlow<B, V> {
        let result = self.fetch_or_try_insert_with(key, |key| match f(key) {
            ControlFlow::Continue(value) => Ok(value),
            ControlFlow::Break(early) => Err(early),
        });
        match result {
            Ok(value) => ControlFlow::Continue(value),
            Err(early) => ControlFlow::Break(early),
        }
    }

    /// Stores `value` under `key`, returning the value it replaced.
    #[inline]
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    /// Returns true if `key` has an entry. The default proc is not consulted.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Removes `key`. Returns true if it had an entry.
    #[inline]
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).is_some()
    }

    /// Removes every entry.
    #[inline]
    pub fn clear(&self) -> &Self {
        self.map.clear();
        self
    }

    /// Calls `visit` once for each entry of a [Cache::snapshot].
    pub fn each_pair(&self, mut visit: impl FnMut(&K, &V)) -> &Self {
        for (key, value) in self.map.snapshot() {
            visit(&key, &value);
        }
        self
    }

    #[inline]
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.map.snapshot()
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + fmt::Debug + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}
