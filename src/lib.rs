//! This crate contains [Cache] and [SyncMap], concurrent hash maps with lock-free reads and
//! writes. Tables grow by cooperative migration: threads that run into a table being resized
//! help move its entries before carrying on. Retired tables and values are reclaimed through
//! the epoch based API in the [collect] module.
//!
//! ```
//! use sync_cache::Cache;
//!
//! let cache = Cache::new();
//! assert_eq!(cache.get(&"a"), None);
//! cache.insert("a", 1);
//! assert_eq!(cache.get(&"a"), Some(1));
//! assert_eq!(cache.fetch_or_insert_with("b", |_| 2), 2);
//! ```

#![allow(clippy::len_without_is_empty)]

pub mod cache;
pub mod collect;
pub mod config;
mod error;
mod resize;
mod slot_table;
pub mod sync_map;
mod util;

pub use cache::{Cache, CacheBuilder};
pub use config::{Config, OptionValue, Options};
pub use error::Error;
pub use sync_map::{DefaultHashBuilder, SyncMap};
