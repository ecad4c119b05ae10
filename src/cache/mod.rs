//! File-backed cache store.
//!
//! A bin is a directory holding one file per cache item plus a small
//! checksum registry used for tag-based invalidation.
//!
//! # Architecture
//!
//! * [`item`]: Item, expiration and lookup result types.
//! * [`codec`]: The on-disk item format.
//! * [`checksum`]: Persisted tag counters and the bin epoch.
//! * [`store`]: [`FileCacheStore`], the get/set/delete/invalidate surface.
//! * [`gc`]: Incremental garbage collection.
//!
//! # Cache Invalidation
//!
//! An item is returned by a normal `get` only while all of the following
//! hold:
//! * Its expiration has not passed
//! * None of its tags was invalidated after it was written
//! * The bin was not invalidated as a whole after it was written
//!
//! Stale items stay on disk until deleted or garbage collected and can still
//! be read with `allow_invalid`.

mod atomic;
pub mod checksum;
pub mod codec;
mod error;
pub mod gc;
pub mod item;
mod lock;
pub mod store;

pub use atomic::TEMP_PREFIX;
pub use checksum::{TagChecksum, TagChecksumRegistry, REGISTRY_DIR};
pub use codec::{decode, encode, DecodeError};
pub use error::{BatchError, StorageError, StorageResult};
pub use gc::{GcBudget, GcReport};
pub use item::{CacheHit, CacheItem, Expiration, NewCacheItem, TagSnapshot};
pub use lock::RegistryLock;
pub use store::{BinStats, FileCacheStore, StoreOptions};
