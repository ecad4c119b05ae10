//! Cache item definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Counter values of an item's tags at the time it was written.
///
/// A `BTreeMap` keeps tags de-duplicated and sorted, which makes the on-disk
/// representation stable.
pub type TagSnapshot = BTreeMap<String, u64>;

/// When a cache item stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum Expiration {
    /// Never expires. Only explicit deletion or invalidation removes it.
    #[default]
    Permanent,
    /// Expires once the clock passes this unix timestamp (seconds).
    At(i64),
}

impl Expiration {
    /// Expiration `ttl` from now.
    #[must_use]
    pub fn after(ttl: Duration) -> Self {
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self::At(Utc::now().timestamp().saturating_add(secs))
    }

    /// Expiration at a point in time, truncated to whole seconds.
    #[must_use]
    pub fn at(time: DateTime<Utc>) -> Self {
        Self::At(time.timestamp())
    }

    /// An expiration that has already passed.
    #[must_use]
    pub fn already_expired() -> Self {
        Self::At(Utc::now().timestamp() - 1)
    }

    /// Whether this is the permanent sentinel.
    #[must_use]
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::Permanent)
    }

    /// Whether the item is expired at unix time `now`.
    #[must_use]
    pub fn is_expired_at(self, now: i64) -> bool {
        match self {
            Self::Permanent => false,
            Self::At(expire) => expire < now,
        }
    }

    /// Whether the item is expired right now.
    #[must_use]
    pub fn is_expired(self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }
}

impl From<Option<i64>> for Expiration {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Self::Permanent, Self::At)
    }
}

impl From<Expiration> for Option<i64> {
    fn from(value: Expiration) -> Self {
        match value {
            Expiration::Permanent => None,
            Expiration::At(ts) => Some(ts),
        }
    }
}

/// A single cache item as stored in its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    /// The caller's key, before normalization.
    pub key: String,
    /// Opaque cached data.
    pub payload: Vec<u8>,
    /// When the item expires.
    pub expiration: Expiration,
    /// Tag counters captured at write time.
    pub tags: TagSnapshot,
    /// Bin epoch captured at write time.
    pub epoch: u64,
    /// When the item was written.
    pub created_at: DateTime<Utc>,
}

impl CacheItem {
    /// Create an item stamped with the current time.
    pub fn new(
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        expiration: Expiration,
        tags: TagSnapshot,
        epoch: u64,
    ) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            expiration,
            tags,
            epoch,
            created_at: Utc::now(),
        }
    }

    /// Tag names this item depends on.
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    /// The stored item.
    pub item: CacheItem,
    /// False when the item is expired or invalidated and was only returned
    /// because the caller allowed invalid items.
    pub valid: bool,
}

impl CacheHit {
    /// The cached data.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.item.payload
    }
}

/// An item to be written by a batch `set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCacheItem {
    /// Caller key.
    pub key: String,
    /// Data to store.
    pub payload: Vec<u8>,
    /// Expiration, permanent by default.
    pub expiration: Expiration,
    /// Tags the item depends on. Duplicates are fine.
    pub tags: Vec<String>,
}

impl NewCacheItem {
    /// A permanent, untagged item.
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            expiration: Expiration::Permanent,
            tags: Vec::new(),
        }
    }

    /// Set the expiration.
    #[must_use]
    pub fn expires(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Add tags.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}
