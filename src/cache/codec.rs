//! On-disk encoding of cache items.
//!
//! Each item file holds a single JSON record:
//!
//! ```json
//! {
//!   "format": "filecache-item",
//!   "version": 1,
//!   "key": "page:1",
//!   "checksum": "<sha256 hex of the payload>",
//!   "payload": "<base64>",
//!   "expire": null,
//!   "tags": { "node:5": 2 },
//!   "epoch": 0,
//!   "created": "2024-01-01T00:00:00Z"
//! }
//! ```
//!
//! Unknown fields are ignored so newer writers stay readable. Anything that
//! does not decode to a complete, checksum-verified item is a
//! [`DecodeError`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::item::{CacheItem, Expiration, TagSnapshot};

/// Format marker written into every item file.
pub const ITEM_FORMAT: &str = "filecache-item";

/// Current version of the item record.
pub const ITEM_VERSION: u32 = 1;

/// Reasons a byte stream is not a usable cache item.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, truncated, or missing required fields.
    #[error("malformed cache item: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON but written by something else.
    #[error("not a cache item (format '{0}')")]
    ForeignFormat(String),

    /// Record version this reader cannot interpret.
    #[error("unsupported cache item version: {0}")]
    UnsupportedVersion(u32),

    /// Payload is not valid base64.
    #[error("invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),

    /// Payload does not match its recorded checksum.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Serialize)]
struct ItemRecordRef<'a> {
    format: &'a str,
    version: u32,
    key: &'a str,
    checksum: String,
    payload: String,
    expire: Expiration,
    tags: &'a TagSnapshot,
    epoch: u64,
    created: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ItemRecord {
    format: String,
    version: u32,
    key: String,
    checksum: String,
    payload: String,
    #[serde(default)]
    expire: Expiration,
    #[serde(default)]
    tags: TagSnapshot,
    #[serde(default)]
    epoch: u64,
    created: DateTime<Utc>,
}

fn payload_checksum(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// Serialize an item. Output is deterministic for a given item.
pub fn encode(item: &CacheItem) -> Result<Vec<u8>, serde_json::Error> {
    let record = ItemRecordRef {
        format: ITEM_FORMAT,
        version: ITEM_VERSION,
        key: &item.key,
        checksum: payload_checksum(&item.payload),
        payload: STANDARD.encode(&item.payload),
        expire: item.expiration,
        tags: &item.tags,
        epoch: item.epoch,
        created: item.created_at,
    };
    serde_json::to_vec(&record)
}

/// Deserialize and verify an item.
pub fn decode(bytes: &[u8]) -> Result<CacheItem, DecodeError> {
    let record: ItemRecord = serde_json::from_slice(bytes)?;

    if record.format != ITEM_FORMAT {
        return Err(DecodeError::ForeignFormat(record.format));
    }
    if record.version == 0 {
        return Err(DecodeError::UnsupportedVersion(record.version));
    }

    let payload = STANDARD.decode(record.payload.as_bytes())?;
    if payload_checksum(&payload) != record.checksum {
        return Err(DecodeError::ChecksumMismatch);
    }

    Ok(CacheItem {
        key: record.key,
        payload,
        expiration: record.expire,
        tags: record.tags,
        epoch: record.epoch,
        created_at: record.created,
    })
}
