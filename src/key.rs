//! Cache key normalization.
//!
//! Cache item files are named after their key. File systems disagree on which
//! characters and lengths they accept, so every key is mapped to a name that
//! only uses alphanumerics, hyphens and underscores and is at most
//! [`MAX_NAME_LEN`] bytes long.
//!
//! Keys that already satisfy that rule are used verbatim, which means two
//! distinct valid keys can never collide. Any other key is mapped through a
//! SHA-256 hash (base64url, no padding).
//!
//! # Example
//!
//! ```
//! use filecache::key::{normalize, is_valid_name};
//!
//! assert_eq!(normalize("page_1"), "page_1");
//!
//! let name = normalize("page:1");
//! assert!(is_valid_name(&name));
//! assert_eq!(name.len(), 43);
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Maximum length of a normalized name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Returns true if `c` is allowed in a normalized name.
#[inline]
fn is_safe_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-' || c == b'_'
}

/// Returns true if `s` only uses `[A-Za-z0-9_-]` and is non-empty.
#[inline]
fn uses_safe_charset(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_safe_char)
}

/// Check whether `name` is already a valid file name for a cache item.
///
/// A valid name matches `[A-Za-z0-9_-]{1,255}`.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && uses_safe_charset(name)
}

/// SHA-256 of `data`, encoded as base64url without padding.
///
/// The result is always 43 characters long and only uses the safe alphabet.
#[must_use]
pub fn hash_base64(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Normalize a cache key into a file-system safe name.
///
/// - Valid names are returned unchanged.
/// - Keys with characters outside the safe alphabet (including the empty
///   key) become the bare hash.
/// - Safe but over-long keys keep as much of their prefix as fits, followed
///   by the hash of the full key.
#[must_use]
pub fn normalize(key: &str) -> Cow<'_, str> {
    if is_valid_name(key) {
        return Cow::Borrowed(key);
    }

    let hash = hash_base64(key);
    if !uses_safe_charset(key) {
        return Cow::Owned(hash);
    }

    // Safe charset is pure ASCII so byte slicing is on a char boundary.
    let keep = MAX_NAME_LEN - hash.len();
    let mut name = String::with_capacity(MAX_NAME_LEN);
    name.push_str(&key[..keep]);
    name.push_str(&hash);
    Cow::Owned(name)
}
