//! Deterministic item keys.
//!
//! Every replica must derive the same key for the same bookmark, so the
//! normalization rules and the hash below are part of the wire contract.
//! Changing either one changes every key and breaks agreement with replicas
//! running an older build.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Tag for leaf (bookmark) keys.
pub const LEAF_TAG: &str = "bm_";
/// Tag for container (folder) keys.
pub const CONTAINER_TAG: &str = "fd_";

/// Stable identifier of an item across replicas.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Derive the key for an item.
    ///
    /// Leaves hash their normalized URL; containers hash
    /// `parent_title|title`, with an absent parent hashing as "".
    pub fn derive(url: Option<&str>, title: &str, parent_title: Option<&str>) -> Self {
        match url {
            Some(url) => Self(format!("{}{:016x}", LEAF_TAG, fnv1a(normalize_url(url)))),
            None => {
                let input = format!("{}|{}", parent_title.unwrap_or(""), title);
                Self(format!("{}{:016x}", CONTAINER_TAG, fnv1a(&input)))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_container(&self) -> bool {
        self.0.starts_with(CONTAINER_TAG)
    }
}

impl Display for ItemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Trim surrounding whitespace and strip a single trailing slash.
///
/// Case is preserved: `http://X.test` and `http://x.test` are different keys.
pub fn normalize_url(url: &str) -> &str {
    let trimmed = url.trim();
    trimmed.strip_suffix('/').unwrap_or(trimmed)
}

/// 64-bit FNV-1a.
/// Stable across Rust versions and platforms (unlike DefaultHasher).
pub fn fnv1a(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
