//! Address normalization for cache keys.
//!
//! Rules, applied in order:
//! - full-width ASCII forms (U+FF01..U+FF5E) and the ideographic space fold to ASCII
//! - ASCII letters are lowercased
//! - every run of whitespace becomes one space, leading/trailing whitespace is dropped
//!
//! Each rule maps its own output to itself, so the composition is idempotent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical form of an address, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedAddress(String);

impl NormalizedAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn fold_char(c: char) -> char {
    match c {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

/// Canonicalize free-text address input.
pub fn normalize(raw: &str) -> NormalizedAddress {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for c in raw.chars().map(fold_char).map(|c| c.to_ascii_lowercase()) {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    NormalizedAddress(out)
}
