//! Canonical asset identity.
//!
//! Every asset is addressed by a 32-bit unsigned "archetype" identity.
//! Identities arrive in many spellings — decimal, signed decimal, hex,
//! float-like strings, or free-text names — and are normalized to a single
//! canonical `u32` before any lookup.

use std::fmt;

/// Canonical 32-bit asset identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub u32);

impl ArchetypeId {
    /// Normalize any accepted identity spelling to its canonical form.
    ///
    /// Accepted forms, tried in order:
    /// - hexadecimal with a `0x`/`0X` prefix
    /// - unsigned decimal
    /// - signed decimal (wrapped two's-complement into `u32`, so `"-1"`
    ///   normalizes to `4294967295`)
    /// - float-like strings (truncated toward zero, then wrapped)
    /// - anything else is treated as a free-text name and hashed
    #[must_use]
    pub fn normalize(input: &str) -> Self {
        let trimmed = input.trim();
        if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            && let Ok(value) = u32::from_str_radix(hex, 16)
        {
            return Self(value);
        }
        if let Ok(value) = trimmed.parse::<u32>() {
            return Self(value);
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return Self::from(value);
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            #[allow(clippy::cast_possible_truncation)]
            return Self::from(value.trunc() as i64);
        }
        Self::hash_name(trimmed)
    }

    /// Hash a free-text asset name into a canonical identity.
    ///
    /// Names are case-folded first so `"Crate_Small"` and `"crate_small"`
    /// address the same asset.
    #[must_use]
    pub fn hash_name(name: &str) -> Self {
        let folded = name.to_lowercase();
        Self(fnv1a_32(folded.as_bytes()))
    }
}

impl From<u32> for ArchetypeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<i64> for ArchetypeId {
    /// Coerce a signed value by wrapping into the `u32` range.
    fn from(value: i64) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self(value as u32)
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit FNV-1a content hash.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
