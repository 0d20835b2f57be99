//! Content digests and chain identity.
//!
//! Digests have the canonical `sha256:<hex>` form. Chain identity follows the
//! recursive rule `chain(parent, next) = sha256(parent || " " || next)` so
//! that a layer's position in its parent chain is content-addressable.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Computes the digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Computes the digest of a string's UTF-8 bytes.
    pub fn from_string(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    /// Parses a canonical `sha256:<64 hex>` digest string.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix("sha256:")?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Digest(s.to_string()))
    }

    /// Returns the canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Computes the chain digest of a parent chain digest and the next member.
    pub fn chain(parent: &Digest, next: &Digest) -> Digest {
        Digest::from_string(&format!("{} {}", parent.0, next.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
