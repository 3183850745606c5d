//! Grammar signatures
//!
//! A compiled module exports the signature of the grammar it was built from
//! (`rules_hash`). Build tooling computes the same value from the grammar
//! sources so a session can detect modules built from an older grammar.
//! The bridge itself only ever compares signatures for equality.

use std::fmt;

use sha2::{Digest, Sha256};

/// Content-derived identifier of a grammar
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GrammarSignature(String);

impl GrammarSignature {
    /// Wrap a signature string as exported by a module
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Compute the signature of grammar and lexer sources
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` hash
    /// differently.
    pub fn compute<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            let bytes = part.as_ref();
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }

        Self(format!("{:x}", hasher.finalize()))
    }

    /// The signature text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `found` is this signature
    pub fn matches(&self, found: &str) -> bool {
        self.0 == found
    }
}

impl fmt::Display for GrammarSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GrammarSignature {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for GrammarSignature {
    fn from(value: String) -> Self {
        Self(value)
    }
}
