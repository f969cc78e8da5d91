//! Short public identifiers for shared documents.
//!
//! An entry code is six characters drawn uniformly from the 62-symbol
//! alphanumeric alphabet (`a-z`, `A-Z`, `0-9`), giving ~56.8 billion codes.
//! Generation is pure; the registry is responsible for rejecting codes that
//! collide with a live document.

use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};

/// Number of characters in a generated entry code.
pub const ENTRY_CODE_LEN: usize = 6;

/// Opaque token addressing one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryCode(String);

impl EntryCode {
    /// Generate a fresh random code.
    ///
    /// Uses the thread-local CSPRNG, which is seeded from the OS per thread,
    /// so concurrent callers never share or correlate state.
    pub fn generate() -> Self {
        Self(Alphanumeric.sample_string(&mut rand::rng(), ENTRY_CODE_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for EntryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntryCode {
    fn from(code: String) -> Self {
        Self(code)
    }
}

impl From<&str> for EntryCode {
    fn from(code: &str) -> Self {
        Self(code.to_owned())
    }
}

impl AsRef<str> for EntryCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for EntryCode {
    fn borrow(&self) -> &str {
        &self.0
    }
}
