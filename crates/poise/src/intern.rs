//! Hash-keyed string interning.
//!
//! Identifiers, member names and namespace paths are compared by 64-bit hash
//! everywhere in the compiler and VM; the pool keeps the canonical text so
//! error messages can print the original name.

use std::{
    hash::{BuildHasher, Hash},
    path::{Path, PathBuf},
};

use ahash::{AHashMap, RandomState};

/// Fixed-seed hasher state so hashes are stable for the life of the process
/// and across every `Vm` instance (bytecode constants embed them).
fn hasher_state() -> RandomState {
    RandomState::with_seeds(
        0x6f70_5f70_6f69_7365,
        0x7363_616e_6e65_7221,
        0x636f_6d70_696c_6572,
        0x6e61_6d65_7370_6163,
    )
}

/// Hashes an identifier or member name.
#[must_use]
pub fn hash_string(s: &str) -> u64 {
    hasher_state().hash_one(s)
}

/// Hashes an arbitrary hashable value with the same stable state.
#[must_use]
pub fn hash_of(value: &impl Hash) -> u64 {
    hasher_state().hash_one(value)
}

/// Canonicalizes a path as far as the filesystem allows and hashes it.
///
/// Namespace identity is the hash of the canonical path, so the same file
/// reached through different relative spellings compiles exactly once.
#[must_use]
pub fn hash_path(path: &Path) -> u64 {
    let canonical: PathBuf = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    hash_string(&canonical.to_string_lossy())
}

/// Pool mapping name hashes to their canonical strings.
///
/// Owned by the [`crate::Vm`] rather than being process-global so independent
/// VMs (and tests) never observe each other's names.
#[derive(Debug, Default)]
pub struct StringPool {
    strings: AHashMap<u64, String>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its hash. Re-interning is a no-op.
    pub fn intern(&mut self, s: impl Into<String>) -> u64 {
        let s = s.into();
        let hash = hash_string(&s);
        self.strings.entry(hash).or_insert(s);
        hash
    }

    /// Looks up the canonical string for a hash, if one was interned.
    #[must_use]
    pub fn lookup(&self, hash: u64) -> Option<&str> {
        self.strings.get(&hash).map(String::as_str)
    }

    /// Returns the canonical string or a placeholder for error messages.
    #[must_use]
    pub fn lookup_or_unknown(&self, hash: u64) -> &str {
        self.lookup(hash).unwrap_or("<unknown>")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello world");
        let b = pool.intern("hello world");
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.lookup(a), Some("hello world"));
    }

    #[test]
    fn distinct_strings_distinct_hashes() {
        let mut pool = StringPool::new();
        let names = ["foo", "bar", "baz", "", "foo_bar", "a::b::c"];
        for name in names {
            pool.intern(name);
        }
        assert_eq!(pool.len(), names.len());
    }

    #[test]
    fn hash_is_stable_between_pools() {
        let mut a = StringPool::new();
        let mut b = StringPool::new();
        assert_eq!(a.intern("main"), b.intern("main"));
        assert_eq!(hash_string("main"), a.intern("main"));
    }
}
