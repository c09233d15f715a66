//! Parameter key snapshots.
//!
//! A [`KeySet`] captures the identifiers of every learnable parameter of a model
//! at one point in time. Snapshots are only ever diffed, never edited.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{PeftError, Result};

/// Identifier of one parameter tensor in the flattened parameter space.
pub type ParameterKey = String;

/// Immutable, order-independent set of parameter keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    keys: BTreeSet<ParameterKey>,
}

impl KeySet {
    /// Capture keys from any iterator of key-like items.
    pub fn capture<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ParameterKey>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Keys in `self` that are not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            keys: self.keys.difference(&other.keys).cloned().collect(),
        }
    }

    /// Apply a renaming to every key.
    #[must_use]
    pub fn map_keys(&self, f: impl Fn(&str) -> ParameterKey) -> Self {
        Self::capture(self.keys.iter().map(|k| f(k)))
    }

    /// Check whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate keys in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Require that `actual` holds exactly the keys of `self`.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::KeyMismatch`] listing missing and unexpected keys.
    pub fn ensure_matches(&self, actual: &Self) -> Result<()> {
        if self == actual {
            return Ok(());
        }
        Err(PeftError::KeyMismatch {
            missing: self.keys.difference(&actual.keys).cloned().collect(),
            unexpected: actual.keys.difference(&self.keys).cloned().collect(),
        })
    }
}

impl fmt::Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} keys", self.keys.len())
    }
}

impl<'a> IntoIterator for &'a KeySet {
    type Item = &'a ParameterKey;
    type IntoIter = std::collections::btree_set::Iter<'a, ParameterKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}
