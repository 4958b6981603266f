//! Insertion-ordered keyed collections for pipeline products.
//!
//! Maps, harmonic coefficients, spectra and mixing matrices are all
//! stored in a [`Toc`] ("table of contents") keyed by composite keys:
//! `(field, bin)` for single-map collections, `(field1, field2, bin1,
//! bin2)` for two-point collections. Keys support wildcard patterns
//! for include/exclude filtering, where `None` in any position
//! matches every value.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Key into a keyed collection, matchable against a wildcard pattern.
pub trait TocKey: Clone + Eq + Hash {
    /// Wildcard pattern type for this key.
    type Pattern;

    /// Whether this key matches the given pattern.
    fn matches(&self, pattern: &Self::Pattern) -> bool;
}

/// Key for single-map collections: one field name, one catalog bin.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapKey {
    pub field: String,
    pub bin: i64,
}

impl MapKey {
    pub fn new(field: impl Into<String>, bin: i64) -> Self {
        Self {
            field: field.into(),
            bin,
        }
    }
}

/// Wildcard pattern over [`MapKey`]; `None` matches anything.
#[derive(Clone, Debug, Default)]
pub struct MapPattern {
    pub field: Option<String>,
    pub bin: Option<i64>,
}

impl MapPattern {
    pub fn new(field: Option<&str>, bin: Option<i64>) -> Self {
        Self {
            field: field.map(str::to_owned),
            bin,
        }
    }
}

impl TocKey for MapKey {
    type Pattern = MapPattern;

    fn matches(&self, pattern: &MapPattern) -> bool {
        pattern.field.as_deref().map_or(true, |f| f == self.field)
            && pattern.bin.map_or(true, |b| b == self.bin)
    }
}

/// Key for two-point collections: two field names, two catalog bins.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClKey {
    pub field1: String,
    pub field2: String,
    pub bin1: i64,
    pub bin2: i64,
}

impl ClKey {
    pub fn new(field1: impl Into<String>, field2: impl Into<String>, bin1: i64, bin2: i64) -> Self {
        Self {
            field1: field1.into(),
            field2: field2.into(),
            bin1,
            bin2,
        }
    }

    /// The same key with both sides exchanged.
    pub fn swapped(&self) -> Self {
        Self {
            field1: self.field2.clone(),
            field2: self.field1.clone(),
            bin1: self.bin2,
            bin2: self.bin1,
        }
    }
}

/// Wildcard pattern over [`ClKey`]; `None` matches anything.
#[derive(Clone, Debug, Default)]
pub struct ClPattern {
    pub field1: Option<String>,
    pub field2: Option<String>,
    pub bin1: Option<i64>,
    pub bin2: Option<i64>,
}

impl ClPattern {
    pub fn new(
        field1: Option<&str>,
        field2: Option<&str>,
        bin1: Option<i64>,
        bin2: Option<i64>,
    ) -> Self {
        Self {
            field1: field1.map(str::to_owned),
            field2: field2.map(str::to_owned),
            bin1,
            bin2,
        }
    }

    /// Pattern matching every auto/cross combination of two field names.
    pub fn fields(field1: &str, field2: &str) -> Self {
        Self::new(Some(field1), Some(field2), None, None)
    }
}

impl TocKey for ClKey {
    type Pattern = ClPattern;

    fn matches(&self, pattern: &ClPattern) -> bool {
        pattern.field1.as_deref().map_or(true, |f| f == self.field1)
            && pattern.field2.as_deref().map_or(true, |f| f == self.field2)
            && pattern.bin1.map_or(true, |b| b == self.bin1)
            && pattern.bin2.map_or(true, |b| b == self.bin2)
    }
}

/// Whether a key passes the include/exclude pattern filters.
///
/// With no include list every key is a candidate; otherwise at least
/// one include pattern must match. Any matching exclude pattern
/// rejects the key.
pub fn toc_match<K: TocKey>(
    key: &K,
    include: Option<&[K::Pattern]>,
    exclude: &[K::Pattern],
) -> bool {
    if let Some(patterns) = include {
        if !patterns.iter().any(|p| key.matches(p)) {
            return false;
        }
    }
    !exclude.iter().any(|p| key.matches(p))
}

/// Sparse mapping from composite keys to values, preserving insertion
/// order.
///
/// Re-inserting an existing key replaces the value in place without
/// changing its position.
#[derive(Clone, Debug)]
pub struct Toc<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
    index: HashMap<K, usize>,
}

impl<K: TocKey, V> Toc<K, V> {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&i| &self.values[i])
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.index.get(key).map(|&i| &mut self.values[i])
    }

    pub fn insert(&mut self, key: K, value: V) {
        match self.index.get(&key) {
            Some(&i) => self.values[i] = value,
            None => {
                self.index.insert(key.clone(), self.keys.len());
                self.keys.push(key);
                self.values.push(value);
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.keys.iter().zip(self.values.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.keys.iter().zip(self.values.iter_mut())
    }

    /// Iterate over entries whose key passes the pattern filters.
    pub fn matching<'a>(
        &'a self,
        include: Option<&'a [K::Pattern]>,
        exclude: &'a [K::Pattern],
    ) -> impl Iterator<Item = (&'a K, &'a V)> {
        self.iter()
            .filter(move |(k, _)| toc_match(*k, include, exclude))
    }
}

impl<K: TocKey, V> Default for Toc<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, K: TocKey, V> IntoIterator for &'a Toc<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = std::iter::Zip<std::slice::Iter<'a, K>, std::slice::Iter<'a, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter().zip(self.values.iter())
    }
}
