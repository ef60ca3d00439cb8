//! Fingerprint → value memo with hit/miss counters

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Key for a (sheet, cell, formula) triple
///
/// Sheet and cell are length-prefixed so no two distinct triples share a key.
pub fn fingerprint(sheet: &str, cell: &str, formula: &str) -> String {
    format!("{}:{}|{}:{}|{}", sheet.len(), sheet, cell.len(), cell, formula)
}

/// Memoized results keyed by [`fingerprint`]
///
/// Entries live until removed or cleared; there is no expiry.
#[derive(Debug)]
pub struct ResultMemo<V> {
    entries: RwLock<HashMap<String, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResultMemo<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let found = self.entries.read().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: String, value: V) {
        self.entries.write().insert(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.write().remove(key)
    }

    /// Drop every entry and reset the counters
    pub fn clear(&self) {
        self.entries.write().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

impl<V: Clone> Default for ResultMemo<V> {
    fn default() -> Self {
        Self::new()
    }
}
