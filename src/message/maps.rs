//! Per-message maps and fan-out control.
//!
//! The four maps carried by a connector message have different sharing
//! rules: `source_map` is immutable after dispatch and shared by reference
//! across every connector message of one message; `channel_map` is shared by
//! reference within a chain but copied by value when forking a new chain;
//! `connector_map` is per-connector; `response_map` is shared across a chain
//! so later destinations can read earlier responses. [`MessageMap`] models
//! the reference-sharing via a cloneable handle and the by-value fork via
//! [`MessageMap::deep_copy`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::MetaDataId;

/// A shareable key/value map scoped to one message.
///
/// Cloning the handle shares the underlying storage; [`Self::deep_copy`]
/// forks an independent copy. Locks are held only for the duration of a
/// single operation, never across await points.
#[derive(Debug, Default, Clone)]
pub struct MessageMap {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl MessageMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map seeded with the given entries.
    #[must_use]
    pub fn from_entries(entries: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entries)),
        }
    }

    /// Returns a clone of the value under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().expect("map lock poisoned").get(key).cloned()
    }

    /// Inserts or replaces the value under `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner
            .lock()
            .expect("map lock poisoned")
            .insert(key.into(), value);
    }

    /// Removes and returns the value under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().expect("map lock poisoned").remove(key)
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("map lock poisoned").is_empty()
    }

    /// A point-in-time copy of the entries.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.lock().expect("map lock poisoned").clone()
    }

    /// Replaces the entire contents with `entries`.
    pub fn restore(&self, entries: HashMap<String, Value>) {
        *self.inner.lock().expect("map lock poisoned") = entries;
    }

    /// Forks an independent copy; mutations on either side stay invisible
    /// to the other. This is the chain-fork semantic for `channel_map`.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self::from_entries(self.snapshot())
    }

    /// Whether two handles share the same underlying storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Controls which destinations are eligible in the current fan-out.
///
/// Source transformer scripts call [`Self::remove_by_name`] to suppress a
/// destination; the effect is scoped to the dispatch that owns this set.
/// Destinations removed here are persisted as FILTERED when the chain
/// reaches them.
#[derive(Debug, Clone)]
pub struct DestinationSet {
    eligible: Arc<Mutex<HashSet<MetaDataId>>>,
    names: Arc<HashMap<String, MetaDataId>>,
}

impl DestinationSet {
    /// Builds a set in which every named destination starts eligible.
    #[must_use]
    pub fn new(destinations: impl IntoIterator<Item = (String, MetaDataId)>) -> Self {
        let names: HashMap<String, MetaDataId> = destinations.into_iter().collect();
        let eligible = names.values().copied().collect();
        Self {
            eligible: Arc::new(Mutex::new(eligible)),
            names: Arc::new(names),
        }
    }

    /// Removes a destination by connector name. Returns whether the name
    /// resolved to a known destination.
    pub fn remove_by_name(&self, name: &str) -> bool {
        match self.names.get(name) {
            Some(meta_data_id) => {
                self.eligible
                    .lock()
                    .expect("destination set lock poisoned")
                    .remove(meta_data_id);
                true
            }
            None => false,
        }
    }

    /// Removes a destination by metadata id.
    pub fn remove(&self, meta_data_id: MetaDataId) {
        self.eligible
            .lock()
            .expect("destination set lock poisoned")
            .remove(&meta_data_id);
    }

    /// Whether the destination is still eligible to run.
    #[must_use]
    pub fn contains(&self, meta_data_id: MetaDataId) -> bool {
        self.eligible
            .lock()
            .expect("destination set lock poisoned")
            .contains(&meta_data_id)
    }
}
