//! Read-only introspection of the cache: record keys, canonical connection
//! keys, record snapshots, watcher counts, and a configuration summary.

use crate::cache::Cache;
use crate::record::{Record, RecordKey};

pub struct Inspector<'a> {
    cache: &'a Cache,
}

/// Summary of the active configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSummary {
    /// Type names with registered keying functions.
    pub keyed_types: Vec<String>,
    /// Interfaces with their flattened concrete implementations.
    pub interfaces: Vec<(String, Vec<String>)>,
    pub materialize_lru: usize,
}

impl<'a> Inspector<'a> {
    pub(crate) fn new(cache: &'a Cache) -> Self {
        Self { cache }
    }

    /// Entity record keys, optionally restricted to one typename. Sorted.
    pub fn entity_keys(&self, typename: Option<&str>) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.cache.with_inner(|inner| {
            inner
                .graph
                .keys()
                .filter(|key| match key.typename() {
                    Some(t) => typename.map_or(true, |want| want == t),
                    None => false,
                })
                .cloned()
                .collect()
        });
        keys.sort_unstable();
        keys
    }

    /// Canonical connection keys, optionally filtered by substring. Sorted.
    pub fn connection_keys(&self, filter: Option<&str>) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.cache.with_inner(|inner| {
            inner
                .canonical
                .keys()
                .filter(|key| filter.map_or(true, |f| key.as_str().contains(f)))
                .cloned()
                .collect()
        });
        keys.sort_unstable();
        keys
    }

    /// Snapshot one record.
    pub fn record(&self, key: &RecordKey) -> Option<Record> {
        self.cache.with_inner(|inner| inner.graph.record(key).cloned())
    }

    /// Number of records in the store.
    pub fn record_count(&self) -> usize {
        self.cache.with_inner(|inner| inner.graph.len())
    }

    /// Number of registered query and fragment watchers.
    pub fn watcher_count(&self) -> usize {
        self.cache.with_inner(|inner| inner.watchers.len())
    }

    /// Number of live optimistic layers.
    pub fn layer_count(&self) -> usize {
        self.cache.with_inner(|inner| inner.optimistic.len())
    }

    pub fn config(&self) -> ConfigSummary {
        let config = self.cache.config();
        ConfigSummary {
            keyed_types: config.key_typenames(),
            interfaces: config.interface_summary(),
            materialize_lru: config.limits().materialize_lru,
        }
    }
}
