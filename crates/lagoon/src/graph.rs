//! The keyed record store. Assigns per-record monotonically increasing
//! versions and accumulates the keys changed by each write batch.
//!
//! The graph itself never fans change notifications out; the cache opens a
//! batch around each public write operation and publishes the drained batch
//! exactly once, after the store has reached its post-write state.

use std::collections::BTreeMap;

use fxhash::{FxHashMap, FxHashSet};

use crate::record::{Record, RecordKey, RecordPatch};

#[derive(Default)]
pub struct Graph {
    records: FxHashMap<RecordKey, Record>,
    // Versions survive record deletion so that observed versions are
    // monotonically nondecreasing for every key, ever.
    versions: FxHashMap<RecordKey, u64>,
    batch: Vec<RecordKey>,
    batch_set: FxHashSet<RecordKey>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &RecordKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.contains_key(key)
    }

    /// Version of a key: 0 when never written, otherwise the count of
    /// mutating writes it has seen. Reads never change versions.
    pub fn version(&self, key: &RecordKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Merge `patch` into the record at `key`, creating it if absent.
    /// The version bumps exactly when some field value changed; a write that
    /// changes nothing does not bump and does not join the batch.
    pub fn put(&mut self, key: &RecordKey, patch: RecordPatch) -> bool {
        let record = self.records.entry(key.clone()).or_default();
        let changed = record.merge(patch);
        if changed {
            self.bump(key);
        }
        changed
    }

    /// Replace the whole record at `key` with `fields`.
    pub fn replace(&mut self, key: &RecordKey, fields: BTreeMap<String, crate::record::FieldValue>) -> bool {
        let record = self.records.entry(key.clone()).or_default();
        let changed = record.replace(fields);
        if changed {
            self.bump(key);
        }
        changed
    }

    /// Delete the record at `key`. Deleting an absent record is a no-op;
    /// deleting a present one bumps its version and joins the batch.
    pub fn remove(&mut self, key: &RecordKey) -> bool {
        if self.records.remove(key).is_some() {
            self.bump(key);
            true
        } else {
            false
        }
    }

    /// Restore `key` to a snapshot taken earlier: a record to reinstate, or
    /// `None` to delete. Used by optimistic revert.
    pub fn restore(&mut self, key: &RecordKey, snapshot: Option<Record>) {
        match snapshot {
            Some(record) => {
                let slot = self.records.entry(key.clone()).or_default();
                if *slot != record {
                    *slot = record;
                    self.bump(key);
                }
            }
            None => {
                self.remove(key);
            }
        }
    }

    fn bump(&mut self, key: &RecordKey) {
        *self.versions.entry(key.clone()).or_insert(0) += 1;
        if self.batch_set.insert(key.clone()) {
            self.batch.push(key.clone());
        }
    }

    /// Drain the keys changed since the last drain, in first-change order.
    pub fn take_batch(&mut self) -> Vec<RecordKey> {
        self.batch_set.clear();
        std::mem::take(&mut self.batch)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
