//! Bounded per-plan caches of materialized results.
//!
//! Each plan owns an LRU keyed by the read's shape: acceptance mode,
//! fingerprint mode, root record, and the stable rendering of its variables.
//! An entry is valid while every dependency's version matches the stamp
//! taken when the entry was produced.

use std::num::NonZeroUsize;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use lru::LruCache;
use plan::PlanId;

use crate::graph::Graph;
use crate::materialize::fingerprint::FingerprintNode;
use crate::materialize::OkFlags;
use crate::record::RecordKey;
use crate::tree::TreeNode;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub canonical: bool,
    pub fingerprint: bool,
    pub root: Option<RecordKey>,
    pub variables: String,
}

#[derive(Clone)]
pub struct CachedEntry {
    pub data: TreeNode,
    pub fingerprints: Option<FingerprintNode>,
    pub dependencies: Arc<FxHashSet<RecordKey>>,
    pub stamp: String,
    pub ok: OkFlags,
}

pub struct ResultCaches {
    per_plan: FxHashMap<PlanId, LruCache<EntryKey, CachedEntry>>,
    capacity: NonZeroUsize,
}

impl ResultCaches {
    pub fn new(capacity: usize) -> Self {
        Self {
            per_plan: FxHashMap::default(),
            capacity: NonZeroUsize::new(capacity.max(1)).unwrap(),
        }
    }

    /// Look up an entry, promoting it in its LRU.
    pub fn get(&mut self, plan: PlanId, key: &EntryKey) -> Option<&CachedEntry> {
        self.per_plan.get_mut(&plan)?.get(key)
    }

    pub fn insert(&mut self, plan: PlanId, key: EntryKey, entry: CachedEntry) {
        self.per_plan
            .entry(plan)
            .or_insert_with(|| LruCache::new(self.capacity))
            .put(key, entry);
    }

    /// Drop one entry. An emptied plan cache is removed entirely.
    pub fn invalidate(&mut self, plan: PlanId, key: &EntryKey) {
        if let Some(cache) = self.per_plan.get_mut(&plan) {
            cache.pop(key);
            if cache.is_empty() {
                self.per_plan.remove(&plan);
            }
        }
    }

    pub fn len(&self, plan: PlanId) -> usize {
        self.per_plan.get(&plan).map_or(0, LruCache::len)
    }
}

/// The dependency stamp: `key#version;` over the sorted dependency keys.
/// Two stamps are equal exactly when every dependency is unchanged.
pub fn stamp(graph: &Graph, dependencies: &FxHashSet<RecordKey>) -> String {
    let mut keys: Vec<&RecordKey> = dependencies.iter().collect();
    keys.sort_unstable();

    let mut out = String::new();
    for key in keys {
        out.push_str(key.as_str());
        out.push('#');
        out.push_str(&graph.version(key).to_string());
        out.push(';');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::{FieldValue, RecordPatch};

    fn entry(stamp: &str) -> CachedEntry {
        CachedEntry {
            data: TreeNode::Null,
            fingerprints: None,
            dependencies: Arc::new(FxHashSet::default()),
            stamp: stamp.to_string(),
            ok: OkFlags {
                strict: true,
                canonical: true,
            },
        }
    }

    fn key(variables: &str) -> EntryKey {
        EntryKey {
            canonical: true,
            fingerprint: true,
            root: None,
            variables: variables.to_string(),
        }
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut caches = ResultCaches::new(2);
        let plan = PlanId(1);

        caches.insert(plan, key("a"), entry("a"));
        caches.insert(plan, key("b"), entry("b"));
        // Touch "a" so "b" is the eviction candidate.
        assert!(caches.get(plan, &key("a")).is_some());
        caches.insert(plan, key("c"), entry("c"));

        assert!(caches.get(plan, &key("a")).is_some());
        assert!(caches.get(plan, &key("b")).is_none());
        assert!(caches.get(plan, &key("c")).is_some());
    }

    #[test]
    fn stamps_change_with_versions() {
        let mut graph = Graph::new();
        let a = RecordKey::entity("User", "a");
        let mut deps = FxHashSet::default();
        deps.insert(a.clone());

        let before = stamp(&graph, &deps);
        assert_eq!(before, "User:a#0;");

        let mut patch = RecordPatch::new();
        patch.insert("x".into(), FieldValue::Bool(true));
        graph.put(&a, patch);
        assert_eq!(stamp(&graph, &deps), "User:a#1;");
    }

    #[test]
    fn stamps_are_order_independent() {
        let graph = Graph::new();
        let mut d1 = FxHashSet::default();
        d1.insert(RecordKey::new("b"));
        d1.insert(RecordKey::new("a"));
        let mut d2 = FxHashSet::default();
        d2.insert(RecordKey::new("a"));
        d2.insert(RecordKey::new("b"));

        assert_eq!(stamp(&graph, &d1), stamp(&graph, &d2));
    }
}
