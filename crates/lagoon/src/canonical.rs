//! Canonical connection assembly.
//!
//! Every concrete page write lands under its own page key. Pages sharing a
//! `(parent, field, filters)` identity are folded into one canonical record
//! whose edge list is a pure function of the per-connection meta and the page
//! records themselves. Rebuilds never consult snapshots, which is what makes
//! optimistic revert safe: reverting restores page records and replays the
//! rebuild.

use fxhash::{FxHashMap, FxHashSet};
use plan::ConnectionMode;
use serde_json::Value;

use crate::graph::Graph;
use crate::record::{FieldValue, Record, RecordKey, RecordPatch};

/// The role a page plays in the canonical ordering.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageHint {
    Before,
    After,
    Leader,
}

/// Whether a page registration came from the network or from a non-network
/// (prewarm) path. Prewarm never destructively resets a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdatePath {
    Network,
    Prewarm,
}

/// Per-canonical-key assembly state.
#[derive(Debug, Default)]
pub struct ConnectionMeta {
    /// Pages in arrival order.
    pages: Vec<RecordKey>,
    leader: Option<RecordKey>,
    hints: FxHashMap<RecordKey, PageHint>,
    /// The page most recently written, which is the whole view in
    /// [`ConnectionMode::Page`].
    latest: Option<RecordKey>,
    mode: ConnectionMode,
}

impl ConnectionMeta {
    /// Deterministic page order: before-hinted pages in arrival order, then
    /// the leader, then after-hinted (or unhinted) pages in arrival order.
    pub fn ordered_pages(&self) -> Vec<RecordKey> {
        if self.mode == ConnectionMode::Page {
            return self.latest.iter().cloned().collect();
        }

        let mut out = Vec::with_capacity(self.pages.len());
        for page in &self.pages {
            if self.hints.get(page) == Some(&PageHint::Before) {
                out.push(page.clone());
            }
        }
        if let Some(leader) = &self.leader {
            out.push(leader.clone());
        }
        for page in &self.pages {
            match self.hints.get(page) {
                Some(PageHint::Before) | Some(PageHint::Leader) => {}
                _ => out.push(page.clone()),
            }
        }
        out
    }

    pub fn pages(&self) -> &[RecordKey] {
        &self.pages
    }

    pub fn leader(&self) -> Option<&RecordKey> {
        self.leader.as_ref()
    }

    pub fn hint(&self, page: &RecordKey) -> Option<PageHint> {
        self.hints.get(page).copied()
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }
}

/// Detect the role of a page from its evaluated request arguments: a page
/// requested with neither `after` nor `before` is a leader. Only declared
/// plan arguments are consulted; an explicit `null` cursor counts as unset.
pub fn detect_role(args: &[(&str, Value)]) -> PageHint {
    let is_set = |name: &str| {
        args.iter()
            .any(|(arg, value)| *arg == name && !value.is_null())
    };
    if is_set("before") {
        PageHint::Before
    } else if is_set("after") {
        PageHint::After
    } else {
        PageHint::Leader
    }
}

#[derive(Default)]
pub struct CanonicalStore {
    meta: FxHashMap<RecordKey, ConnectionMeta>,
}

impl CanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta(&self, key: &RecordKey) -> Option<&ConnectionMeta> {
        self.meta.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.meta.keys()
    }

    /// Register a page under its canonical key and fold it into the meta.
    ///
    /// A leader arriving over the network resets the connection to just that
    /// page: refetching from the start discards previously accumulated
    /// pages. On the prewarm path a leader merely fills an empty slot.
    pub fn register_page(
        &mut self,
        canonical: &RecordKey,
        page: &RecordKey,
        role: PageHint,
        path: UpdatePath,
        mode: ConnectionMode,
    ) {
        let meta = self.meta.entry(canonical.clone()).or_default();
        meta.mode = mode;
        meta.latest = Some(page.clone());

        if role == PageHint::Leader && path == UpdatePath::Network {
            tracing::debug!(canonical = %canonical, page = %page, "leader page reset");
            meta.pages = vec![page.clone()];
            meta.leader = Some(page.clone());
            meta.hints = FxHashMap::default();
            meta.hints.insert(page.clone(), PageHint::Leader);
            return;
        }

        if !meta.pages.contains(page) {
            meta.pages.push(page.clone());
        }
        match role {
            PageHint::Leader => {
                if meta.leader.is_none() {
                    meta.leader = Some(page.clone());
                }
                meta.hints.insert(page.clone(), PageHint::Leader);
            }
            hint => {
                meta.hints.insert(page.clone(), hint);
            }
        }
    }

    /// Recompute the canonical record strictly from the ordered page records.
    ///
    /// Edges are the concatenation of each ordered page's edges with
    /// first-seen dedup by node reference; a duplicate's edge fields merge
    /// into the kept edge. The aggregated pageInfo takes `startCursor` and
    /// `hasPreviousPage` from the head page and `endCursor`/`hasNextPage`
    /// from the tail.
    pub fn rebuild_from_meta(&self, graph: &mut Graph, canonical: &RecordKey) {
        let Some(meta) = self.meta.get(canonical) else {
            return;
        };
        let ordered: Vec<RecordKey> = meta
            .ordered_pages()
            .into_iter()
            .filter(|page| graph.contains(page))
            .collect();

        let mut canonical_patch = RecordPatch::new();
        let mut edge_keys: Vec<Option<RecordKey>> = Vec::new();
        let mut seen: FxHashMap<RecordKey, RecordKey> = FxHashMap::default();
        let mut duplicate_merges: Vec<(RecordKey, RecordPatch)> = Vec::new();

        for page in &ordered {
            let Some(page_record) = graph.record(page) else {
                continue;
            };
            for (field_key, value) in page_record.fields() {
                if matches!(field_key, "edges" | "pageInfo") {
                    continue;
                }
                canonical_patch.insert(field_key.to_string(), value.clone());
            }

            let Some(refs) = page_record.get("edges").and_then(FieldValue::as_links) else {
                continue;
            };
            for edge_key in refs.iter().flatten() {
                let node = graph
                    .record(edge_key)
                    .and_then(|edge| edge.get("node"))
                    .and_then(FieldValue::as_link)
                    .cloned();
                match node {
                    Some(node) => match seen.get(&node) {
                        None => {
                            seen.insert(node, edge_key.clone());
                            edge_keys.push(Some(edge_key.clone()));
                        }
                        Some(kept) => {
                            // Duplicate node: its edge meta wins on the kept edge.
                            if let Some(edge) = graph.record(edge_key) {
                                let patch: RecordPatch = edge
                                    .fields()
                                    .filter(|(k, _)| *k != "node")
                                    .map(|(k, v)| (k.to_string(), v.clone()))
                                    .collect();
                                if !patch.is_empty() {
                                    duplicate_merges.push((kept.clone(), patch));
                                }
                            }
                        }
                    },
                    // An edge without a node link cannot be deduplicated.
                    None => edge_keys.push(Some(edge_key.clone())),
                }
            }
        }
        for (kept, patch) in duplicate_merges {
            graph.put(&kept, patch);
        }

        let page_info = aggregate_page_info(graph, &ordered);
        let page_info_key = RecordKey::derived(canonical, "pageInfo");
        // Replacement, not merge: the canonical view is strictly a function
        // of the page records, so nothing else may linger on it.
        graph.replace(&page_info_key, page_info);

        canonical_patch.insert("edges".to_string(), FieldValue::Links(edge_keys));
        canonical_patch.insert("pageInfo".to_string(), FieldValue::Link(page_info_key));
        graph.replace(canonical, canonical_patch);
    }

}

fn page_info_record<'g>(graph: &'g Graph, page: &RecordKey) -> Option<&'g Record> {
    graph
        .record(page)?
        .get("pageInfo")
        .and_then(FieldValue::as_link)
        .and_then(|key| graph.record(key))
}

fn aggregate_page_info(graph: &Graph, ordered: &[RecordKey]) -> RecordPatch {
    let mut out = RecordPatch::new();
    let (Some(head), Some(tail)) = (ordered.first(), ordered.last()) else {
        return out;
    };

    // Merge head then tail, so extras come from the most recent end.
    for page in [head, tail] {
        if let Some(info) = page_info_record(graph, page) {
            for (k, v) in info.fields() {
                out.insert(k.to_string(), v.clone());
            }
        }
    }
    // Head wins the backward-facing fields.
    if let Some(info) = page_info_record(graph, head) {
        for field in ["startCursor", "hasPreviousPage"] {
            match info.get(field) {
                Some(value) => {
                    out.insert(field.to_string(), value.clone());
                }
                None => {
                    out.remove(field);
                }
            }
        }
    }
    out
}

/// Track nodes already present in a canonical edge list, for overlay dedup.
pub fn nodes_in_edges(graph: &Graph, edges: &[Option<RecordKey>]) -> FxHashSet<RecordKey> {
    edges
        .iter()
        .flatten()
        .filter_map(|edge_key| {
            graph
                .record(edge_key)
                .and_then(|edge| edge.get("node"))
                .and_then(FieldValue::as_link)
                .cloned()
        })
        .collect()
}
