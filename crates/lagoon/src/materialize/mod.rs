//! Materialization: reconstruct a tree-shaped result from the record store
//! for a given plan and variables.
//!
//! The walk gathers records by following field keys to links, emits a tree,
//! tracks every record key it consulted, and computes per-node fingerprints.
//! Data-shape anomalies never raise: a missing required field or record
//! degrades the result's `ok` flags and the walk continues, so observers can
//! render partial states without ambiguity.

use std::collections::BTreeMap;
use std::sync::Arc;

use fxhash::FxHashSet;
use plan::{Document, FieldPlan, SelectionSet, Variables};
use serde_json::Value;

use crate::config::CacheConfig;
use crate::error::Error;
use crate::graph::Graph;
use crate::keys;
use crate::record::{FieldValue, Record, RecordKey};
use crate::tree::TreeNode;

pub mod fingerprint;
pub mod recycle;
pub mod results;

use fingerprint::{
    mix_array, mix_object, scalar_hash, FingerprintNode, FpArray, FpObject, TAG_BOOL, TAG_JSON,
    TAG_NULL, TAG_NUMBER, TAG_STRING,
};
use results::{CachedEntry, EntryKey, ResultCaches};

/// Where a materialized result's data was accepted from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// The concrete page for the request variables was present.
    Strict,
    /// The canonical connection view sufficed.
    Canonical,
    /// The requested acceptance mode failed.
    None,
}

/// Acceptance flags computed during a single walk, for both modes at once.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OkFlags {
    pub strict: bool,
    pub canonical: bool,
}

/// A materialization request. Defaults: canonical acceptance, fingerprints
/// on, cache preferred but not updated, root at `@`.
#[derive(Clone)]
pub struct ReadRequest {
    pub plan: Arc<Document>,
    pub variables: Variables,
    pub canonical: bool,
    pub fingerprint: bool,
    pub root: Option<RecordKey>,
    pub prefer_cache: bool,
    pub update_cache: bool,
    pub force: bool,
}

impl ReadRequest {
    pub fn new(plan: Arc<Document>) -> Self {
        Self {
            plan,
            variables: Variables::new(),
            canonical: true,
            fingerprint: true,
            root: None,
            prefer_cache: true,
            update_cache: false,
            force: false,
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn canonical(mut self, canonical: bool) -> Self {
        self.canonical = canonical;
        self
    }

    pub fn fingerprint(mut self, fingerprint: bool) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn root(mut self, root: RecordKey) -> Self {
        self.root = Some(root);
        self
    }

    pub fn prefer_cache(mut self, prefer_cache: bool) -> Self {
        self.prefer_cache = prefer_cache;
        self
    }

    pub fn update_cache(mut self, update_cache: bool) -> Self {
        self.update_cache = update_cache;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub(crate) fn entry_key(&self) -> EntryKey {
        EntryKey {
            canonical: self.canonical,
            fingerprint: self.fingerprint,
            root: self.root.clone(),
            variables: keys::stable_json(&Value::Object(self.variables.clone())),
        }
    }
}

/// The outcome of a materialization.
#[derive(Clone)]
pub struct MaterializedResult {
    pub data: TreeNode,
    pub fingerprints: Option<FingerprintNode>,
    pub dependencies: Arc<FxHashSet<RecordKey>>,
    pub source: Source,
    pub ok: OkFlags,
    pub hot: bool,
}

fn source_of(canonical_mode: bool, ok: OkFlags) -> Source {
    if canonical_mode {
        if ok.canonical {
            Source::Canonical
        } else {
            Source::None
        }
    } else if ok.strict {
        Source::Strict
    } else {
        Source::None
    }
}

/// Materialize a read against the store, consulting and optionally updating
/// the per-plan result cache.
pub fn materialize(
    graph: &Graph,
    config: &CacheConfig,
    results: &mut ResultCaches,
    request: &ReadRequest,
) -> Result<MaterializedResult, Error> {
    let entry_key = request.entry_key();
    let plan_id = request.plan.id();

    if request.prefer_cache && !request.force {
        if let Some(entry) = results.get(plan_id, &entry_key) {
            if results::stamp(graph, &entry.dependencies) == entry.stamp {
                let ok = entry.ok;
                return Ok(MaterializedResult {
                    data: entry.data.clone(),
                    fingerprints: entry.fingerprints.clone(),
                    dependencies: entry.dependencies.clone(),
                    source: source_of(request.canonical, ok),
                    ok,
                    hot: true,
                });
            }
        }
    }

    let root_key = request.root.clone().unwrap_or_else(RecordKey::root);
    let mut walker = Walker {
        graph,
        config,
        vars: &request.variables,
        deps: FxHashSet::default(),
        ok: OkFlags {
            strict: true,
            canonical: true,
        },
        visited: FxHashSet::default(),
    };
    let node = match walker.selection_object(&root_key, request.plan.root())? {
        Some(node) => node,
        None => {
            walker.ok = OkFlags {
                strict: false,
                canonical: false,
            };
            MutNode::Object {
                version: 0,
                fields: Vec::new(),
            }
        }
    };
    let ok = walker.ok;

    let (mut data, fingerprints) = if request.fingerprint {
        let (data, fp) = freeze(node);
        (data, Some(fp))
    } else {
        (freeze_plain(node), None)
    };

    // Recycle against the cached entry even when its stamp is stale: the
    // unchanged subtrees keep their previous identity.
    if let Some(next_fp) = &fingerprints {
        if let Some(entry) = results.get(plan_id, &entry_key) {
            if let Some(prev_fp) = &entry.fingerprints {
                data = recycle::recycle(&entry.data, prev_fp, data, next_fp);
            }
        }
    }

    let dependencies = Arc::new(walker.deps);
    let stamp = results::stamp(graph, &dependencies);
    if request.update_cache {
        results.insert(
            plan_id,
            entry_key,
            CachedEntry {
                data: data.clone(),
                fingerprints: fingerprints.clone(),
                dependencies: dependencies.clone(),
                stamp,
                ok,
            },
        );
    }

    Ok(MaterializedResult {
        data,
        fingerprints,
        dependencies,
        source: source_of(request.canonical, ok),
        ok,
        hot: false,
    })
}

/// Mutable tree under construction. Objects and arrays remember the version
/// of the record that produced them, for fingerprint mixing at freeze time.
enum MutNode {
    Scalar(TreeNode),
    Object {
        version: u64,
        fields: Vec<(String, MutNode)>,
    },
    Array {
        version: u64,
        items: Vec<MutNode>,
    },
}

fn freeze(node: MutNode) -> (TreeNode, FingerprintNode) {
    match node {
        MutNode::Scalar(leaf) => {
            let fp = match &leaf {
                TreeNode::Null => scalar_hash(TAG_NULL, b""),
                TreeNode::Bool(b) => scalar_hash(TAG_BOOL, &[*b as u8]),
                TreeNode::Number(n) => scalar_hash(TAG_NUMBER, n.to_string().as_bytes()),
                TreeNode::String(s) => scalar_hash(TAG_STRING, s.as_bytes()),
                TreeNode::Json(v) => scalar_hash(TAG_JSON, keys::stable_json(v).as_bytes()),
                TreeNode::Array(_) | TreeNode::Object(_) => 0,
            };
            (leaf, FingerprintNode::Scalar(fp))
        }
        MutNode::Object { version, fields } => {
            let mut data = BTreeMap::new();
            let mut children = BTreeMap::new();
            for (key, child) in fields {
                let (child_data, child_fp) = freeze(child);
                data.insert(key.clone(), child_data);
                children.insert(key, child_fp);
            }
            let fp = mix_object(version, children.iter().map(|(k, f)| (k.as_str(), f.value())));
            (
                TreeNode::object(data),
                FingerprintNode::Object(Arc::new(FpObject { fp, children })),
            )
        }
        MutNode::Array { version, items } => {
            let mut data = Vec::with_capacity(items.len());
            let mut fps = Vec::with_capacity(items.len());
            for item in items {
                let (child_data, child_fp) = freeze(item);
                data.push(child_data);
                fps.push(child_fp);
            }
            let fp = mix_array(version, fps.iter().map(FingerprintNode::value));
            (
                TreeNode::array(data),
                FingerprintNode::Array(Arc::new(FpArray { fp, items: fps })),
            )
        }
    }
}

fn freeze_plain(node: MutNode) -> TreeNode {
    match node {
        MutNode::Scalar(leaf) => leaf,
        MutNode::Object { fields, .. } => TreeNode::object(
            fields
                .into_iter()
                .map(|(key, child)| (key, freeze_plain(child)))
                .collect(),
        ),
        MutNode::Array { items, .. } => {
            TreeNode::array(items.into_iter().map(freeze_plain).collect())
        }
    }
}

struct Walker<'a> {
    graph: &'a Graph,
    config: &'a CacheConfig,
    vars: &'a Variables,
    deps: FxHashSet<RecordKey>,
    ok: OkFlags,
    visited: FxHashSet<(RecordKey, String, RecordKey)>,
}

impl<'a> Walker<'a> {
    fn missing(&mut self) {
        self.ok.strict = false;
        self.ok.canonical = false;
    }

    /// Entity (and root, pageInfo, inline container) task: read the record
    /// and emit its selected fields. `None` means the record is absent.
    fn selection_object(
        &mut self,
        key: &RecordKey,
        selection: &SelectionSet,
    ) -> Result<Option<MutNode>, Error> {
        self.deps.insert(key.clone());
        let graph = self.graph;
        let Some(record) = graph.record(key) else {
            return Ok(None);
        };
        let version = graph.version(key);

        let mut fields: Vec<(String, MutNode)> = Vec::new();
        if let Some(typename) = record.typename() {
            fields.push((
                "__typename".to_string(),
                MutNode::Scalar(TreeNode::String(typename.to_string())),
            ));
        }
        for field in selection.fields() {
            if !self.type_condition_matches(field, record) {
                continue;
            }
            if field.field_name == "__typename" {
                if field.response_key != "__typename" {
                    if let Some(typename) = record.typename() {
                        fields.push((
                            field.response_key.clone(),
                            MutNode::Scalar(TreeNode::String(typename.to_string())),
                        ));
                    }
                }
                continue;
            }
            if field.is_connection {
                let node = self.connection(key, field)?;
                fields.push((field.response_key.clone(), node));
                continue;
            }
            self.emit_field(key, record, version, field, &mut fields)?;
        }
        Ok(Some(MutNode::Object { version, fields }))
    }

    /// One plain (non-connection) field of a record.
    fn emit_field(
        &mut self,
        key: &RecordKey,
        record: &'a Record,
        version: u64,
        field: &FieldPlan,
        fields: &mut Vec<(String, MutNode)>,
    ) -> Result<(), Error> {
        let field_key = keys::field_key(field, self.vars);
        match record.get(&field_key) {
            // Selected but absent: emit nothing, the read is incomplete.
            None => self.missing(),

            Some(FieldValue::Null) => {
                fields.push((field.response_key.clone(), MutNode::Scalar(TreeNode::Null)));
            }

            Some(FieldValue::Link(child)) => match &field.selection {
                Some(child_selection) => {
                    // Reference cycles terminate here: an edge already on
                    // the current path is not followed again.
                    let step = (key.clone(), field_key.clone(), child.clone());
                    if !self.visited.insert(step.clone()) {
                        return Ok(());
                    }
                    let child_node = self.selection_object(child, child_selection)?;
                    self.visited.remove(&step);
                    match child_node {
                        Some(node) => fields.push((field.response_key.clone(), node)),
                        None => self.missing(),
                    }
                }
                None => self.missing(),
            },

            Some(FieldValue::Links(refs)) => match &field.selection {
                Some(child_selection) => {
                    let mut items = Vec::with_capacity(refs.len());
                    for child in refs {
                        match child {
                            None => items.push(MutNode::Scalar(TreeNode::Null)),
                            Some(child) => {
                                // Same cycle guard as single links; a broken
                                // cycle keeps its slot as null.
                                let step = (key.clone(), field_key.clone(), child.clone());
                                if !self.visited.insert(step.clone()) {
                                    items.push(MutNode::Scalar(TreeNode::Null));
                                    continue;
                                }
                                let child_node =
                                    self.selection_object(child, child_selection)?;
                                self.visited.remove(&step);
                                match child_node {
                                    Some(node) => items.push(node),
                                    None => {
                                        self.missing();
                                        items.push(MutNode::Scalar(TreeNode::Null));
                                    }
                                }
                            }
                        }
                    }
                    fields.push((
                        field.response_key.clone(),
                        MutNode::Array { version, items },
                    ));
                }
                None => self.missing(),
            },

            Some(FieldValue::Json(value)) => {
                fields.push((
                    field.response_key.clone(),
                    MutNode::Scalar(TreeNode::Json(Arc::new(value.clone()))),
                ));
            }

            Some(FieldValue::Bool(b)) => {
                fields.push((field.response_key.clone(), MutNode::Scalar(TreeNode::Bool(*b))));
            }
            Some(FieldValue::Number(n)) => {
                fields.push((
                    field.response_key.clone(),
                    MutNode::Scalar(TreeNode::Number(n.clone())),
                ));
            }
            Some(FieldValue::String(s)) => {
                fields.push((
                    field.response_key.clone(),
                    MutNode::Scalar(TreeNode::String(s.clone())),
                ));
            }
        }
        Ok(())
    }

    /// Connection task: always emits the canonical view; the acceptance mode
    /// only decides which ok flag survives.
    fn connection(&mut self, parent: &RecordKey, field: &FieldPlan) -> Result<MutNode, Error> {
        let canonical = keys::canonical_key(field, parent, self.vars);
        let page = keys::page_key(field, parent, self.vars);
        self.deps.insert(canonical.clone());
        self.deps.insert(page.clone());

        let graph = self.graph;
        let canonical_exists = graph.contains(&canonical);
        let page_exists = graph.contains(&page);
        self.ok.canonical &= canonical_exists;
        self.ok.strict &= canonical_exists && page_exists;

        let selection = field.selection.as_ref().ok_or_else(|| Error::Plan {
            response_key: field.response_key.clone(),
        })?;
        let version = graph.version(&canonical);
        let record = graph.record(&canonical);

        let mut fields: Vec<(String, MutNode)> = Vec::new();
        if let Some(typename) = record.and_then(Record::typename) {
            fields.push((
                "__typename".to_string(),
                MutNode::Scalar(TreeNode::String(typename.to_string())),
            ));
        }
        for sub in selection.fields() {
            if sub.field_name == "__typename" {
                continue;
            }
            match sub.field_name.as_str() {
                "edges" => {
                    let edge_selection = sub.selection.as_ref().ok_or_else(|| Error::Plan {
                        response_key: sub.response_key.clone(),
                    })?;
                    let mut items = Vec::new();
                    let refs = record
                        .and_then(|r| r.get("edges"))
                        .and_then(FieldValue::as_links);
                    for edge in refs.into_iter().flatten() {
                        match edge {
                            None => items.push(MutNode::Scalar(TreeNode::Null)),
                            Some(edge_key) => items.push(self.edge(edge_key, edge_selection)?),
                        }
                    }
                    fields.push((
                        sub.response_key.clone(),
                        MutNode::Array { version, items },
                    ));
                }
                "pageInfo" => {
                    let info_selection = sub.selection.as_ref().ok_or_else(|| Error::Plan {
                        response_key: sub.response_key.clone(),
                    })?;
                    let link = record
                        .and_then(|r| r.get("pageInfo"))
                        .and_then(FieldValue::as_link);
                    let node = match link {
                        Some(info_key) => self.selection_object(info_key, info_selection)?,
                        None => None,
                    };
                    match node {
                        Some(node) => fields.push((sub.response_key.clone(), node)),
                        None => {
                            if canonical_exists {
                                self.missing();
                            }
                            fields.push((
                                sub.response_key.clone(),
                                MutNode::Object {
                                    version: 0,
                                    fields: Vec::new(),
                                },
                            ));
                        }
                    }
                }
                _ if sub.is_connection => {
                    let node = self.connection(&canonical, sub)?;
                    fields.push((sub.response_key.clone(), node));
                }
                _ => {
                    if let Some(record) = record {
                        self.emit_field(&canonical, record, version, sub, &mut fields)?;
                    }
                }
            }
        }
        Ok(MutNode::Object { version, fields })
    }

    /// Edge task: selected edge scalars, plus the node behind its link.
    fn edge(&mut self, key: &RecordKey, selection: &SelectionSet) -> Result<MutNode, Error> {
        self.deps.insert(key.clone());
        let graph = self.graph;
        let Some(record) = graph.record(key) else {
            self.missing();
            return Ok(MutNode::Scalar(TreeNode::Null));
        };
        let version = graph.version(key);

        let mut fields: Vec<(String, MutNode)> = Vec::new();
        if let Some(typename) = record.typename() {
            fields.push((
                "__typename".to_string(),
                MutNode::Scalar(TreeNode::String(typename.to_string())),
            ));
        }
        for field in selection.fields() {
            if field.field_name == "__typename" {
                continue;
            }
            if field.field_name == "node" {
                match record.get("node") {
                    None => self.missing(),
                    Some(FieldValue::Null) => {
                        fields.push((field.response_key.clone(), MutNode::Scalar(TreeNode::Null)));
                    }
                    Some(FieldValue::Link(node_key)) => {
                        let node_selection =
                            field.selection.as_ref().ok_or_else(|| Error::Plan {
                                response_key: field.response_key.clone(),
                            })?;
                        let step = (key.clone(), "node".to_string(), node_key.clone());
                        if !self.visited.insert(step.clone()) {
                            continue;
                        }
                        let node = self.selection_object(node_key, node_selection)?;
                        self.visited.remove(&step);
                        match node {
                            Some(node) => fields.push((field.response_key.clone(), node)),
                            None => self.missing(),
                        }
                    }
                    Some(_) => self.missing(),
                }
            } else {
                self.emit_field(key, record, version, field, &mut fields)?;
            }
        }
        Ok(MutNode::Object { version, fields })
    }

    fn type_condition_matches(&self, field: &FieldPlan, record: &Record) -> bool {
        let Some(condition) = &field.type_condition else {
            return true;
        };
        match record.typename() {
            Some(typename) => self.config.matches_type(condition, typename),
            None => false,
        }
    }
}
