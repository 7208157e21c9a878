//! Optimistic layering: revertible overlays of entity patches and
//! connection edits.
//!
//! Every builder call records an op on its layer and applies it to the base
//! store immediately, so observers see optimistic state without a separate
//! read path. Baselines are captured per record key on first touch across
//! the lifetime of the layer stack and drain when the last layer is removed.
//! Canonical connection records are never baselined: revert recomputes them
//! from their page records.

use std::rc::Rc;

use fxhash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::canonical::{nodes_in_edges, CanonicalStore};
use crate::config::CacheConfig;
use crate::error::OptimisticError;
use crate::graph::Graph;
use crate::keys;
use crate::record::{patch_from_json, FieldValue, Record, RecordKey, RecordPatch};

/// How an entity patch lands on its record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PatchMode {
    #[default]
    Merge,
    Replace,
}

/// Target of an entity op: a record key, or an identifiable object.
#[derive(Clone)]
pub enum Target {
    Key(RecordKey),
    Object(Value),
}

impl From<RecordKey> for Target {
    fn from(key: RecordKey) -> Self {
        Target::Key(key)
    }
}

impl From<&RecordKey> for Target {
    fn from(key: &RecordKey) -> Self {
        Target::Key(key.clone())
    }
}

impl From<&str> for Target {
    fn from(key: &str) -> Self {
        Target::Key(RecordKey::new(key))
    }
}

impl From<Value> for Target {
    fn from(object: Value) -> Self {
        Target::Object(object)
    }
}

/// A patch value, or a function of the current record producing one.
/// Functions are re-invoked on every replay.
#[derive(Clone)]
pub enum PatchSpec {
    Data(Value),
    With(Rc<dyn Fn(Option<&Record>) -> Value>),
}

impl PatchSpec {
    pub fn with(f: impl Fn(Option<&Record>) -> Value + 'static) -> Self {
        PatchSpec::With(Rc::new(f))
    }

    fn resolve(&self, current: Option<&Record>) -> Value {
        match self {
            PatchSpec::Data(value) => value.clone(),
            PatchSpec::With(f) => f(current),
        }
    }
}

impl From<Value> for PatchSpec {
    fn from(value: Value) -> Self {
        PatchSpec::Data(value)
    }
}

/// Identity of a connection for the optimistic editor, where no plan field
/// is in scope: an optional parent entity key, the connection's stable name,
/// and its filter object.
#[derive(Debug, Clone)]
pub struct ConnectionRef {
    parent: Option<RecordKey>,
    key: String,
    filters: Value,
}

impl ConnectionRef {
    /// A connection under the root.
    pub fn root(key: impl Into<String>) -> Self {
        Self {
            parent: None,
            key: key.into(),
            filters: Value::Null,
        }
    }

    /// A connection under a parent entity. `"Query"` means the root.
    pub fn on(parent: impl AsRef<str>, key: impl Into<String>) -> Self {
        let parent = parent.as_ref();
        Self {
            parent: (parent != "Query" && !parent.is_empty())
                .then(|| RecordKey::new(parent)),
            key: key.into(),
            filters: Value::Null,
        }
    }

    pub fn filters(mut self, filters: Value) -> Self {
        self.filters = filters;
        self
    }

    pub fn canonical_key(&self) -> RecordKey {
        keys::canonical_key_from_parts(self.parent.as_ref(), &self.key, &self.filters)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Position {
    Front,
    Back,
}

enum Op {
    Patch {
        target: Target,
        patch: PatchSpec,
        mode: PatchMode,
    },
    Delete {
        target: Target,
    },
    ConnectionInsert {
        canonical: RecordKey,
        edge_key: RecordKey,
        node: Value,
        edge: Value,
        position: Position,
    },
    ConnectionRemove {
        canonical: RecordKey,
        target: Target,
    },
    ConnectionPatch {
        canonical: RecordKey,
        patch: PatchSpec,
    },
}

impl Op {
    fn canonical_target(&self) -> Option<&RecordKey> {
        match self {
            Op::ConnectionInsert { canonical, .. }
            | Op::ConnectionRemove { canonical, .. }
            | Op::ConnectionPatch { canonical, .. } => Some(canonical),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LayerState {
    Pending,
    Committed,
}

struct Layer {
    id: u64,
    state: LayerState,
    ops: Vec<Op>,
    touched: FxHashSet<RecordKey>,
}

/// Handle to a built optimistic layer. Finalize through
/// `Cache::commit_optimistic` / `Cache::revert_optimistic`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OptimisticTxn {
    pub(crate) id: u64,
}

type Baselines = FxHashMap<RecordKey, Option<Record>>;

#[derive(Default)]
pub struct LayerStack {
    layers: Vec<Layer>,
    baselines: Baselines,
    reverted: FxHashSet<u64>,
    next_layer_id: u64,
    next_edge_seq: u64,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Build a new pending layer by running `build` against a builder, then
    /// push it. Ops apply to the store as they are recorded.
    pub fn begin(
        &mut self,
        graph: &mut Graph,
        config: &CacheConfig,
        build: impl FnOnce(&mut OptimisticBuilder),
    ) -> OptimisticTxn {
        self.next_layer_id += 1;
        let id = self.next_layer_id;
        let mut layer = Layer {
            id,
            state: LayerState::Pending,
            ops: Vec::new(),
            touched: FxHashSet::default(),
        };
        {
            let mut builder = OptimisticBuilder {
                graph,
                config,
                baselines: &mut self.baselines,
                next_edge_seq: &mut self.next_edge_seq,
                layer: &mut layer,
            };
            build(&mut builder);
        }
        tracing::debug!(layer = id, ops = layer.ops.len(), "optimistic layer built");
        self.layers.push(layer);
        OptimisticTxn { id }
    }

    /// Move a pending layer to committed. Committed layers keep replaying
    /// over network writes until reverted.
    pub fn commit(&mut self, txn: OptimisticTxn) -> Result<(), OptimisticError> {
        if self.reverted.contains(&txn.id) {
            return Err(OptimisticError::AlreadyReverted { id: txn.id });
        }
        let layer = self
            .layers
            .iter_mut()
            .find(|layer| layer.id == txn.id)
            .ok_or(OptimisticError::NotPending { id: txn.id })?;
        if layer.state != LayerState::Pending {
            return Err(OptimisticError::NotPending { id: txn.id });
        }
        layer.state = LayerState::Committed;
        tracing::debug!(layer = txn.id, "optimistic layer committed");
        Ok(())
    }

    /// Remove a layer and restore the effective state to what it would be
    /// without it: baselines for its touched records, canonical rebuilds
    /// from page records, then a replay of every remaining layer.
    pub fn revert(
        &mut self,
        graph: &mut Graph,
        canonical: &CanonicalStore,
        config: &CacheConfig,
        txn: OptimisticTxn,
    ) -> Result<(), OptimisticError> {
        if !self.reverted.insert(txn.id) {
            return Err(OptimisticError::AlreadyReverted { id: txn.id });
        }
        let index = self
            .layers
            .iter()
            .position(|layer| layer.id == txn.id)
            .ok_or(OptimisticError::AlreadyReverted { id: txn.id })?;
        let layer = self.layers.remove(index);
        tracing::debug!(layer = txn.id, "optimistic layer reverted");

        for key in &layer.touched {
            if key.is_canonical() {
                continue;
            }
            let snapshot = self.baselines.get(key).cloned().flatten();
            graph.restore(key, snapshot);
        }
        for key in &layer.touched {
            if !key.is_canonical() {
                continue;
            }
            if canonical.meta(key).is_some() {
                canonical.rebuild_from_meta(graph, key);
            } else if graph.record(key).map_or(false, |r| r.get("edges").is_some()) {
                // Purely optimistic connection with no backing pages.
                graph.remove(key);
            }
        }

        self.replay_layers(graph, config, None);

        if self.layers.is_empty() {
            self.baselines.clear();
        }
        Ok(())
    }

    /// Re-apply every layer (committed in insertion order, then pending in
    /// ascending id) without touching baselines. With a hint, only
    /// connection ops targeting the hinted canonical keys run; entity ops
    /// re-run only on a full replay.
    pub fn replay(
        &mut self,
        graph: &mut Graph,
        config: &CacheConfig,
        hint: Option<&FxHashSet<RecordKey>>,
    ) {
        self.replay_layers(graph, config, hint);
    }

    fn replay_layers(
        &mut self,
        graph: &mut Graph,
        config: &CacheConfig,
        hint: Option<&FxHashSet<RecordKey>>,
    ) {
        // Layer ids increase with insertion, so two passes over the vec give
        // committed-then-pending, each in order.
        for state in [LayerState::Committed, LayerState::Pending] {
            for layer in self.layers.iter_mut().filter(|l| l.state == state) {
                let Layer { ops, touched, .. } = layer;
                for op in ops.iter() {
                    if let Some(hint) = hint {
                        match op.canonical_target() {
                            Some(canonical) if hint.contains(canonical) => {}
                            _ => continue,
                        }
                    }
                    apply_op(graph, config, op, None, touched);
                }
            }
        }
    }

}

/// Builder handed to `begin_optimistic`'s closure.
pub struct OptimisticBuilder<'a> {
    graph: &'a mut Graph,
    config: &'a CacheConfig,
    baselines: &'a mut Baselines,
    next_edge_seq: &'a mut u64,
    layer: &'a mut Layer,
}

impl<'a> OptimisticBuilder<'a> {
    /// Record and apply a record-level patch.
    pub fn patch(
        &mut self,
        target: impl Into<Target>,
        patch: impl Into<PatchSpec>,
        mode: PatchMode,
    ) {
        self.push(Op::Patch {
            target: target.into(),
            patch: patch.into(),
            mode,
        });
    }

    /// Record and apply a record delete.
    pub fn delete(&mut self, target: impl Into<Target>) {
        self.push(Op::Delete {
            target: target.into(),
        });
    }

    /// Edit a connection's canonical view.
    pub fn connection(&mut self, reference: ConnectionRef) -> ConnectionEditor<'_, 'a> {
        let canonical = reference.canonical_key();
        ConnectionEditor {
            builder: self,
            canonical,
        }
    }

    fn push(&mut self, op: Op) {
        apply_op(
            self.graph,
            self.config,
            &op,
            Some(self.baselines),
            &mut self.layer.touched,
        );
        self.layer.ops.push(op);
    }
}

/// Scoped editor for one canonical connection.
pub struct ConnectionEditor<'b, 'a> {
    builder: &'b mut OptimisticBuilder<'a>,
    canonical: RecordKey,
}

impl ConnectionEditor<'_, '_> {
    /// Append a node to the canonical edge list.
    pub fn append(self, node: Value) -> Self {
        self.insert(node, Value::Null, Position::Back)
    }

    /// Append with extra edge fields (cursor and friends).
    pub fn append_with(self, node: Value, edge: Value) -> Self {
        self.insert(node, edge, Position::Back)
    }

    /// Prepend a node to the canonical edge list.
    pub fn prepend(self, node: Value) -> Self {
        self.insert(node, Value::Null, Position::Front)
    }

    pub fn prepend_with(self, node: Value, edge: Value) -> Self {
        self.insert(node, edge, Position::Front)
    }

    /// Drop edges referencing the targeted node.
    pub fn remove(self, target: impl Into<Target>) -> Self {
        let op = Op::ConnectionRemove {
            canonical: self.canonical.clone(),
            target: target.into(),
        };
        self.builder.push(op);
        self
    }

    /// Merge fields into the canonical record; a `pageInfo` object in the
    /// patch merges into the canonical pageInfo sub-record.
    pub fn patch(self, patch: impl Into<PatchSpec>) -> Self {
        let op = Op::ConnectionPatch {
            canonical: self.canonical.clone(),
            patch: patch.into(),
        };
        self.builder.push(op);
        self
    }

    fn insert(self, node: Value, edge: Value, position: Position) -> Self {
        *self.builder.next_edge_seq += 1;
        let edge_key = RecordKey::derived(
            &self.canonical,
            &format!(
                "edges.opt{}_{}",
                self.builder.layer.id, self.builder.next_edge_seq
            ),
        );
        let op = Op::ConnectionInsert {
            canonical: self.canonical.clone(),
            edge_key,
            node,
            edge,
            position,
        };
        self.builder.push(op);
        self
    }
}

fn resolve_target(config: &CacheConfig, target: &Target) -> Option<RecordKey> {
    match target {
        Target::Key(key) => Some(key.clone()),
        Target::Object(object) => {
            let key = config.identify(object);
            if key.is_none() {
                tracing::warn!("optimistic target object is unidentifiable, op skipped");
            }
            key
        }
    }
}

fn capture_baseline(baselines: &mut Baselines, graph: &Graph, key: &RecordKey) {
    if key.is_canonical() {
        return;
    }
    baselines
        .entry(key.clone())
        .or_insert_with(|| graph.record(key).cloned());
}

fn apply_op(
    graph: &mut Graph,
    config: &CacheConfig,
    op: &Op,
    mut baselines: Option<&mut Baselines>,
    touched: &mut FxHashSet<RecordKey>,
) {
    match op {
        Op::Patch {
            target,
            patch,
            mode,
        } => {
            let Some(key) = resolve_target(config, target) else {
                return;
            };
            if let Some(baselines) = baselines {
                capture_baseline(baselines, graph, &key);
            }
            touched.insert(key.clone());
            let resolved = patch.resolve(graph.record(&key));
            let Some(object) = resolved.as_object() else {
                tracing::warn!(key = %key, "optimistic patch did not resolve to an object");
                return;
            };
            let fields = patch_from_json(object);
            match mode {
                PatchMode::Merge => {
                    graph.put(&key, fields);
                }
                PatchMode::Replace => {
                    graph.replace(&key, fields);
                }
            }
        }

        Op::Delete { target } => {
            let Some(key) = resolve_target(config, target) else {
                return;
            };
            if let Some(baselines) = baselines {
                capture_baseline(baselines, graph, &key);
            }
            touched.insert(key.clone());
            graph.remove(&key);
        }

        Op::ConnectionInsert {
            canonical,
            edge_key,
            node,
            edge,
            position,
        } => {
            let node_key = config
                .identify(node)
                .unwrap_or_else(|| RecordKey::derived(edge_key, "node"));

            if let Some(baselines) = baselines.as_mut() {
                capture_baseline(baselines, graph, &node_key);
                capture_baseline(baselines, graph, edge_key);
            }
            touched.insert(node_key.clone());
            touched.insert(edge_key.clone());
            touched.insert(canonical.clone());

            if let Some(object) = node.as_object() {
                graph.put(&node_key, patch_from_json(object));
            }
            let mut edge_patch = match edge.as_object() {
                Some(object) => patch_from_json(object),
                None => RecordPatch::new(),
            };
            edge_patch.insert("node".to_string(), FieldValue::Link(node_key.clone()));
            graph.put(edge_key, edge_patch);

            let mut edges: Vec<Option<RecordKey>> = graph
                .record(canonical)
                .and_then(|record| record.get("edges"))
                .and_then(FieldValue::as_links)
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            if !nodes_in_edges(graph, &edges).contains(&node_key) {
                match position {
                    Position::Front => edges.insert(0, Some(edge_key.clone())),
                    Position::Back => edges.push(Some(edge_key.clone())),
                }
                let mut patch = RecordPatch::new();
                patch.insert("edges".to_string(), FieldValue::Links(edges));
                graph.put(canonical, patch);
            }
        }

        Op::ConnectionRemove { canonical, target } => {
            let Some(node_key) = resolve_target(config, target) else {
                return;
            };
            touched.insert(canonical.clone());
            let Some(edges) = graph
                .record(canonical)
                .and_then(|record| record.get("edges"))
                .and_then(FieldValue::as_links)
                .map(<[_]>::to_vec)
            else {
                return;
            };
            let kept: Vec<Option<RecordKey>> = edges
                .into_iter()
                .filter(|edge| match edge {
                    Some(edge_key) => graph
                        .record(edge_key)
                        .and_then(|record| record.get("node"))
                        .and_then(FieldValue::as_link)
                        .map_or(true, |node| *node != node_key),
                    None => true,
                })
                .collect();
            let mut patch = RecordPatch::new();
            patch.insert("edges".to_string(), FieldValue::Links(kept));
            graph.put(canonical, patch);
        }

        Op::ConnectionPatch { canonical, patch } => {
            touched.insert(canonical.clone());
            let resolved = patch.resolve(graph.record(canonical));
            let Some(object) = resolved.as_object() else {
                tracing::warn!(key = %canonical, "connection patch did not resolve to an object");
                return;
            };
            let mut fields = patch_from_json(object);
            if let Some(Value::Object(info)) = object.get("pageInfo").cloned() {
                fields.remove("pageInfo");
                let info_key = RecordKey::derived(canonical, "pageInfo");
                touched.insert(info_key.clone());
                graph.put(&info_key, patch_from_json(&info));
                fields.insert("pageInfo".to_string(), FieldValue::Link(info_key));
            }
            graph.put(canonical, fields);
        }
    }
}
