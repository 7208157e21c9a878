//! The cache facade: one owner for the record store, canonical meta, the
//! optimistic layer stack, result caches, and observer registries.
//!
//! All public operations are synchronous. Each write operation forms one
//! batch; when it closes, the batch is published once to graph subscribers
//! and to every watcher whose dependencies it intersects, with the store
//! already in its post-write state. Batches produced by observer callbacks
//! are queued and drained iteratively, never recursively, and a nested
//! normalize or materialize of a plan that is currently executing or being
//! delivered is rejected as a re-entrancy error.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use fxhash::FxHashSet;
use plan::{Document, PlanId, Variables};
use serde_json::Value;

use crate::canonical::{CanonicalStore, UpdatePath};
use crate::config::CacheConfig;
use crate::error::{ConfigError, Error, OptimisticError};
use crate::graph::Graph;
use crate::inspect::Inspector;
use crate::materialize::results::ResultCaches;
use crate::materialize::{self, MaterializedResult, ReadRequest};
use crate::normalize::normalize_document;
use crate::optimistic::{LayerStack, OptimisticBuilder, OptimisticTxn};
use crate::record::{Record, RecordKey, RecordPatch};
use crate::watch::{
    SubscriberRegistry, SubscriptionHandle, WatchCallback, WatchHandle, WatcherRegistry,
};

/// A normalization request: a compiled plan, its variables, and the
/// response data. `prewarm` marks data that did not come from the network
/// (a cache hydration), which never destructively resets connections.
pub struct WriteRequest {
    pub plan: Arc<Document>,
    pub variables: Variables,
    pub data: Value,
    pub prewarm: bool,
}

impl WriteRequest {
    pub fn new(plan: Arc<Document>, data: Value) -> Self {
        Self {
            plan,
            variables: Variables::new(),
            data,
            prewarm: false,
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn prewarm(mut self) -> Self {
        self.prewarm = true;
        self
    }
}

/// The outcome of a normalization: the set of record keys it changed.
#[derive(Debug)]
pub struct Normalized {
    pub touched: FxHashSet<RecordKey>,
}

/// A fragment write, rooted at an entity.
pub struct WriteFragment {
    pub id: RecordKey,
    pub fragment: Arc<Document>,
    pub variables: Variables,
    pub data: Value,
}

/// A fragment read, rooted at an entity.
pub struct ReadFragment {
    pub id: RecordKey,
    pub fragment: Arc<Document>,
    pub variables: Variables,
}

/// A query watch registration.
pub struct WatchQuery {
    pub query: Arc<Document>,
    pub variables: Variables,
    pub on_data: WatchCallback,
}

/// A fragment watch registration.
pub struct WatchFragment {
    pub id: RecordKey,
    pub fragment: Arc<Document>,
    pub variables: Variables,
    pub on_data: WatchCallback,
}

pub(crate) struct Inner {
    pub graph: Graph,
    pub canonical: CanonicalStore,
    pub optimistic: LayerStack,
    pub results: ResultCaches,
    pub watchers: WatcherRegistry,
    pub subscribers: SubscriberRegistry,
}

pub struct Cache {
    config: CacheConfig,
    inner: RefCell<Inner>,
    /// Plans currently executing or being delivered to.
    active: RefCell<FxHashSet<PlanId>>,
    delivering: Cell<bool>,
    queue: RefCell<VecDeque<Vec<RecordKey>>>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let results = ResultCaches::new(config.limits().materialize_lru);
        Ok(Self {
            config,
            inner: RefCell::new(Inner {
                graph: Graph::new(),
                canonical: CanonicalStore::new(),
                optimistic: LayerStack::new(),
                results,
                watchers: WatcherRegistry::default(),
                subscribers: SubscriberRegistry::default(),
            }),
            active: RefCell::new(FxHashSet::default()),
            delivering: Cell::new(false),
            queue: RefCell::new(VecDeque::new()),
        })
    }

    // ---- writes -----------------------------------------------------------

    /// Normalize a response tree into the store. Produces exactly one batch
    /// of touched keys, published once the store is consistent.
    pub fn normalize(&self, request: WriteRequest) -> Result<Normalized, Error> {
        let plan_id = request.plan.id();
        self.enter(plan_id)?;
        let outcome = self.normalize_at(&request, RecordKey::root());
        self.leave(plan_id);
        let touched = outcome?;
        self.publish(touched.clone());
        Ok(Normalized {
            touched: touched.into_iter().collect(),
        })
    }

    fn normalize_at(
        &self,
        request: &WriteRequest,
        root: RecordKey,
    ) -> Result<Vec<RecordKey>, Error> {
        let mut inner = self.borrow_inner_mut(plan_err(request.plan.id()))?;
        let inner = &mut *inner;

        let jobs = normalize_document(
            &mut inner.graph,
            &self.config,
            &request.plan,
            &request.variables,
            &request.data,
            root,
        )?;

        let path = if request.prewarm {
            UpdatePath::Prewarm
        } else {
            UpdatePath::Network
        };
        for job in jobs {
            inner
                .canonical
                .register_page(&job.canonical, &job.page, job.role, path, job.mode);
            inner
                .canonical
                .rebuild_from_meta(&mut inner.graph, &job.canonical);
        }
        // Keep optimistic edits visible over the incoming network data.
        if !inner.optimistic.is_empty() {
            inner.optimistic.replay(&mut inner.graph, &self.config, None);
        }
        Ok(inner.graph.take_batch())
    }

    /// Normalize a fragment rooted at an entity.
    pub fn write_fragment(&self, request: WriteFragment) -> Result<Normalized, Error> {
        let plan_id = request.fragment.id();
        self.enter(plan_id)?;
        let write = WriteRequest {
            plan: request.fragment,
            variables: request.variables,
            data: request.data,
            prewarm: false,
        };
        let outcome = self.normalize_at(&write, request.id);
        self.leave(plan_id);
        let touched = outcome?;
        self.publish(touched.clone());
        Ok(Normalized {
            touched: touched.into_iter().collect(),
        })
    }

    /// Merge a patch into one record. Returns whether anything changed.
    pub fn put_record(&self, key: &RecordKey, patch: RecordPatch) -> bool {
        let (changed, batch) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let changed = inner.graph.put(key, patch);
            if changed && !inner.optimistic.is_empty() {
                inner.optimistic.replay(&mut inner.graph, &self.config, None);
            }
            (changed, inner.graph.take_batch())
        };
        self.publish(batch);
        changed
    }

    /// Delete one record. Returns whether it existed.
    pub fn remove_record(&self, key: &RecordKey) -> bool {
        let (removed, batch) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let removed = inner.graph.remove(key);
            if removed && !inner.optimistic.is_empty() {
                inner.optimistic.replay(&mut inner.graph, &self.config, None);
            }
            (removed, inner.graph.take_batch())
        };
        self.publish(batch);
        removed
    }

    // ---- reads ------------------------------------------------------------

    /// Materialize a read.
    pub fn materialize(&self, request: ReadRequest) -> Result<MaterializedResult, Error> {
        let plan_id = request.plan.id();
        self.enter(plan_id)?;
        let result = self.materialize_inner(&request);
        self.leave(plan_id);
        result
    }

    fn materialize_inner(&self, request: &ReadRequest) -> Result<MaterializedResult, Error> {
        let mut inner = self.borrow_inner_mut(plan_err(request.plan.id()))?;
        let inner = &mut *inner;
        materialize::materialize(&inner.graph, &self.config, &mut inner.results, request)
    }

    /// Materialize a fragment rooted at an entity.
    pub fn read_fragment(&self, request: ReadFragment) -> Result<MaterializedResult, Error> {
        self.materialize(
            ReadRequest::new(request.fragment)
                .variables(request.variables)
                .root(request.id),
        )
    }

    /// Drop the cached result entry for a read shape.
    pub fn invalidate(&self, request: &ReadRequest) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            let key = request.entry_key();
            inner.results.invalidate(request.plan.id(), &key);
        }
    }

    /// Identify a response object through the configured keying functions.
    pub fn identify(&self, object: &Value) -> Option<RecordKey> {
        self.config.identify(object)
    }

    /// Snapshot one record.
    pub fn record(&self, key: &RecordKey) -> Option<Record> {
        self.inner.borrow().graph.record(key).cloned()
    }

    /// Version of one record key.
    pub fn version(&self, key: &RecordKey) -> u64 {
        self.inner.borrow().graph.version(key)
    }

    // ---- optimistic -------------------------------------------------------

    /// Build an optimistic layer. The builder's ops apply immediately; the
    /// returned handle commits or reverts the layer later. The build closure
    /// must not call back into the cache.
    pub fn begin_optimistic(&self, build: impl FnOnce(&mut OptimisticBuilder)) -> OptimisticTxn {
        let (txn, batch) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let txn = inner
                .optimistic
                .begin(&mut inner.graph, &self.config, build);
            (txn, inner.graph.take_batch())
        };
        self.publish(batch);
        txn
    }

    pub fn commit_optimistic(&self, txn: OptimisticTxn) -> Result<(), OptimisticError> {
        self.inner.borrow_mut().optimistic.commit(txn)
    }

    pub fn revert_optimistic(&self, txn: OptimisticTxn) -> Result<(), OptimisticError> {
        let (outcome, batch) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let outcome =
                inner
                    .optimistic
                    .revert(&mut inner.graph, &inner.canonical, &self.config, txn);
            (outcome, inner.graph.take_batch())
        };
        self.publish(batch);
        outcome
    }

    // ---- observers --------------------------------------------------------

    /// Subscribe to every batch of changed record keys.
    pub fn subscribe(&self, subscriber: impl FnMut(&[RecordKey]) + 'static) -> SubscriptionHandle {
        self.inner
            .borrow_mut()
            .subscribers
            .register(Box::new(subscriber))
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.borrow_mut().subscribers.remove(handle);
    }

    /// Watch a query: an initial delivery now, then one delivery per write
    /// batch that intersects the watcher's dependencies.
    pub fn watch_query(&self, watch: WatchQuery) -> Result<WatchHandle, Error> {
        let request = ReadRequest::new(watch.query)
            .variables(watch.variables)
            .update_cache(true);
        self.register_watch(request, watch.on_data)
    }

    /// Watch a fragment rooted at an entity.
    pub fn watch_fragment(&self, watch: WatchFragment) -> Result<WatchHandle, Error> {
        let request = ReadRequest::new(watch.fragment)
            .variables(watch.variables)
            .root(watch.id)
            .update_cache(true);
        self.register_watch(request, watch.on_data)
    }

    fn register_watch(
        &self,
        request: ReadRequest,
        on_data: WatchCallback,
    ) -> Result<WatchHandle, Error> {
        let plan_id = request.plan.id();
        self.enter(plan_id)?;
        let registered = (|| {
            let result = self.materialize_inner(&request)?;
            let handle = self.inner.borrow_mut().watchers.register(
                request,
                result.dependencies.clone(),
                on_data,
            );
            Ok((handle, result))
        })();
        match registered {
            Ok((handle, result)) => {
                self.deliver(handle, &result);
                self.leave(plan_id);
                Ok(handle)
            }
            Err(error) => {
                self.leave(plan_id);
                Err(error)
            }
        }
    }

    /// Re-key a watcher to new variables and deliver the new result.
    pub fn update_watch(&self, handle: WatchHandle, variables: Variables) -> Result<(), Error> {
        let drained = self
            .inner
            .borrow_mut()
            .watchers
            .retarget(handle, variables);
        if let Some((plan, entry)) = drained {
            self.inner.borrow_mut().results.invalidate(plan, &entry);
        }
        let Some(request) = self.inner.borrow().watchers.request(handle) else {
            return Ok(());
        };
        let plan_id = request.plan.id();
        self.enter(plan_id)?;
        let result = self.materialize_inner(&request);
        if let Ok(result) = &result {
            self.inner
                .borrow_mut()
                .watchers
                .set_deps(handle, result.dependencies.clone());
            self.deliver(handle, result);
        }
        self.leave(plan_id);
        result.map(|_| ())
    }

    /// Unsubscribe a watcher; the last watcher of a cache entry drops it.
    pub fn unwatch(&self, handle: WatchHandle) {
        let drained = self.inner.borrow_mut().watchers.remove(handle);
        if let Some((plan, entry)) = drained {
            self.inner.borrow_mut().results.invalidate(plan, &entry);
        }
    }

    /// Read-only introspection surface.
    pub fn inspect(&self) -> Inspector<'_> {
        Inspector::new(self)
    }

    // ---- internals --------------------------------------------------------

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.borrow())
    }

    fn borrow_inner_mut(
        &self,
        error: Error,
    ) -> Result<std::cell::RefMut<'_, Inner>, Error> {
        self.inner.try_borrow_mut().map_err(|_| error)
    }

    fn enter(&self, plan: PlanId) -> Result<(), Error> {
        if !self.active.borrow_mut().insert(plan) {
            return Err(Error::Reentrancy { plan_id: plan });
        }
        Ok(())
    }

    fn leave(&self, plan: PlanId) {
        self.active.borrow_mut().remove(&plan);
    }

    /// Publish one batch. Nested publishes from observer callbacks queue
    /// behind the current drain.
    fn publish(&self, batch: Vec<RecordKey>) {
        if batch.is_empty() {
            return;
        }
        self.queue.borrow_mut().push_back(batch);
        if self.delivering.get() {
            return;
        }
        self.delivering.set(true);
        while let Some(batch) = {
            let mut queue = self.queue.borrow_mut();
            queue.pop_front()
        } {
            self.deliver_batch(&batch);
        }
        self.delivering.set(false);
    }

    fn deliver_batch(&self, batch: &[RecordKey]) {
        // Graph subscribers see every batch.
        let subscriber_handles = self.inner.borrow().subscribers.ids();
        for handle in subscriber_handles {
            let subscriber = self.inner.borrow_mut().subscribers.take(handle);
            if let Some(mut subscriber) = subscriber {
                subscriber(batch);
                self.inner
                    .borrow_mut()
                    .subscribers
                    .restore(handle, subscriber);
            }
        }

        // Watchers see a fresh materialization when their deps intersect.
        let affected = self.inner.borrow().watchers.affected(batch);
        for handle in affected {
            let Some(request) = self.inner.borrow().watchers.request(handle) else {
                continue;
            };
            let plan_id = request.plan.id();
            if self.enter(plan_id).is_err() {
                tracing::warn!(plan = plan_id.0, "skipping delivery into an active plan");
                continue;
            }
            match self.materialize_inner(&request) {
                Ok(result) => {
                    self.inner
                        .borrow_mut()
                        .watchers
                        .set_deps(handle, result.dependencies.clone());
                    self.deliver(handle, &result);
                }
                Err(error) => {
                    tracing::warn!(plan = plan_id.0, %error, "watcher delivery failed");
                }
            }
            self.leave(plan_id);
        }
    }

    fn deliver(&self, handle: WatchHandle, result: &MaterializedResult) {
        let callback = self.inner.borrow_mut().watchers.take_callback(handle);
        if let Some(mut callback) = callback {
            callback(result);
            self.inner
                .borrow_mut()
                .watchers
                .restore_callback(handle, callback);
        }
    }
}

fn plan_err(plan_id: PlanId) -> Error {
    Error::Reentrancy { plan_id }
}
