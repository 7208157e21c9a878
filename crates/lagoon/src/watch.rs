//! Query and fragment watchers.
//!
//! A watcher pins a materialization shape (plan, variables, root, mode) and
//! an `on_data` callback. The cache re-materializes a watcher after every
//! write batch that intersects its last dependency set and delivers the
//! recycled result, including results whose source is `None`. Watchers hold
//! a refcount on their result-cache entry; the entry is invalidated when the
//! last watcher for it unsubscribes.

use fxhash::FxHashMap;
use plan::PlanId;

use crate::materialize::results::EntryKey;
use crate::materialize::{MaterializedResult, ReadRequest};
use crate::record::RecordKey;

use std::sync::Arc;

pub type WatchCallback = Box<dyn FnMut(&MaterializedResult)>;

/// Handle to a registered watcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WatchHandle {
    pub(crate) id: u64,
}

/// Handle to a graph change subscriber.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
}

pub(crate) struct Watcher {
    id: u64,
    request: ReadRequest,
    // Taken out of the slot while the callback runs, so a callback that
    // writes back into the cache cannot alias its own registration.
    callback: Option<WatchCallback>,
    deps: Arc<fxhash::FxHashSet<RecordKey>>,
}

#[derive(Default)]
pub(crate) struct WatcherRegistry {
    watchers: Vec<Watcher>,
    refcounts: FxHashMap<(PlanId, EntryKey), usize>,
    next_id: u64,
}

impl WatcherRegistry {
    pub fn register(
        &mut self,
        request: ReadRequest,
        deps: Arc<fxhash::FxHashSet<RecordKey>>,
        callback: WatchCallback,
    ) -> WatchHandle {
        self.next_id += 1;
        let id = self.next_id;
        *self
            .refcounts
            .entry((request.plan.id(), request.entry_key()))
            .or_insert(0) += 1;
        self.watchers.push(Watcher {
            id,
            request,
            callback: Some(callback),
            deps,
        });
        WatchHandle { id }
    }

    /// Remove a watcher. Returns the result-cache entry to invalidate when
    /// this was the last watcher pinning it.
    pub fn remove(&mut self, handle: WatchHandle) -> Option<(PlanId, EntryKey)> {
        let index = self.watchers.iter().position(|w| w.id == handle.id)?;
        let watcher = self.watchers.remove(index);
        let key = (watcher.request.plan.id(), watcher.request.entry_key());
        self.release(key)
    }

    /// Re-key a watcher to new variables. Returns the old entry to
    /// invalidate when its refcount drained.
    pub fn retarget(
        &mut self,
        handle: WatchHandle,
        variables: plan::Variables,
    ) -> Option<(PlanId, EntryKey)> {
        let watcher = self.watchers.iter_mut().find(|w| w.id == handle.id)?;
        let old_key = (watcher.request.plan.id(), watcher.request.entry_key());
        watcher.request.variables = variables;
        let new_key = (watcher.request.plan.id(), watcher.request.entry_key());
        *self.refcounts.entry(new_key).or_insert(0) += 1;
        self.release(old_key)
    }

    fn release(&mut self, key: (PlanId, EntryKey)) -> Option<(PlanId, EntryKey)> {
        let count = self.refcounts.get_mut(&key)?;
        *count -= 1;
        if *count == 0 {
            self.refcounts.remove(&key);
            Some(key)
        } else {
            None
        }
    }

    /// Watchers whose last dependency set intersects the changed keys.
    pub fn affected(&self, changed: &[RecordKey]) -> Vec<WatchHandle> {
        self.watchers
            .iter()
            .filter(|watcher| changed.iter().any(|key| watcher.deps.contains(key)))
            .map(|watcher| WatchHandle { id: watcher.id })
            .collect()
    }

    pub fn request(&self, handle: WatchHandle) -> Option<ReadRequest> {
        self.watchers
            .iter()
            .find(|w| w.id == handle.id)
            .map(|w| w.request.clone())
    }

    pub fn set_deps(
        &mut self,
        handle: WatchHandle,
        deps: Arc<fxhash::FxHashSet<RecordKey>>,
    ) {
        if let Some(watcher) = self.watchers.iter_mut().find(|w| w.id == handle.id) {
            watcher.deps = deps;
        }
    }

    pub fn take_callback(&mut self, handle: WatchHandle) -> Option<WatchCallback> {
        self.watchers
            .iter_mut()
            .find(|w| w.id == handle.id)
            .and_then(|w| w.callback.take())
    }

    pub fn restore_callback(&mut self, handle: WatchHandle, callback: WatchCallback) {
        if let Some(watcher) = self.watchers.iter_mut().find(|w| w.id == handle.id) {
            watcher.callback = Some(callback);
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }
}

type Subscriber = Box<dyn FnMut(&[RecordKey])>;

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    subscribers: Vec<(u64, Option<Subscriber>)>,
    next_id: u64,
}

impl SubscriberRegistry {
    pub fn register(&mut self, subscriber: Subscriber) -> SubscriptionHandle {
        self.next_id += 1;
        self.subscribers.push((self.next_id, Some(subscriber)));
        SubscriptionHandle { id: self.next_id }
    }

    pub fn remove(&mut self, handle: SubscriptionHandle) {
        self.subscribers.retain(|(id, _)| *id != handle.id);
    }

    pub fn ids(&self) -> Vec<SubscriptionHandle> {
        self.subscribers
            .iter()
            .map(|(id, _)| SubscriptionHandle { id: *id })
            .collect()
    }

    pub fn take(&mut self, handle: SubscriptionHandle) -> Option<Subscriber> {
        self.subscribers
            .iter_mut()
            .find(|(id, _)| *id == handle.id)
            .and_then(|(_, slot)| slot.take())
    }

    pub fn restore(&mut self, handle: SubscriptionHandle, subscriber: Subscriber) {
        if let Some((_, slot)) = self
            .subscribers
            .iter_mut()
            .find(|(id, _)| *id == handle.id)
        {
            *slot = Some(subscriber);
        }
    }
}
