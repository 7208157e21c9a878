//! Lagoon is an in-process, reactive cache for hierarchical, graph-shaped
//! query documents. Responses are normalized into flat, keyed, versioned
//! records; reads materialize tree-shaped results back out of the store with
//! per-subtree fingerprints and structural sharing, so observers can diff by
//! identity. Paginated connections fold into a deterministic canonical view
//! per `(parent, field, filters)` identity, and optimistic layers stage
//! revertible edits over the base store.
//!
//! The crate is a library boundary only: no transport, no persistence, no
//! document compiler. Plans arrive pre-compiled (see the `plan` crate) and
//! everything here is synchronous with respect to the store.

// Records, field values, and record keys.
pub mod record;
pub use record::{patch_from_json, FieldValue, Record, RecordKey, RecordPatch};

// The keyed, versioned record store.
pub mod graph;
pub use graph::Graph;

// Stable string identities for fields, pages, and canonical connections.
pub mod keys;
pub use keys::{canonical_key, field_key, page_key, stable_json};

// Canonical connection assembly.
pub mod canonical;
pub use canonical::{ConnectionMeta, PageHint};

// Optimistic layering.
pub mod optimistic;
pub use optimistic::{
    ConnectionRef, OptimisticBuilder, OptimisticTxn, PatchMode, PatchSpec, Target,
};

// Response normalization.
pub mod normalize;

// Materialization, fingerprints, structural sharing, result caches.
pub mod materialize;
pub use materialize::{
    fingerprint::FingerprintNode, MaterializedResult, OkFlags, ReadRequest, Source,
};

// Materialized result trees.
pub mod tree;
pub use tree::TreeNode;

// Configuration.
pub mod config;
pub use config::{CacheConfig, Limits};

// Errors.
pub mod error;
pub use error::{ConfigError, Error, OptimisticError};

// Watchers and graph subscriptions.
pub mod watch;
pub use watch::{SubscriptionHandle, WatchCallback, WatchHandle};

// Introspection.
pub mod inspect;
pub use inspect::{ConfigSummary, Inspector};

// The cache facade.
mod cache;
pub use cache::{
    Cache, Normalized, ReadFragment, WatchFragment, WatchQuery, WriteFragment, WriteRequest,
};
