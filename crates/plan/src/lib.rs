//! Pre-compiled cache plans for query, mutation, and fragment documents.
//! Plans are produced by an external compiler from document text; this crate
//! defines the plan data model the cache core consumes, plus a builder API
//! used by tests and tooling in lieu of that compiler.
//!
//! Plans are plain data: a tree of selected fields, where each field knows
//! its response key, its schema field name, the declared order and sources
//! of its arguments, and (for paginated fields) its connection identity.

mod document;
pub use document::{Document, OperationKind, PlanId};

mod field;
pub use field::{ArgPlan, ArgSource, ConnectionMode, FieldPlan, SelectionSet};

mod builder;
pub use builder::{field, FieldBuilder};

/// Variables accompany a document for a single request.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Convenience conversion from a `serde_json::json!` object literal.
pub fn variables(value: serde_json::Value) -> Variables {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => Variables::new(),
        other => panic!("variables must be a JSON object, got {other}"),
    }
}
