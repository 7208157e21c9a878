use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::field::SelectionSet;
use crate::FieldBuilder;

/// Process-unique identity of a compiled plan.
///
/// The cache keys per-plan state (result caches, re-entrancy guards) by this
/// id rather than by pointer, so plans can be cloned and shared freely.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlanId(pub u64);

static NEXT_PLAN_ID: AtomicU64 = AtomicU64::new(1);

/// The operation kind of a compiled document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    /// Mutations write entity bodies but never attach root-level links:
    /// they update records without rewriting the root shape of the graph.
    Mutation,
    /// Fragments are selections rooted at an entity rather than the root.
    Fragment,
}

/// A compiled document plan: the operation kind plus the root selection tree.
#[derive(Debug)]
pub struct Document {
    id: PlanId,
    operation: OperationKind,
    root: SelectionSet,
}

impl Document {
    pub fn new(operation: OperationKind, root: SelectionSet) -> Arc<Self> {
        Arc::new(Self {
            id: PlanId(NEXT_PLAN_ID.fetch_add(1, Ordering::Relaxed)),
            operation,
            root,
        })
    }

    /// Build a query plan from field builders.
    pub fn query<I>(fields: I) -> Arc<Self>
    where
        I: IntoIterator<Item = FieldBuilder>,
    {
        Self::new(OperationKind::Query, SelectionSet::build(fields))
    }

    /// Build a mutation plan from field builders.
    pub fn mutation<I>(fields: I) -> Arc<Self>
    where
        I: IntoIterator<Item = FieldBuilder>,
    {
        Self::new(OperationKind::Mutation, SelectionSet::build(fields))
    }

    /// Build a fragment plan from field builders.
    /// The selection applies to the entity the fragment is rooted at.
    pub fn fragment<I>(fields: I) -> Arc<Self>
    where
        I: IntoIterator<Item = FieldBuilder>,
    {
        Self::new(OperationKind::Fragment, SelectionSet::build(fields))
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn root(&self) -> &SelectionSet {
        &self.root
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::field;

    #[test]
    fn plan_ids_are_unique() {
        let a = Document::query([field("a")]);
        let b = Document::query([field("a")]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn operation_kinds() {
        assert_eq!(
            Document::mutation([field("m")]).operation(),
            OperationKind::Mutation
        );
        assert_eq!(
            Document::fragment([field("f")]).operation(),
            OperationKind::Fragment
        );
    }
}
