use plan::PlanId;

/// Fatal operation errors. Data-shape anomalies during materialization are
/// never errors; they degrade the result's `ok`/`source` instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("plan field {response_key:?} is missing its selection during traversal")]
    Plan { response_key: String },

    #[error("re-entrant operation on plan {plan_id:?} from within an observer")]
    Reentrancy { plan_id: PlanId },
}

/// Setup-time configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("keying function registered for an empty type name")]
    EmptyTypeName,

    #[error("keying function registered for interface {typename:?}; interfaces are abstract")]
    KeyedInterface { typename: String },

    #[error("interface map contains a cycle through {interface:?}")]
    CyclicInterface { interface: String },

    #[error("materialize LRU capacity must be non-zero")]
    ZeroLruCapacity,
}

/// Errors finalizing an optimistic layer.
#[derive(thiserror::Error, Debug)]
pub enum OptimisticError {
    #[error("optimistic layer {id} is not pending")]
    NotPending { id: u64 },

    #[error("optimistic layer {id} was already reverted")]
    AlreadyReverted { id: u64 },
}
