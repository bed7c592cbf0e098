//! Rich diagnostic error types for the quiesce engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so embedders know exactly what went wrong
//! and how to fix it. Contract violations are explicit data, never panics threaded
//! through result types.

use miette::Diagnostic;
use thiserror::Error;

use crate::entity::EntityId;
use crate::kind::PropertyKey;

/// Top-level error type for the quiesce engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the embedder.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum StoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Contract(#[from] ContractViolation),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerFailure),
}

/// Result type used throughout the engine.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Contract violations
// ---------------------------------------------------------------------------

/// A client or computation broke one of the store's contracts.
///
/// These are fatal: the first violation is recorded, the workers stop, and the
/// phase-wait call re-raises it.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ContractViolation {
    #[error("illegal refinement for ({entity}, {key}): {detail}")]
    #[diagnostic(
        code(quiesce::contract::illegal_refinement),
        help(
            "Property updates must be monotone: the new lower bound must be equal \
             or better than the old one, and the new upper bound equal or worse. \
             Check the lattice order of the producing computation."
        )
    )]
    IllegalRefinement {
        entity: EntityId,
        key: PropertyKey,
        detail: String,
    },

    #[error("final value for ({entity}, {key}) must not change")]
    #[diagnostic(
        code(quiesce::contract::final_mutation),
        help(
            "Once a property value is final it never changes. A second, different \
             result for the same pair means two computations race on one property \
             or a computation is not deterministic."
        )
    )]
    FinalValueMutation { entity: EntityId, key: PropertyKey },

    #[error("idempotent result for ({entity}, {key}) disagrees with the stored value")]
    #[diagnostic(
        code(quiesce::contract::idempotent_mismatch),
        help(
            "An idempotent result is only dropped when it matches the value already \
             stored. A mismatch means the producing computation is not deterministic."
        )
    )]
    IdempotentMismatch { entity: EntityId, key: PropertyKey },

    #[error("cannot set a value for kind {key}: a lazy computation is registered")]
    #[diagnostic(
        code(quiesce::contract::set_with_lazy),
        help(
            "`set` asserts that no analysis computes the kind. Either remove the \
             lazy registration or let the lazy computation produce the value."
        )
    )]
    SetWithLazyComputation { key: PropertyKey },

    #[error("cannot set ({entity}, {key}): a value is already present")]
    #[diagnostic(
        code(quiesce::contract::set_over_existing),
        help(
            "`set` only installs values for pairs that have none. Query the store \
             first, or funnel the value through a regular computation result."
        )
    )]
    SetOverExisting { entity: EntityId, key: PropertyKey },

    #[error("lazy computation for kind {key} registered while a phase is running")]
    #[diagnostic(
        code(quiesce::contract::late_registration),
        help("Register all lazy computations before the phase is set up.")
    )]
    LateLazyRegistration { key: PropertyKey },

    #[error("a lazy computation for kind {key} is already registered")]
    #[diagnostic(
        code(quiesce::contract::duplicate_registration),
        help("At most one computation may be registered per property kind.")
    )]
    DuplicateLazyRegistration { key: PropertyKey },

    #[error("property kind {key} is not registered")]
    #[diagnostic(
        code(quiesce::contract::unknown_kind),
        help(
            "All property kinds must be registered with the KindRegistry before \
             the store is constructed. The universe of kinds is fixed from then on."
        )
    )]
    UnknownKind { key: PropertyKey },

    #[error("result targets kind {actual} but was announced for kind {expected}")]
    #[diagnostic(
        code(quiesce::contract::kind_mismatch),
        help(
            "The property carried by a result must belong to the kind the result \
             names. Check the `key()` implementation of the property type."
        )
    )]
    KindMismatch {
        expected: PropertyKey,
        actual: PropertyKey,
    },
}

// ---------------------------------------------------------------------------
// Entity errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum EntityError {
    #[error("entity allocator exhausted: cannot allocate more than u64::MAX entities")]
    #[diagnostic(
        code(quiesce::entity::exhausted),
        help(
            "The entity ID space is exhausted. This is extremely unlikely in \
             practice (requires 2^64 allocations). If you see this error, check \
             for an allocation loop in the embedder."
        )
    )]
    AllocatorExhausted,
}

// ---------------------------------------------------------------------------
// Phase errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum PhaseError {
    #[error("phase setup requested while {open_jobs} job(s) are still in flight")]
    #[diagnostic(
        code(quiesce::phase::overlap),
        help(
            "A new phase may not overlap with running work. Call \
             `wait_on_phase_completion` and let it return before setting up the \
             next phase."
        )
    )]
    Overlap { open_jobs: usize },

    #[error("the store failed in an earlier phase and cannot be reused")]
    #[diagnostic(
        code(quiesce::phase::poisoned),
        help(
            "A fatal error stopped the workers and cleared the store state. \
             Construct a fresh store; results from the failed phase are gone."
        )
    )]
    Poisoned,

    #[error("the store has been shut down")]
    #[diagnostic(
        code(quiesce::phase::shut_down),
        help("No work can be scheduled after `shutdown`. Construct a fresh store.")
    )]
    ShutDown,
}

// ---------------------------------------------------------------------------
// Worker failures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum WorkerFailure {
    #[error("a property computation panicked: {detail}")]
    #[diagnostic(
        code(quiesce::worker::computation_panicked),
        help(
            "The first panic raised by any computation of the phase is recorded \
             and re-raised here; later panics are discarded. A computation that \
             cannot produce a value must return `NoResult` instead of panicking."
        )
    )]
    ComputationPanicked { detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ent(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    #[test]
    fn contract_violation_formats_pair() {
        let err = ContractViolation::FinalValueMutation {
            entity: ent(7),
            key: PropertyKey::new(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("ent:7"));
        assert!(msg.contains("key:2"));
    }

    #[test]
    fn top_level_wraps_transparently() {
        let err: StoreError = ContractViolation::UnknownKind {
            key: PropertyKey::new(9),
        }
        .into();
        assert!(err.to_string().contains("key:9"));
    }

    #[test]
    fn errors_clone_for_re_raising() {
        let err: StoreError = WorkerFailure::ComputationPanicked {
            detail: "boom".into(),
        }
        .into();
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
