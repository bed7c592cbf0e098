//! Computation results: the values property computations hand back.
//!
//! A computation never blocks on another property. It reads what it can,
//! names everything it consulted as dependees, and returns one of the tagged
//! variants below. The dispatcher is a switch over the tag; the variants are
//! data, not behavior.

use std::fmt;
use std::sync::Arc;

use crate::entity::EntityId;
use crate::kind::PropertyKey;
use crate::property::{EntityProperty, PropertyState, PropertyValue};
use crate::store::PropertyStore;

/// Steers whether a follow-up continuation is inlined on the dispatch loop
/// or scheduled as a task on the compute pool.
///
/// Load-bearing for performance, irrelevant for correctness: `Cheap`
/// continuations skip the task-queue round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputationHint {
    /// The continuation is cheap; run it inline on the updates worker.
    Cheap,
    /// The continuation does real work; schedule it on the compute pool.
    Expensive,
}

/// An analysis' property computation: given an entity, produce a result
/// synchronously.
///
/// Shared (`Arc`) because the same computation value is scheduled for many
/// entities and may be re-invoked over a phase.
pub type PropertyComputation =
    Arc<dyn Fn(&PropertyStore, EntityId) -> ComputationResult + Send + Sync>;

/// Continuation re-invoked when a dependee's value is refined.
///
/// Receives the dependee's new bound pair. Shared because the graph stores
/// it by value under the depender key and it may run more than once.
pub type OnUpdateContinuation =
    Arc<dyn Fn(&PropertyStore, &PropertyState) -> ComputationResult + Send + Sync>;

/// Collaborative update: reads the current value of the pair (or `Key` if
/// absent) and returns the refined state, or `None` when there is nothing
/// to contribute.
pub type PartialUpdate =
    Arc<dyn Fn(&EntityProperty) -> Option<PropertyState> + Send + Sync>;

/// What a property computation hands back to the store.
pub enum ComputationResult {
    /// Nothing to store.
    NoResult,

    /// A final value for one entity.
    Final {
        entity: EntityId,
        property: PropertyValue,
    },

    /// Final values for several entities at once.
    MultiFinal(Vec<(EntityId, PropertyValue)>),

    /// Collaborative update of a value several computations contribute to.
    Partial {
        entity: EntityId,
        key: PropertyKey,
        update: PartialUpdate,
    },

    /// A refinable bound pair plus the complete set of values the
    /// computation consulted, and the continuation to re-run when any of
    /// them is refined.
    Interim {
        state: PropertyState,
        dependees: Vec<EntityProperty>,
        on_update: OnUpdateContinuation,
        hint: ComputationHint,
    },

    /// A result plus additional (computation, entity) pairs discovered
    /// while producing it.
    Incremental {
        result: Box<ComputationResult>,
        followups: Vec<(PropertyComputation, EntityId)>,
        hint: ComputationHint,
    },

    /// A batch of results, dispatched one by one.
    Batch(Vec<ComputationResult>),

    /// A final value that only counts if the pair has no value yet;
    /// otherwise it is dropped.
    IdempotentFinal {
        entity: EntityId,
        property: PropertyValue,
    },

    /// An externally provided final value; the caller asserts the pair has
    /// no dependencies.
    External {
        entity: EntityId,
        property: PropertyValue,
    },

    /// Closed strongly-connected components to resolve, each given as its
    /// member pairs.
    Cycles(Vec<Vec<(EntityId, PropertyKey)>>),
}

impl ComputationResult {
    /// Tag name for diagnostics and tracing.
    pub fn variant(&self) -> &'static str {
        match self {
            ComputationResult::NoResult => "no-result",
            ComputationResult::Final { .. } => "final",
            ComputationResult::MultiFinal(_) => "multi-final",
            ComputationResult::Partial { .. } => "partial",
            ComputationResult::Interim { .. } => "interim",
            ComputationResult::Incremental { .. } => "incremental",
            ComputationResult::Batch(_) => "batch",
            ComputationResult::IdempotentFinal { .. } => "idempotent-final",
            ComputationResult::External { .. } => "external",
            ComputationResult::Cycles(_) => "cycles",
        }
    }

    /// Whether the result carries only final information.
    ///
    /// Final results are prepended to the update deque so finality
    /// propagates before refinable churn.
    pub fn is_final_kind(&self) -> bool {
        match self {
            ComputationResult::Final { .. }
            | ComputationResult::MultiFinal(_)
            | ComputationResult::External { .. }
            | ComputationResult::IdempotentFinal { .. }
            | ComputationResult::Cycles(_) => true,
            ComputationResult::Incremental { result, .. } => result.is_final_kind(),
            _ => false,
        }
    }
}

impl fmt::Debug for ComputationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputationResult::NoResult => f.write_str("NoResult"),
            ComputationResult::Final { entity, property } => f
                .debug_struct("Final")
                .field("entity", entity)
                .field("property", property)
                .finish(),
            ComputationResult::MultiFinal(values) => {
                f.debug_tuple("MultiFinal").field(values).finish()
            }
            ComputationResult::Partial { entity, key, .. } => f
                .debug_struct("Partial")
                .field("entity", entity)
                .field("key", key)
                .finish_non_exhaustive(),
            ComputationResult::Interim {
                state,
                dependees,
                hint,
                ..
            } => f
                .debug_struct("Interim")
                .field("state", state)
                .field("dependees", dependees)
                .field("hint", hint)
                .finish_non_exhaustive(),
            ComputationResult::Incremental { result, hint, .. } => f
                .debug_struct("Incremental")
                .field("result", result)
                .field("hint", hint)
                .finish_non_exhaustive(),
            ComputationResult::Batch(results) => f.debug_tuple("Batch").field(results).finish(),
            ComputationResult::IdempotentFinal { entity, property } => f
                .debug_struct("IdempotentFinal")
                .field("entity", entity)
                .field("property", property)
                .finish(),
            ComputationResult::External { entity, property } => f
                .debug_struct("External")
                .field("entity", entity)
                .field("property", property)
                .finish(),
            ComputationResult::Cycles(sccs) => f.debug_tuple("Cycles").field(sccs).finish(),
        }
    }
}
