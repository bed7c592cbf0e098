//! Lattice primitives: property values, bound pairs, and query answers.
//!
//! A property value belongs to exactly one [`PropertyKey`] and lives in that
//! kind's refinement lattice. The store tracks a *lower bound* and an *upper
//! bound* per (entity, kind) pair; a value is final exactly when the bounds
//! coincide. Two properties are orderable only within one kind, so the engine
//! itself never compares across kinds; it only needs type-erased equality,
//! which [`Property::dyn_eq`] provides.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::entity::EntityId;
use crate::kind::PropertyKey;

/// A property value in some kind's refinement lattice.
///
/// Implementors are the embedder's domain types (purity, escape state,
/// immutability level). The engine requires only the owning kind, a way to
/// downcast, and type-erased equality. The refinement *order* is supplied
/// per kind through the registry hooks, not through this trait, because the
/// engine never needs to compare two values itself; it only checks equality
/// to detect finality and relevant updates.
pub trait Property: fmt::Debug + Send + Sync + 'static {
    /// The kind this value belongs to.
    fn key(&self) -> PropertyKey;

    /// Upcast for downcasting in [`dyn_eq`](Property::dyn_eq) implementations
    /// and in client continuations.
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Type-erased equality. Values of different concrete types are unequal.
    fn dyn_eq(&self, other: &dyn Property) -> bool;
}

impl dyn Property {
    /// Downcast a type-erased property to a concrete type.
    pub fn downcast_ref<T: Property>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Shared handle to a type-erased property value.
///
/// Cheap to clone; the same allocation is shared between the table, bound
/// snapshots, and continuation arguments.
pub type PropertyValue = Arc<dyn Property>;

// ---------------------------------------------------------------------------
// Bound pairs
// ---------------------------------------------------------------------------

/// The current bound pair for one (entity, kind) pair.
///
/// `lb` is the lower bound, `ub` the upper bound of the kind's lattice.
/// The value is final exactly when both coincide; a non-final value is
/// *refinable* and may still move monotonically (`lb` only upward, `ub`
/// only downward).
#[derive(Clone)]
pub struct PropertyState {
    /// The entity the bounds belong to.
    pub entity: EntityId,
    /// The property kind.
    pub key: PropertyKey,
    /// Lower bound.
    pub lb: PropertyValue,
    /// Upper bound.
    pub ub: PropertyValue,
}

impl PropertyState {
    /// Create a refinable bound pair.
    pub fn new(entity: EntityId, key: PropertyKey, lb: PropertyValue, ub: PropertyValue) -> Self {
        Self {
            entity,
            key,
            lb,
            ub,
        }
    }

    /// Create a final state where both bounds are the given value.
    pub fn final_state(entity: EntityId, key: PropertyKey, value: PropertyValue) -> Self {
        Self {
            entity,
            key,
            lb: Arc::clone(&value),
            ub: value,
        }
    }

    /// A value is final exactly when the bounds coincide.
    pub fn is_final(&self) -> bool {
        self.lb.dyn_eq(self.ub.as_ref())
    }

    /// A value is refinable iff it is not final.
    pub fn is_refinable(&self) -> bool {
        !self.is_final()
    }

    /// Whether both bounds equal the other state's bounds.
    ///
    /// This is the "has anything changed" test the dispatcher uses to decide
    /// whether an update is relevant to dependers and whether a previously
    /// observed dependee is stale.
    pub fn same_bounds(&self, other: &PropertyState) -> bool {
        self.lb.dyn_eq(other.lb.as_ref()) && self.ub.dyn_eq(other.ub.as_ref())
    }

    /// The final value, if the bounds coincide.
    pub fn final_value(&self) -> Option<&PropertyValue> {
        if self.is_final() {
            Some(&self.ub)
        } else {
            None
        }
    }
}

impl fmt::Debug for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_final() {
            f.debug_struct("PropertyState")
                .field("entity", &self.entity)
                .field("key", &self.key)
                .field("final", &self.ub)
                .finish()
        } else {
            f.debug_struct("PropertyState")
                .field("entity", &self.entity)
                .field("key", &self.key)
                .field("lb", &self.lb)
                .field("ub", &self.ub)
                .finish()
        }
    }
}

// ---------------------------------------------------------------------------
// Query answers
// ---------------------------------------------------------------------------

/// The store's answer to a property query, and the unit a computation names
/// as a dependee.
///
/// Either the pair is known but has no value yet (`Key`), or it has a current
/// bound pair (`State`), final when the bounds coincide.
#[derive(Clone, Debug)]
pub enum EntityProperty {
    /// Known entity, no value computed yet.
    Key {
        /// The entity the query named.
        entity: EntityId,
        /// The property kind the query named.
        key: PropertyKey,
    },
    /// Current bounds for the pair.
    State(PropertyState),
}

impl EntityProperty {
    /// The queried entity.
    pub fn entity(&self) -> EntityId {
        match self {
            EntityProperty::Key { entity, .. } => *entity,
            EntityProperty::State(s) => s.entity,
        }
    }

    /// The queried property kind.
    pub fn key(&self) -> PropertyKey {
        match self {
            EntityProperty::Key { key, .. } => *key,
            EntityProperty::State(s) => s.key,
        }
    }

    /// The (entity, kind) pair, used as the graph node identity.
    pub fn pair(&self) -> (EntityId, PropertyKey) {
        (self.entity(), self.key())
    }

    /// Whether a value (final or refinable) is present.
    pub fn has_value(&self) -> bool {
        matches!(self, EntityProperty::State(_))
    }

    /// Whether the value is present and final.
    pub fn is_final(&self) -> bool {
        match self {
            EntityProperty::Key { .. } => false,
            EntityProperty::State(s) => s.is_final(),
        }
    }

    /// Whether the value is present and still refinable.
    pub fn is_refinable(&self) -> bool {
        match self {
            EntityProperty::Key { .. } => false,
            EntityProperty::State(s) => s.is_refinable(),
        }
    }

    /// The bound pair, if any.
    pub fn as_state(&self) -> Option<&PropertyState> {
        match self {
            EntityProperty::Key { .. } => None,
            EntityProperty::State(s) => Some(s),
        }
    }

    /// The upper bound, if a value is present.
    pub fn ub(&self) -> Option<&PropertyValue> {
        self.as_state().map(|s| &s.ub)
    }

    /// The lower bound, if a value is present.
    pub fn lb(&self) -> Option<&PropertyValue> {
        self.as_state().map(|s| &s.lb)
    }

    /// The final value, if the bounds coincide.
    pub fn final_value(&self) -> Option<&PropertyValue> {
        self.as_state().and_then(|s| s.final_value())
    }
}
