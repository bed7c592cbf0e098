//! Property kinds and the kind registry.
//!
//! A property kind is a static descriptor of a property's domain and lattice:
//! a dense small-integer id (so every kind-indexed structure in the engine is
//! a contiguous array), a fallback hook for pairs no analysis will answer, a
//! cycle-resolution hook for members of closed strongly-connected components,
//! and optional fast-track and refinement-check hooks.
//!
//! The registry is built once, before the store is constructed, and frozen
//! from then on. It is explicit state handed to [`StoreConfig`], never a
//! process-wide global.
//!
//! [`StoreConfig`]: crate::store::StoreConfig

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::property::{PropertyState, PropertyValue};
use crate::store::PropertyStore;

/// Dense small-integer id of a property kind.
///
/// Keys index contiguous per-kind arrays (table shards, dependency maps,
/// already-triggered sets), so they must stay small and dense. The registry
/// hands them out in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PropertyKey(u32);

impl PropertyKey {
    /// Create a key from a raw index.
    pub fn new(raw: u32) -> Self {
        PropertyKey(raw)
    }

    /// The raw index.
    pub fn get(self) -> u32 {
        self.0
    }

    /// The key as a `usize` for array indexing.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Kind hooks
// ---------------------------------------------------------------------------

/// Produces the default final value for a pair no analysis computes.
pub type FallbackFn = Arc<dyn Fn(&PropertyStore, EntityId) -> PropertyValue + Send + Sync>;

/// Finalizes a member of a closed strongly-connected component.
pub type CycleResolutionFn =
    Arc<dyn Fn(&PropertyStore, &PropertyState) -> PropertyValue + Send + Sync>;

/// Eager approximation tried on a query miss before triggering the lazy
/// computation. `None` means no cheap answer exists for the entity.
pub type FastTrackFn =
    Arc<dyn Fn(&PropertyStore, EntityId) -> Option<PropertyValue> + Send + Sync>;

/// Validation hook: is `new` a legal monotone refinement of `old`?
///
/// Receives the old and new bound pairs; returns whether the new lower
/// bound is equal or better and the new upper bound equal or tighter.
/// Consulted only when validation is on; the engine never orders values
/// itself.
pub type RefinementCheckFn = Arc<dyn Fn(&PropertyState, &PropertyState) -> bool + Send + Sync>;

/// Static descriptor of one property kind.
#[derive(Clone)]
pub struct PropertyKindInfo {
    /// Human-readable name for diagnostics and tracing.
    pub name: &'static str,
    /// Default final value for pairs no analysis will answer.
    pub fallback: FallbackFn,
    /// Finalization of a closed-SCC member.
    pub resolve_cycle: CycleResolutionFn,
    /// Optional eager approximation for query misses.
    pub fast_track: Option<FastTrackFn>,
    /// Optional monotonicity check, consulted when validation is on.
    pub check_refinement: Option<RefinementCheckFn>,
}

impl PropertyKindInfo {
    /// Create a kind descriptor with the two mandatory hooks.
    pub fn new(
        name: &'static str,
        fallback: FallbackFn,
        resolve_cycle: CycleResolutionFn,
    ) -> Self {
        Self {
            name,
            fallback,
            resolve_cycle,
            fast_track: None,
            check_refinement: None,
        }
    }

    /// Attach a fast-track approximator.
    pub fn with_fast_track(mut self, fast_track: FastTrackFn) -> Self {
        self.fast_track = Some(fast_track);
        self
    }

    /// Attach a refinement check for debug validation.
    pub fn with_refinement_check(mut self, check: RefinementCheckFn) -> Self {
        self.check_refinement = Some(check);
        self
    }
}

impl fmt::Debug for PropertyKindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyKindInfo")
            .field("name", &self.name)
            .field("fast_track", &self.fast_track.is_some())
            .field("check_refinement", &self.check_refinement.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Collects kind descriptors before the store exists.
///
/// Registration order determines the dense keys.
#[derive(Debug, Default)]
pub struct KindRegistryBuilder {
    kinds: Vec<PropertyKindInfo>,
}

impl KindRegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind and return its dense key.
    pub fn register(&mut self, info: PropertyKindInfo) -> PropertyKey {
        let key = PropertyKey::new(self.kinds.len() as u32);
        self.kinds.push(info);
        key
    }

    /// Freeze the universe of kinds.
    pub fn build(self) -> KindRegistry {
        KindRegistry { kinds: self.kinds }
    }
}

/// The frozen universe of property kinds.
///
/// Lookup by key is array indexing; the set of kinds never changes once the
/// store is constructed.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: Vec<PropertyKindInfo>,
}

impl KindRegistry {
    /// Look up a kind descriptor.
    pub fn get(&self, key: PropertyKey) -> Option<&PropertyKindInfo> {
        self.kinds.get(key.index())
    }

    /// Whether the key belongs to a registered kind.
    pub fn contains(&self, key: PropertyKey) -> bool {
        key.index() < self.kinds.len()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Iterate over `(key, info)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (PropertyKey, &PropertyKindInfo)> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, info)| (PropertyKey::new(i as u32), info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::testing::{ladder, Level};

    fn dummy_kind(name: &'static str) -> PropertyKindInfo {
        PropertyKindInfo::new(
            name,
            Arc::new(|_store, _e| ladder(PropertyKey::new(0), Level::Bottom)),
            Arc::new(|_store, state| Arc::clone(&state.ub)),
        )
    }

    #[test]
    fn keys_are_dense_registration_order() {
        let mut builder = KindRegistryBuilder::new();
        let a = builder.register(dummy_kind("a"));
        let b = builder.register(dummy_kind("b"));
        let c = builder.register(dummy_kind("c"));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(c.index(), 2);

        let registry = builder.build();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(b).unwrap().name, "b");
        assert!(registry.contains(c));
        assert!(!registry.contains(PropertyKey::new(3)));
    }

    #[test]
    fn optional_hooks_default_to_none() {
        let kind = dummy_kind("plain");
        assert!(kind.fast_track.is_none());
        assert!(kind.check_refinement.is_none());

        let enriched = dummy_kind("enriched")
            .with_fast_track(Arc::new(|_, _| None))
            .with_refinement_check(Arc::new(|_, _| true));
        assert!(enriched.fast_track.is_some());
        assert!(enriched.check_refinement.is_some());
    }

    #[test]
    fn iter_yields_dense_pairs() {
        let mut builder = KindRegistryBuilder::new();
        builder.register(dummy_kind("x"));
        builder.register(dummy_kind("y"));
        let registry = builder.build();
        let names: Vec<_> = registry.iter().map(|(k, i)| (k.index(), i.name)).collect();
        assert_eq!(names, vec![(0, "x"), (1, "y")]);
    }
}
