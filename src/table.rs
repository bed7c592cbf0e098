//! The entity/property table: per-kind concurrent maps from entity to the
//! current bound pair.
//!
//! Kind-indexed as a dense array of `DashMap` shards for cache locality.
//! Reads are wait-free from any thread; writes happen only on the updates
//! worker, so publication is a plain insert with atomic-swap semantics.
//! Snapshot iteration is non-serialized; consumers tolerate concurrent
//! growth.

use dashmap::DashMap;

use crate::entity::EntityId;
use crate::kind::PropertyKey;
use crate::property::PropertyState;

/// Per-kind concurrent entity/property table.
#[derive(Debug)]
pub struct PropertyTable {
    shards: Vec<DashMap<EntityId, PropertyState>>,
}

impl PropertyTable {
    /// Create a table for a frozen universe of `num_kinds` kinds.
    pub fn new(num_kinds: usize) -> Self {
        Self {
            shards: (0..num_kinds).map(|_| DashMap::new()).collect(),
        }
    }

    fn shard(&self, key: PropertyKey) -> Option<&DashMap<EntityId, PropertyState>> {
        self.shards.get(key.index())
    }

    /// Current bound pair for the pair, if any.
    pub fn get(&self, entity: EntityId, key: PropertyKey) -> Option<PropertyState> {
        self.shard(key)?.get(&entity).map(|r| r.value().clone())
    }

    /// Whether the pair has a value (final or refinable).
    pub fn contains(&self, entity: EntityId, key: PropertyKey) -> bool {
        self.shard(key)
            .is_some_and(|shard| shard.contains_key(&entity))
    }

    /// Publish a bound pair. Updates-worker only.
    pub fn set(&self, state: PropertyState) {
        if let Some(shard) = self.shard(state.key) {
            shard.insert(state.entity, state);
        }
    }

    /// Snapshot of all entities that currently have a value of the kind.
    pub fn entities(&self, key: PropertyKey) -> Vec<EntityId> {
        self.shard(key)
            .map(|shard| shard.iter().map(|r| *r.key()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of all bound pairs of the kind.
    pub fn states(&self, key: PropertyKey) -> Vec<PropertyState> {
        self.shard(key)
            .map(|shard| shard.iter().map(|r| r.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of all entities, across kinds, whose state matches the
    /// predicate.
    pub fn entities_matching<F>(&self, predicate: F) -> Vec<EntityId>
    where
        F: Fn(&PropertyState) -> bool,
    {
        let mut out = Vec::new();
        for shard in &self.shards {
            for r in shard.iter() {
                if predicate(r.value()) {
                    out.push(*r.key());
                }
            }
        }
        out
    }

    /// Number of stored values of the kind.
    pub fn len(&self, key: PropertyKey) -> usize {
        self.shard(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Total number of stored values across kinds.
    pub fn total_len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Whether the table holds no values at all.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Drop every stored value. Phase-interruption path only.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }
}
