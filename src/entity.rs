//! Entity identity for the quiesce engine.
//!
//! An entity is an opaque identity token: the store never inspects what it
//! stands for (a function, a field, a compound tuple of the embedder's
//! domain). Equality is identity equality on the token. Entities need not be
//! pre-enumerated; they appear when first referenced by a result or a query.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{EntityError, StoreResult};

/// Unique, niche-optimized identity token for an entity.
///
/// Uses `NonZeroU64` so that `Option<EntityId>` is the same size as `EntityId`
/// (the niche optimization lets the compiler use 0 as the `None` discriminant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(NonZeroU64);

impl EntityId {
    /// Create an `EntityId` from a raw `u64`.
    ///
    /// Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(EntityId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ent:{}", self.0)
    }
}

/// Thread-safe entity ID allocator.
///
/// Produces monotonically increasing IDs starting from 1. Safe to share
/// across threads via `Arc<EntityIdAllocator>`. Embedders that maintain
/// their own entity universe never need this; it exists for tests and for
/// embedders that mint compound entities on the fly.
#[derive(Debug)]
pub struct EntityIdAllocator {
    next: AtomicU64,
}

impl EntityIdAllocator {
    /// Create a new allocator that starts from ID 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Create an allocator that resumes from a given ID.
    pub fn starting_from(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    /// Allocate the next entity ID.
    ///
    /// Returns an error if the ID space is exhausted (after 2^64 - 1 allocations).
    pub fn next_id(&self) -> StoreResult<EntityId> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        EntityId::new(raw).ok_or_else(|| EntityError::AllocatorExhausted.into())
    }

    /// Return the next ID that *would* be allocated, without consuming it.
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
