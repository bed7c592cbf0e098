//! # quiesce
//!
//! A concurrent, fixed-point property store: the scheduling engine behind
//! whole-program analyses whose results depend on each other. Computations
//! attach *properties* to *entities*, observe each other's intermediate
//! bounds, and are re-run until the whole system reaches quiescence; the
//! store then fills in fallback values for pairs nobody computed, resolves
//! closed components of mutually-dependent refinable values, and finalizes
//! the rest.
//!
//! ## Architecture
//!
//! - **Lattice primitives** (`property`, `kind`): type-erased property
//!   values with lower/upper bounds, dense kind ids with fallback and
//!   cycle-resolution hooks
//! - **Entity/property table** (`table`): per-kind concurrent maps, written
//!   only by the updates worker
//! - **Dependency graph** (`graph`): mirrored depender/dependee maps under
//!   single-writer discipline
//! - **Worker pool** (`worker`, `queue`): N compute workers plus one
//!   updates worker over prepend/append deques
//! - **Result dispatch** (`dispatch`, `result`): a switch over tagged
//!   result variants, serialized on the updates worker
//! - **Phase control** (`phase`): quiescence detection, fallback injection,
//!   closed-SCC resolution
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use quiesce::entity::EntityId;
//! use quiesce::kind::{KindRegistryBuilder, PropertyKindInfo};
//! use quiesce::result::ComputationResult;
//! use quiesce::store::{PropertyStore, StoreConfig};
//! # fn some_kind_info() -> PropertyKindInfo { unimplemented!() }
//! # fn some_computation(store: &PropertyStore, e: EntityId) -> ComputationResult {
//! #     ComputationResult::NoResult
//! # }
//!
//! let mut kinds = KindRegistryBuilder::new();
//! let purity = kinds.register(some_kind_info());
//! let store = PropertyStore::new(StoreConfig::new(kinds.build()))?;
//!
//! let entity = EntityId::new(1).unwrap();
//! store.schedule_eager(entity, Arc::new(some_computation))?;
//! store.setup_phase(&[purity], &[])?;
//! store.wait_on_phase_completion()?;
//!
//! let answer = store.get(entity, purity)?;
//! assert!(answer.is_final());
//! store.shutdown();
//! # Ok::<(), quiesce::error::StoreError>(())
//! ```

pub mod entity;
pub mod error;
pub mod graph;
pub mod kind;
pub mod property;
pub mod queue;
pub mod result;
pub mod store;
pub mod table;
pub mod trace;

pub(crate) mod dispatch;
pub(crate) mod worker;

mod phase;
