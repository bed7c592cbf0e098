//! Store facade: the public API of the quiesce engine.
//!
//! The [`PropertyStore`] owns all subsystems behind a cheaply clonable
//! handle: the entity/property table, the dependency graph, the work deques,
//! and the worker pool. Clients register computations, schedule work, query
//! and force pairs, and drive phases to completion; everything else happens
//! on the workers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::{DashMap, DashSet};

use crate::entity::EntityId;
use crate::error::{ContractViolation, PhaseError, StoreError, StoreResult};
use crate::graph::DependencyGraph;
use crate::kind::{KindRegistry, PropertyKey};
use crate::property::{EntityProperty, PropertyState, PropertyValue};
use crate::queue::{JobTracker, WorkDeque};
use crate::result::{ComputationResult, PropertyComputation};
use crate::table::PropertyTable;
use crate::trace::{StatisticsSnapshot, StoreStatistics, StoreTracer};
use crate::worker::{Task, UpdateMessage, WorkerPool};

/// Configuration for a property store.
///
/// Explicit state: the kind universe and the thread count travel with the
/// store instead of living in process-wide globals.
#[derive(Clone)]
pub struct StoreConfig {
    /// The frozen universe of property kinds.
    pub kinds: KindRegistry,
    /// Number of compute workers. The updates worker is always spawned in
    /// addition. Defaults to the available parallelism, at least 1.
    pub num_threads: usize,
    /// Whether to run the debug validations (monotonicity, idempotent
    /// mismatches, end-of-phase scans). Violations found with validation
    /// off are logged, not raised.
    pub validate: bool,
    /// Whether query misses may try a kind's fast-track approximation
    /// before triggering the lazy computation.
    pub fast_track_enabled: bool,
    /// Optional observer for state transitions.
    pub tracer: Option<Arc<dyn StoreTracer>>,
}

impl StoreConfig {
    /// Configuration with defaults for everything but the kind universe.
    pub fn new(kinds: KindRegistry) -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            kinds,
            num_threads,
            validate: false,
            fast_track_enabled: true,
            tracer: None,
        }
    }

    /// Override the compute worker count.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Enable or disable debug validation.
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Enable or disable fast-track approximation on query misses.
    pub fn with_fast_track(mut self, enabled: bool) -> Self {
        self.fast_track_enabled = enabled;
        self
    }

    /// Attach a tracer.
    pub fn with_tracer(mut self, tracer: Arc<dyn StoreTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("kinds", &self.kinds.len())
            .field("num_threads", &self.num_threads)
            .field("validate", &self.validate)
            .field("fast_track_enabled", &self.fast_track_enabled)
            .field("tracer", &self.tracer.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Phase setup
// ---------------------------------------------------------------------------

/// The kind configuration of the current phase.
pub(crate) struct PhaseSetup {
    /// Kinds some analysis of this phase produces.
    pub(crate) computed: Vec<bool>,
    /// Kinds a later phase will produce.
    pub(crate) delayed: Vec<bool>,
    /// Whether a phase is currently set up.
    pub(crate) running: bool,
}

impl PhaseSetup {
    fn new(num_kinds: usize) -> Self {
        Self {
            computed: vec![false; num_kinds],
            delayed: vec![false; num_kinds],
            running: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

/// Everything the workers, the dispatcher, and the facade share.
pub(crate) struct StoreCore {
    pub(crate) kinds: KindRegistry,
    pub(crate) num_workers: usize,
    pub(crate) validate: bool,
    pub(crate) fast_track_enabled: bool,
    pub(crate) tracer: Option<Arc<dyn StoreTracer>>,

    pub(crate) table: PropertyTable,
    pub(crate) graph: Mutex<DependencyGraph>,
    pub(crate) tasks: WorkDeque<Task>,
    pub(crate) updates: WorkDeque<UpdateMessage>,
    pub(crate) jobs: JobTracker,

    /// Lazy computation per kind, at most one.
    pub(crate) lazy: DashMap<PropertyKey, PropertyComputation>,
    /// Per-kind set of entities whose lazy computation was already
    /// triggered.
    pub(crate) triggered: Vec<DashSet<EntityId>>,
    /// Pairs that may not end the phase in the intermediate state.
    pub(crate) forced: DashSet<(EntityId, PropertyKey)>,
    pub(crate) phase: RwLock<PhaseSetup>,

    pub(crate) stats: StoreStatistics,
    pub(crate) stop: AtomicBool,
    pub(crate) suspend: AtomicBool,
    /// Sticky: a fatal error was recorded.
    pub(crate) failed: AtomicBool,
    pub(crate) shut_down: AtomicBool,
    pub(crate) failure: Mutex<Option<StoreError>>,
    workers: Mutex<Option<WorkerPool>>,
}

impl StoreCore {
    /// Announce and push a compute task.
    pub(crate) fn schedule_task(&self, task: Task, front: bool) {
        self.jobs.add(1);
        self.stats.count_task_scheduled();
        if let Some(tracer) = &self.tracer {
            tracer.task_scheduled(task.kind(), task.entity());
        }
        if front {
            self.tasks.push_front(task);
        } else {
            self.tasks.push_back(task);
        }
    }

    /// Announce and push an update message.
    pub(crate) fn enqueue_update(&self, msg: UpdateMessage, front: bool) {
        self.jobs.add(1);
        if front {
            self.updates.push_front(msg);
        } else {
            self.updates.push_back(msg);
        }
    }

    /// Record the first fatal error of the phase and stop the workers.
    /// Later errors are discarded.
    pub(crate) fn record_failure(&self, err: StoreError) {
        {
            let mut slot = self.failure.lock().expect("failure slot lock poisoned");
            if slot.is_none() {
                tracing::error!(error = %err, "fatal error recorded; stopping workers");
                *slot = Some(err);
            }
        }
        self.failed.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        self.tasks.notify_all();
        self.updates.notify_all();
        self.jobs.wake_all();
    }

    /// Take the recorded error, if any, for re-raising.
    pub(crate) fn take_failure(&self) -> Option<StoreError> {
        self.failure.lock().expect("failure slot lock poisoned").take()
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// The concurrent fixed-point property store.
///
/// Cheaply clonable handle; all clones share the same store. Construct with
/// [`PropertyStore::new`], drive phases with
/// [`setup_phase`](PropertyStore::setup_phase) and
/// [`wait_on_phase_completion`](PropertyStore::wait_on_phase_completion),
/// and release the worker threads with
/// [`shutdown`](PropertyStore::shutdown) when done.
#[derive(Clone)]
pub struct PropertyStore {
    pub(crate) core: Arc<StoreCore>,
}

impl PropertyStore {
    /// Create a store and spawn its worker pool.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let num_kinds = config.kinds.len();
        let num_workers = config.num_threads.max(1);
        tracing::info!(
            kinds = num_kinds,
            workers = num_workers,
            validate = config.validate,
            "initializing property store"
        );

        let core = Arc::new(StoreCore {
            num_workers,
            validate: config.validate,
            fast_track_enabled: config.fast_track_enabled,
            tracer: config.tracer,
            table: PropertyTable::new(num_kinds),
            graph: Mutex::new(DependencyGraph::new(num_kinds)),
            tasks: WorkDeque::new(),
            updates: WorkDeque::new(),
            jobs: JobTracker::new(),
            lazy: DashMap::new(),
            triggered: (0..num_kinds).map(|_| DashSet::new()).collect(),
            forced: DashSet::new(),
            phase: RwLock::new(PhaseSetup::new(num_kinds)),
            stats: StoreStatistics::new(),
            stop: AtomicBool::new(false),
            suspend: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            failure: Mutex::new(None),
            workers: Mutex::new(None),
            kinds: config.kinds,
        });
        let pool = WorkerPool::spawn(&core);
        *core.workers.lock().expect("worker pool lock poisoned") = Some(pool);
        Ok(Self { core })
    }

    /// Internal handle for worker threads and kind hooks.
    pub(crate) fn from_core(core: Arc<StoreCore>) -> Self {
        Self { core }
    }

    pub(crate) fn ensure_usable(&self) -> StoreResult<()> {
        if self.core.shut_down.load(Ordering::Acquire) {
            return Err(PhaseError::ShutDown.into());
        }
        if self.core.failed.load(Ordering::Acquire) {
            return Err(PhaseError::Poisoned.into());
        }
        Ok(())
    }

    fn require_kind(&self, key: PropertyKey) -> StoreResult<()> {
        if self.core.kinds.contains(key) {
            Ok(())
        } else {
            Err(ContractViolation::UnknownKind { key }.into())
        }
    }

    // -----------------------------------------------------------------------
    // Registration and scheduling
    // -----------------------------------------------------------------------

    /// Register the lazy computation for a kind. Pre-phase only; at most
    /// one computation per kind.
    pub fn register_lazy(
        &self,
        key: PropertyKey,
        computation: PropertyComputation,
    ) -> StoreResult<()> {
        self.ensure_usable()?;
        self.require_kind(key)?;
        if self.core.phase.read().expect("phase lock poisoned").running {
            return Err(ContractViolation::LateLazyRegistration { key }.into());
        }
        match self.core.lazy.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ContractViolation::DuplicateLazyRegistration { key }.into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(computation);
                Ok(())
            }
        }
    }

    /// Schedule an eager computation for one entity.
    pub fn schedule_eager(
        &self,
        entity: EntityId,
        computation: PropertyComputation,
    ) -> StoreResult<()> {
        self.ensure_usable()?;
        self.core.schedule_task(
            Task::Initial {
                computation,
                entity,
            },
            false,
        );
        Ok(())
    }

    /// Schedule an eager computation for every entity of a universe.
    pub fn schedule_eager_for_entities<I>(
        &self,
        entities: I,
        computation: PropertyComputation,
    ) -> StoreResult<()>
    where
        I: IntoIterator<Item = EntityId>,
    {
        for entity in entities {
            self.schedule_eager(entity, Arc::clone(&computation))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Query the current value of a pair.
    ///
    /// On a miss: if a lazy computation is registered, the kind's
    /// fast-track approximation is tried first (when enabled), then the
    /// lazy computation is triggered at most once and `Key` is returned.
    /// If the kind is neither computed nor delayed this phase, the kind's
    /// fallback is returned as a final value.
    pub fn get(&self, entity: EntityId, key: PropertyKey) -> StoreResult<EntityProperty> {
        self.ensure_usable()?;
        self.require_kind(key)?;

        if let Some(state) = self.core.table.get(entity, key) {
            return Ok(EntityProperty::State(state));
        }

        if self.core.lazy.contains_key(&key) {
            if self.core.fast_track_enabled {
                if let Some(value) = self.try_fast_track(entity, key)? {
                    let state = PropertyState::final_state(entity, key, Arc::clone(&value));
                    self.core.enqueue_update(
                        UpdateMessage::Result {
                            result: ComputationResult::IdempotentFinal {
                                entity,
                                property: value,
                            },
                            force_notification: false,
                        },
                        true,
                    );
                    return Ok(EntityProperty::State(state));
                }
            }
            self.core
                .enqueue_update(UpdateMessage::TriggerLazy { key, entity }, true);
            return Ok(EntityProperty::Key { entity, key });
        }

        let in_phase = {
            let phase = self.core.phase.read().expect("phase lock poisoned");
            phase.computed[key.index()] || phase.delayed[key.index()]
        };
        if !in_phase {
            // Nobody will ever compute this kind: answer with the fallback
            // and let the updates worker persist it.
            let kind = self
                .core
                .kinds
                .get(key)
                .ok_or(ContractViolation::UnknownKind { key })?;
            let value = (kind.fallback)(self, entity);
            if value.key() != key {
                return Err(ContractViolation::KindMismatch {
                    expected: key,
                    actual: value.key(),
                }
                .into());
            }
            self.core.stats.count_fallback_used();
            if let Some(tracer) = &self.core.tracer {
                tracer.fallback_used(entity, key);
            }
            let state = PropertyState::final_state(entity, key, Arc::clone(&value));
            self.core.enqueue_update(
                UpdateMessage::Result {
                    result: ComputationResult::IdempotentFinal {
                        entity,
                        property: value,
                    },
                    force_notification: false,
                },
                true,
            );
            return Ok(EntityProperty::State(state));
        }

        Ok(EntityProperty::Key { entity, key })
    }

    fn try_fast_track(
        &self,
        entity: EntityId,
        key: PropertyKey,
    ) -> StoreResult<Option<PropertyValue>> {
        let Some(kind) = self.core.kinds.get(key) else {
            return Ok(None);
        };
        let Some(fast_track) = &kind.fast_track else {
            return Ok(None);
        };
        let Some(value) = fast_track(self, entity) else {
            return Ok(None);
        };
        if value.key() != key {
            return Err(ContractViolation::KindMismatch {
                expected: key,
                actual: value.key(),
            }
            .into());
        }
        self.core.stats.count_fast_track_hit();
        Ok(Some(value))
    }

    /// Mark a pair as forced: the phase may not end while it is
    /// intermediate, and its lazy computation (if any) is triggered.
    /// Idempotent.
    pub fn force(&self, entity: EntityId, key: PropertyKey) -> StoreResult<()> {
        self.ensure_usable()?;
        self.require_kind(key)?;
        self.core.forced.insert((entity, key));
        if !self.core.table.contains(entity, key) && self.core.lazy.contains_key(&key) {
            self.core
                .enqueue_update(UpdateMessage::TriggerLazy { key, entity }, true);
        }
        Ok(())
    }

    /// Install an externally provided final value. The kind must have no
    /// registered lazy computation, and the pair must not already have a
    /// value.
    pub fn set(&self, entity: EntityId, property: PropertyValue) -> StoreResult<()> {
        self.ensure_usable()?;
        let key = property.key();
        self.require_kind(key)?;
        if self.core.lazy.contains_key(&key) {
            return Err(ContractViolation::SetWithLazyComputation { key }.into());
        }
        self.core.enqueue_update(
            UpdateMessage::Result {
                result: ComputationResult::External { entity, property },
                force_notification: false,
            },
            true,
        );
        Ok(())
    }

    /// The single funnel for computed results.
    ///
    /// Results carrying only final information are prepended so finality
    /// propagates before refinable churn.
    pub fn handle_result(&self, result: ComputationResult) -> StoreResult<()> {
        self.handle_result_forced(result, false)
    }

    /// Like [`handle_result`](PropertyStore::handle_result), but depender
    /// notification fires even when the bounds did not change.
    pub fn handle_result_forced(
        &self,
        result: ComputationResult,
        force_depender_notification: bool,
    ) -> StoreResult<()> {
        self.ensure_usable()?;
        let front = result.is_final_kind();
        self.core.enqueue_update(
            UpdateMessage::Result {
                result,
                force_notification: force_depender_notification,
            },
            front,
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Whether the pair currently has a value (final or refinable).
    pub fn has_property(&self, entity: EntityId, key: PropertyKey) -> bool {
        self.core.table.contains(entity, key)
    }

    /// Whether the pair has a value or its lazy computation was triggered.
    pub fn is_known(&self, entity: EntityId, key: PropertyKey) -> bool {
        self.core.table.contains(entity, key)
            || self
                .core
                .triggered
                .get(key.index())
                .is_some_and(|set| set.contains(&entity))
    }

    /// Snapshot of the entities that currently have a value of the kind.
    pub fn entities(&self, key: PropertyKey) -> Vec<EntityId> {
        self.core.table.entities(key)
    }

    /// Snapshot of the entities whose state matches the predicate, across
    /// kinds. The snapshot is not serialized against concurrent growth.
    pub fn entities_matching<F>(&self, predicate: F) -> Vec<EntityId>
    where
        F: Fn(&PropertyState) -> bool,
    {
        self.core.table.entities_matching(predicate)
    }

    /// Point-in-time view of the statistics counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.core.stats.snapshot()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Pause the workers between tasks. Queued work stays queued.
    pub fn suspend(&self) {
        self.core.suspend.store(true, Ordering::Release);
    }

    /// Resume suspended workers.
    pub fn resume(&self) {
        self.core.suspend.store(false, Ordering::Release);
        self.core.tasks.notify_all();
        self.core.updates.notify_all();
    }

    /// Stop and join all worker threads. Idempotent; the store accepts no
    /// work afterwards.
    pub fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.stop.store(true, Ordering::Release);
        self.core.tasks.notify_all();
        self.core.updates.notify_all();
        self.core.jobs.wake_all();
        let pool = self
            .core
            .workers
            .lock()
            .expect("worker pool lock poisoned")
            .take();
        if let Some(mut pool) = pool {
            pool.join();
        }
        tracing::info!("property store shut down");
    }

    /// Drain both deques and clear observers and dependency entries after
    /// a fatal error. Already-published table values survive.
    pub(crate) fn interrupt_and_clear(&self) {
        let core = &self.core;
        core.stop.store(true, Ordering::Release);
        core.tasks.notify_all();
        core.updates.notify_all();
        let dropped_tasks = core.tasks.drain().len();
        let dropped_updates = core.updates.drain().len();
        core.jobs.reset();
        core.graph
            .lock()
            .expect("dependency graph lock poisoned")
            .clear();
        core.forced.clear();
        for set in &core.triggered {
            set.clear();
        }
        core.phase.write().expect("phase lock poisoned").running = false;
        tracing::warn!(
            dropped_tasks,
            dropped_updates,
            "phase interrupted; observers and dependency entries cleared"
        );
    }
}

impl fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore")
            .field("kinds", &self.core.kinds.len())
            .field("workers", &self.core.num_workers)
            .field("open_jobs", &self.core.jobs.open_jobs())
            .field("values", &self.core.table.total_len())
            .finish()
    }
}
