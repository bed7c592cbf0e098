//! The worker pool: N compute workers plus one updates worker.
//!
//! Compute workers take tasks from the task deque, run the client
//! computation, and funnel the produced result onto the update deque. The
//! single updates worker owns all store mutation: it pops update messages
//! and drives them through the dispatcher. All threads are long-lived named
//! daemons; cancellation is cooperative through the shared stop and suspend
//! flags, and the first panic raised by any computation is recorded so the
//! phase-wait call can re-raise it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::dispatch::Dispatcher;
use crate::entity::EntityId;
use crate::error::WorkerFailure;
use crate::kind::PropertyKey;
use crate::property::PropertyState;
use crate::result::{ComputationResult, OnUpdateContinuation, PropertyComputation};
use crate::store::{PropertyStore, StoreCore};

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// A unit of work for a compute worker.
pub(crate) enum Task {
    /// Run an initial computation for an entity.
    Initial {
        computation: PropertyComputation,
        entity: EntityId,
    },
    /// Run a lazy computation that a query or force triggered.
    TriggeredLazy {
        computation: PropertyComputation,
        entity: EntityId,
    },
    /// Re-run a continuation with a dependee's refined, still refinable
    /// bounds.
    OnUpdate {
        continuation: OnUpdateContinuation,
        state: PropertyState,
        force_notification: bool,
    },
    /// Re-run a continuation with a dependee's final bounds.
    OnFinal {
        continuation: OnUpdateContinuation,
        state: PropertyState,
        force_notification: bool,
    },
    /// Re-run a continuation with whatever the dependee's freshest bounds
    /// are at execution time. `seen` is the snapshot that justified the
    /// re-run; the table can only have refined it further since.
    ImmediateOnUpdate {
        continuation: OnUpdateContinuation,
        seen: PropertyState,
        force_notification: bool,
    },
}

impl Task {
    /// Stable name for tracing.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Task::Initial { .. } => "initial",
            Task::TriggeredLazy { .. } => "triggered-lazy",
            Task::OnUpdate { .. } => "on-update",
            Task::OnFinal { .. } => "on-final",
            Task::ImmediateOnUpdate { .. } => "immediate-on-update",
        }
    }

    /// The entity the task concerns (the dependee entity for
    /// continuation re-runs).
    pub(crate) fn entity(&self) -> EntityId {
        match self {
            Task::Initial { entity, .. } => *entity,
            Task::TriggeredLazy { entity, .. } => *entity,
            Task::OnUpdate { state, .. } => state.entity,
            Task::OnFinal { state, .. } => state.entity,
            Task::ImmediateOnUpdate { seen, .. } => seen.entity,
        }
    }
}

/// A message for the updates worker.
pub(crate) enum UpdateMessage {
    /// A computed result to dispatch.
    Result {
        result: ComputationResult,
        force_notification: bool,
    },
    /// A query or force asked for a lazy computation; the updates worker
    /// deduplicates and schedules the actual task.
    TriggerLazy { key: PropertyKey, entity: EntityId },
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Handles of the spawned worker threads.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `core.num_workers` compute workers and the updates worker.
    pub(crate) fn spawn(core: &Arc<StoreCore>) -> Self {
        let mut handles = Vec::with_capacity(core.num_workers + 1);
        for i in 0..core.num_workers {
            let core = Arc::clone(core);
            let handle = thread::Builder::new()
                .name(format!("quiesce-compute-{i}"))
                .spawn(move || compute_loop(core))
                .expect("failed to spawn compute worker");
            handles.push(handle);
        }
        let core = Arc::clone(core);
        let handle = thread::Builder::new()
            .name("quiesce-updates".to_string())
            .spawn(move || updates_loop(core))
            .expect("failed to spawn updates worker");
        handles.push(handle);
        Self { handles }
    }

    /// Join every worker. The stop flag must already be set.
    pub(crate) fn join(&mut self) {
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

fn compute_loop(core: Arc<StoreCore>) {
    let store = PropertyStore::from_core(Arc::clone(&core));
    while let Some(task) = core.tasks.pop_wait(&core.stop, &core.suspend) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_task(&core, &store, task)));
        if let Err(payload) = outcome {
            core.record_failure(
                WorkerFailure::ComputationPanicked {
                    detail: panic_message(payload),
                }
                .into(),
            );
        }
        core.jobs.complete();
    }
    tracing::debug!("compute worker exiting");
}

fn run_task(core: &Arc<StoreCore>, store: &PropertyStore, task: Task) {
    let (result, force_notification) = match task {
        Task::Initial {
            computation,
            entity,
        }
        | Task::TriggeredLazy {
            computation,
            entity,
        } => (computation(store, entity), false),
        Task::OnUpdate {
            continuation,
            state,
            force_notification,
        }
        | Task::OnFinal {
            continuation,
            state,
            force_notification,
        } => (continuation(store, &state), force_notification),
        Task::ImmediateOnUpdate {
            continuation,
            seen,
            force_notification,
        } => {
            // Monotonicity guarantees the freshest bounds are at least as
            // refined as the snapshot that justified this task.
            let freshest = core.table.get(seen.entity, seen.key).unwrap_or(seen);
            (continuation(store, &freshest), force_notification)
        }
    };
    if matches!(result, ComputationResult::NoResult) && !force_notification {
        return;
    }
    let front = result.is_final_kind();
    core.enqueue_update(
        UpdateMessage::Result {
            result,
            force_notification,
        },
        front,
    );
}

fn updates_loop(core: Arc<StoreCore>) {
    let mut dispatcher = Dispatcher::new(Arc::clone(&core));
    while let Some(msg) = core.updates.pop_wait(&core.stop, &core.suspend) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle(msg)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => core.record_failure(err),
            Err(payload) => core.record_failure(
                WorkerFailure::ComputationPanicked {
                    detail: panic_message(payload),
                }
                .into(),
            ),
        }
        core.jobs.complete();
    }
    tracing::debug!("updates worker exiting");
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
