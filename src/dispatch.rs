//! The result dispatcher: a switch over result variants, serialized on the
//! updates worker.
//!
//! All table and graph mutation funnels through here, so the single-writer
//! discipline holds without per-entry synchronization. Cheap follow-up
//! continuations accumulate on a local stack and are processed in the same
//! dispatch loop; expensive ones round-trip through the task deque.

use std::sync::Arc;

use crate::error::{ContractViolation, StoreResult};
use crate::graph::{DependerEntry, EpPair};
use crate::kind::{PropertyKey, PropertyKindInfo};
use crate::property::{EntityProperty, PropertyState, PropertyValue};
use crate::result::{
    ComputationHint, ComputationResult, OnUpdateContinuation, PartialUpdate,
};
use crate::store::{PropertyStore, StoreCore};
use crate::worker::{Task, UpdateMessage};
use crate::entity::EntityId;

/// Interprets computation results on behalf of the updates worker.
pub(crate) struct Dispatcher {
    core: Arc<StoreCore>,
    store: PropertyStore,
    /// Local stack of results produced by inlined cheap continuations,
    /// processed within the current dispatch loop.
    stack: Vec<(ComputationResult, bool)>,
}

impl Dispatcher {
    pub(crate) fn new(core: Arc<StoreCore>) -> Self {
        let store = PropertyStore::from_core(Arc::clone(&core));
        Self {
            core,
            store,
            stack: Vec::new(),
        }
    }

    /// Handle one update message, including everything cheap continuations
    /// produce along the way.
    pub(crate) fn handle(&mut self, msg: UpdateMessage) -> StoreResult<()> {
        let outcome = match msg {
            UpdateMessage::TriggerLazy { key, entity } => self.trigger_lazy(key, entity),
            UpdateMessage::Result {
                result,
                force_notification,
            } => {
                self.stack.push((result, force_notification));
                self.drain_stack()
            }
        };
        if outcome.is_err() {
            // The store is about to be poisoned; leftover inline work is void.
            self.stack.clear();
        }
        outcome
    }

    fn drain_stack(&mut self) -> StoreResult<()> {
        while let Some((result, force)) = self.stack.pop() {
            self.dispatch(result, force)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, result: ComputationResult, force: bool) -> StoreResult<()> {
        if let Some(tracer) = &self.core.tracer {
            tracer.update_handled(result.variant());
        }
        match result {
            ComputationResult::NoResult => Ok(()),

            ComputationResult::Batch(results) => {
                // Reversed so the pop order matches the batch order.
                for r in results.into_iter().rev() {
                    self.stack.push((r, force));
                }
                Ok(())
            }

            ComputationResult::Incremental {
                result,
                followups,
                hint,
            } => {
                self.stack.push((*result, force));
                for (computation, entity) in followups {
                    // Inline only while the deque holds enough work to keep
                    // the compute pool fed; otherwise share the work.
                    let pool_fed = self.core.tasks.len() >= self.core.num_workers;
                    if hint == ComputationHint::Cheap && pool_fed {
                        let r = computation(&self.store, entity);
                        self.stack.push((r, false));
                    } else {
                        self.core
                            .schedule_task(Task::Initial {
                                computation,
                                entity,
                            }, false);
                    }
                }
                Ok(())
            }

            ComputationResult::Final { entity, property } => self.apply_final(entity, property),

            ComputationResult::MultiFinal(values) => {
                for (entity, property) in values {
                    self.apply_final(entity, property)?;
                }
                Ok(())
            }

            ComputationResult::External { entity, property } => {
                self.apply_external(entity, property)
            }

            ComputationResult::IdempotentFinal { entity, property } => {
                self.apply_idempotent(entity, property)
            }

            ComputationResult::Partial {
                entity,
                key,
                update,
            } => self.apply_partial(entity, key, update, force),

            ComputationResult::Interim {
                state,
                dependees,
                on_update,
                hint,
            } => self.apply_interim(state, dependees, on_update, hint, force),

            ComputationResult::Cycles(sccs) => self.resolve_cycles(sccs),
        }
    }

    // -----------------------------------------------------------------------
    // Final results
    // -----------------------------------------------------------------------

    fn apply_final(&mut self, entity: EntityId, property: PropertyValue) -> StoreResult<()> {
        let key = property.key();
        self.require_kind(key)?;
        let pair = (entity, key);

        if let Some(existing) = self.core.table.get(entity, key) {
            if existing.is_final() {
                if existing.ub.dyn_eq(property.as_ref()) {
                    tracing::debug!(entity = %entity, key = %key, "redundant final result dropped");
                    return Ok(());
                }
                return Err(ContractViolation::FinalValueMutation { entity, key }.into());
            }
            let new_state = PropertyState::final_state(entity, key, Arc::clone(&property));
            self.check_refinement(&existing, &new_state)?;
        }

        let state = PropertyState::final_state(entity, key, property);
        self.core.table.set(state.clone());
        if let Some(tracer) = &self.core.tracer {
            tracer.property_published(&state);
        }
        tracing::debug!(entity = %entity, key = %key, "final value published");

        // Finality retires all metadata for the pair: its own dependee
        // registration, the forced flag, the triggered-lazy flag, and the
        // dependers that are about to be notified.
        let dependers = {
            let mut graph = self.core.graph.lock().expect("dependency graph lock poisoned");
            graph.clear_dependees(pair);
            graph.take_dependers(pair)
        };
        self.core.forced.remove(&pair);
        if let Some(set) = self.core.triggered.get(key.index()) {
            set.remove(&entity);
        }

        self.notify_dependers(dependers, &state);
        Ok(())
    }

    fn apply_external(&mut self, entity: EntityId, property: PropertyValue) -> StoreResult<()> {
        let key = property.key();
        self.require_kind(key)?;
        if self.core.table.contains(entity, key) {
            if self.core.validate {
                return Err(ContractViolation::SetOverExisting { entity, key }.into());
            }
            tracing::warn!(
                entity = %entity,
                key = %key,
                "external value dropped: the pair already has a value"
            );
            return Ok(());
        }
        self.apply_final(entity, property)
    }

    fn apply_idempotent(&mut self, entity: EntityId, property: PropertyValue) -> StoreResult<()> {
        let key = property.key();
        self.require_kind(key)?;
        match self.core.table.get(entity, key) {
            None => self.apply_final(entity, property),
            Some(existing) => {
                // A refinable existing value never agrees with a final
                // claim; it disagrees the same way an unequal final does.
                let agrees = existing
                    .final_value()
                    .is_some_and(|v| v.dyn_eq(property.as_ref()));
                if !agrees {
                    if self.core.validate {
                        return Err(
                            ContractViolation::IdempotentMismatch { entity, key }.into()
                        );
                    }
                    tracing::warn!(
                        entity = %entity,
                        key = %key,
                        existing_final = existing.is_final(),
                        "idempotent result disagrees with the stored value"
                    );
                }
                self.core.stats.count_redundant_idempotent();
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Partial results
    // -----------------------------------------------------------------------

    fn apply_partial(
        &mut self,
        entity: EntityId,
        key: PropertyKey,
        update: PartialUpdate,
        force: bool,
    ) -> StoreResult<()> {
        self.require_kind(key)?;
        let current = match self.core.table.get(entity, key) {
            Some(state) => EntityProperty::State(state),
            None => EntityProperty::Key { entity, key },
        };
        match update(&current) {
            None => {
                self.core.stats.count_useless_partial();
                Ok(())
            }
            Some(new_state) => {
                if new_state.key != key {
                    return Err(ContractViolation::KindMismatch {
                        expected: key,
                        actual: new_state.key,
                    }
                    .into());
                }
                if new_state.is_final() {
                    self.apply_final(entity, Arc::clone(&new_state.ub))
                } else {
                    self.publish_update(new_state, force).map(|_| ())
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interim results: the core loop
    // -----------------------------------------------------------------------

    fn apply_interim(
        &mut self,
        state: PropertyState,
        dependees: Vec<EntityProperty>,
        on_update: OnUpdateContinuation,
        hint: ComputationHint,
        force_notification: bool,
    ) -> StoreResult<()> {
        let pair = (state.entity, state.key);
        self.require_kind(state.key)?;

        // Coinciding bounds make the result final regardless of how it was
        // announced; the dependee set is irrelevant from here on.
        if state.is_final() {
            return self.apply_final(state.entity, state.ub);
        }

        // 1. Stale-dependee check: if any dependee was refined relative to
        //    what the continuation saw, re-run it with the newer value and
        //    abandon registering the stale set. The force flag is preserved
        //    so pending notifications are not lost.
        for seen in &dependees {
            let (e, k) = seen.pair();
            self.require_kind(k)?;
            let current = self.core.table.get(e, k);
            let refined = match (&current, seen) {
                (Some(_), EntityProperty::Key { .. }) => true,
                (Some(cur), EntityProperty::State(s)) => !cur.same_bounds(s),
                (None, _) => false,
            };
            if !refined {
                continue;
            }
            let Some(newer) = current else { continue };
            tracing::debug!(
                depender_entity = %pair.0,
                depender_key = %pair.1,
                dependee_entity = %e,
                dependee_key = %k,
                "dependee refined underneath an interim result; re-running continuation"
            );
            match hint {
                ComputationHint::Cheap => {
                    let r = on_update(&self.store, &newer);
                    self.stack.push((r, force_notification));
                }
                ComputationHint::Expensive if newer.is_final() => {
                    self.core.schedule_task(
                        Task::OnFinal {
                            continuation: on_update,
                            state: newer,
                            force_notification,
                        },
                        true,
                    );
                }
                ComputationHint::Expensive => {
                    self.core.schedule_task(
                        Task::ImmediateOnUpdate {
                            continuation: on_update,
                            seen: newer,
                            force_notification,
                        },
                        false,
                    );
                }
            }
            return Ok(());
        }

        // 2. Nothing stale: publish the bounds and notify dependers of a
        //    relevant (or forced) update.
        self.publish_update(state, force_notification)?;

        // 3. Register the fresh dependee set both ways. Dependees that are
        //    already final and unchanged can never fire again; their edges
        //    are dropped rather than registered.
        let live: Vec<EntityProperty> = dependees
            .into_iter()
            .filter(|d| !d.is_final())
            .collect();
        if !live.is_empty() {
            let mut graph = self.core.graph.lock().expect("dependency graph lock poisoned");
            graph.register(pair, live, on_update, hint);
        } else {
            let mut graph = self.core.graph.lock().expect("dependency graph lock poisoned");
            graph.clear_dependees(pair);
        }
        Ok(())
    }

    /// Publish refinable bounds and notify dependers when the update is
    /// relevant (bounds actually changed) or forced. Returns whether the
    /// bounds changed.
    fn publish_update(&mut self, state: PropertyState, force: bool) -> StoreResult<bool> {
        let pair = (state.entity, state.key);
        let existing = self.core.table.get(state.entity, state.key);

        if let Some(ex) = &existing {
            if ex.is_final() {
                return Err(ContractViolation::FinalValueMutation {
                    entity: state.entity,
                    key: state.key,
                }
                .into());
            }
            self.check_refinement(ex, &state)?;
        }

        let changed = existing.map_or(true, |ex| !ex.same_bounds(&state));
        if changed {
            self.core.table.set(state.clone());
            if let Some(tracer) = &self.core.tracer {
                tracer.property_published(&state);
            }
        }
        if changed || force {
            let dependers = {
                let mut graph =
                    self.core.graph.lock().expect("dependency graph lock poisoned");
                graph.take_dependers(pair)
            };
            self.notify_dependers(dependers, &state);
        }
        Ok(changed)
    }

    /// Reschedule every taken depender continuation with the new bounds.
    ///
    /// The entries' registrations were already retired, so each depender is
    /// notified exactly once per update and at most one computation per
    /// pair is live afterwards.
    fn notify_dependers(
        &mut self,
        dependers: Vec<(EpPair, DependerEntry)>,
        state: &PropertyState,
    ) {
        let is_final = state.is_final();
        let dependee = (state.entity, state.key);
        for (depender, entry) in dependers {
            self.core.stats.count_depender_notified();
            if let Some(tracer) = &self.core.tracer {
                tracer.depender_notified(depender, dependee);
            }
            match entry.hint {
                ComputationHint::Cheap => {
                    let r = (entry.continuation)(&self.store, state);
                    self.stack.push((r, false));
                }
                ComputationHint::Expensive => {
                    let task = if is_final {
                        Task::OnFinal {
                            continuation: entry.continuation,
                            state: state.clone(),
                            force_notification: false,
                        }
                    } else {
                        Task::OnUpdate {
                            continuation: entry.continuation,
                            state: state.clone(),
                            force_notification: false,
                        }
                    };
                    // Final information propagates first.
                    self.core.schedule_task(task, is_final);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cycle resolution
    // -----------------------------------------------------------------------

    fn resolve_cycles(&mut self, sccs: Vec<Vec<EpPair>>) -> StoreResult<()> {
        for members in sccs {
            // Clear intra-component links first so resolving one member
            // does not fire notifications into the others.
            {
                let mut graph =
                    self.core.graph.lock().expect("dependency graph lock poisoned");
                for member in &members {
                    graph.clear_dependees(*member);
                }
            }
            let mut resolutions: Vec<(EntityId, PropertyValue)> =
                Vec::with_capacity(members.len());
            for member in &members {
                let Some(state) = self.core.table.get(member.0, member.1) else {
                    continue;
                };
                if state.is_final() {
                    continue;
                }
                let kind = self.kind_info(member.1)?;
                let value = (kind.resolve_cycle)(&self.store, &state);
                resolutions.push((member.0, value));
            }
            for (entity, value) in resolutions {
                self.apply_final(entity, value)?;
            }
            self.core.stats.count_resolved_scc();
            if let Some(tracer) = &self.core.tracer {
                tracer.cycle_resolved(&members);
            }
            tracing::debug!(members = members.len(), "closed component resolved");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Triggered lazy computations
    // -----------------------------------------------------------------------

    fn trigger_lazy(&mut self, key: PropertyKey, entity: EntityId) -> StoreResult<()> {
        let Some(already) = self.core.triggered.get(key.index()) else {
            return Err(ContractViolation::UnknownKind { key }.into());
        };
        // At most one trigger per pair for the lifetime of the value.
        if !already.insert(entity) {
            return Ok(());
        }
        if self.core.table.contains(entity, key) {
            return Ok(());
        }
        let Some(computation) = self.core.lazy.get(&key).map(|c| Arc::clone(c.value())) else {
            return Ok(());
        };
        self.core.stats.count_scheduled_lazy();
        self.core.schedule_task(
            Task::TriggeredLazy {
                computation,
                entity,
            },
            false,
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn require_kind(&self, key: PropertyKey) -> StoreResult<()> {
        if self.core.kinds.contains(key) {
            Ok(())
        } else {
            Err(ContractViolation::UnknownKind { key }.into())
        }
    }

    fn kind_info(&self, key: PropertyKey) -> StoreResult<&PropertyKindInfo> {
        self.core
            .kinds
            .get(key)
            .ok_or_else(|| ContractViolation::UnknownKind { key }.into())
    }

    /// Monotonicity check, run whenever the kind supplies an order.
    ///
    /// A violation is fatal when validation is on; otherwise it is logged
    /// and the update goes through.
    fn check_refinement(&self, old: &PropertyState, new: &PropertyState) -> StoreResult<()> {
        let Some(kind) = self.core.kinds.get(old.key) else {
            return Ok(());
        };
        let Some(check) = &kind.check_refinement else {
            return Ok(());
        };
        if check(old, new) {
            return Ok(());
        }
        if self.core.validate {
            return Err(ContractViolation::IllegalRefinement {
                entity: old.entity,
                key: old.key,
                detail: format!("{old:?} does not refine to {new:?}"),
            }
            .into());
        }
        tracing::warn!(
            entity = %old.entity,
            key = %old.key,
            old = ?old,
            new = ?new,
            "non-monotone refinement"
        );
        Ok(())
    }
}
