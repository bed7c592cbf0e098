//! The phase controller: setup, quiescence detection, and the
//! post-processing rounds that revive work.
//!
//! A phase is bounded by [`PropertyStore::setup_phase`] and
//! [`PropertyStore::wait_on_phase_completion`]. The wait loop blocks until
//! the open-jobs count reaches zero, then runs rounds of post-processing at
//! a consistent snapshot (nothing is queued or in flight):
//!
//! 1. fallback injection for depended-on pairs nobody computed;
//! 2. if none, closed strongly-connected components of still refinable
//!    values are resolved;
//! 3. if none, refinable values with no remaining dependees are finalized
//!    to their upper bound.
//!
//! Each round may revive work; the loop waits it out and goes again. The
//! phase ends when a round produces nothing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{ContractViolation, PhaseError, StoreResult};
use crate::graph::EpPair;
use crate::kind::PropertyKey;
use crate::property::PropertyState;
use crate::result::ComputationResult;
use crate::store::PropertyStore;
use crate::worker::UpdateMessage;

impl PropertyStore {
    /// Configure the kinds of the next phase.
    ///
    /// `computed` names the kinds some analysis of this phase produces;
    /// `delayed` names kinds a *later* phase will produce, so queries for
    /// them are answered with `Key` instead of a fallback and their values
    /// are exempt from cycle resolution and finalization. May not overlap
    /// with running work.
    pub fn setup_phase(
        &self,
        computed: &[PropertyKey],
        delayed: &[PropertyKey],
    ) -> StoreResult<()> {
        self.ensure_usable()?;
        let open = self.core.jobs.open_jobs();
        if open > 0 {
            return Err(PhaseError::Overlap { open_jobs: open }.into());
        }
        for key in computed.iter().chain(delayed) {
            if !self.core.kinds.contains(*key) {
                return Err(ContractViolation::UnknownKind { key: *key }.into());
            }
        }

        let num_kinds = self.core.kinds.len();
        let mut phase = self.core.phase.write().expect("phase lock poisoned");
        phase.computed = vec![false; num_kinds];
        phase.delayed = vec![false; num_kinds];
        for key in computed {
            phase.computed[key.index()] = true;
        }
        for key in delayed {
            phase.delayed[key.index()] = true;
        }
        phase.running = true;
        tracing::info!(
            computed = computed.len(),
            delayed = delayed.len(),
            "phase set up"
        );
        Ok(())
    }

    /// Drive the phase to completion.
    ///
    /// Blocks until no task is running or queued and no post-processing
    /// round produces new work. Re-raises the first error any computation
    /// recorded; in that case the deques are drained and every observer and
    /// dependency entry is cleared.
    pub fn wait_on_phase_completion(&self) -> StoreResult<()> {
        let core = &self.core;
        if core.shut_down.load(Ordering::Acquire) {
            return Err(PhaseError::ShutDown.into());
        }
        let mut round = 0usize;
        loop {
            core.jobs.await_quiescence(&core.failed);
            if let Some(err) = core.take_failure() {
                self.interrupt_and_clear();
                return Err(err);
            }
            if core.failed.load(Ordering::Acquire) {
                // The failure was already re-raised by an earlier wait.
                return Err(PhaseError::Poisoned.into());
            }
            if core.jobs.open_jobs() > 0 {
                // Spurious wake-up; keep waiting.
                continue;
            }

            round += 1;
            core.stats.count_quiescence();
            if let Some(tracer) = &core.tracer {
                tracer.quiescence_reached(round);
            }

            let mut continued = self.inject_fallbacks()? > 0;
            if !continued {
                let sccs = self.find_closed_sccs();
                if !sccs.is_empty() {
                    core.enqueue_update(
                        UpdateMessage::Result {
                            result: ComputationResult::Cycles(sccs),
                            force_notification: false,
                        },
                        true,
                    );
                    continued = true;
                }
            }
            if !continued {
                continued = self.finalize_dangling() > 0;
            }
            if !continued {
                break;
            }
            // Revived work is in flight; wait it out and go again.
        }

        self.log_end_of_phase_diagnostics();
        self.core.phase.write().expect("phase lock poisoned").running = false;
        tracing::info!(rounds = round, "phase completed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Round 1: fallback injection
    // -----------------------------------------------------------------------

    /// Inject each kind's fallback for every pair that someone depends on
    /// (or forced) but that no analysis gave a value. Returns how many were
    /// injected.
    fn inject_fallbacks(&self) -> StoreResult<usize> {
        let core = &self.core;
        let mut targets: Vec<EpPair> = Vec::new();
        {
            let phase = core.phase.read().expect("phase lock poisoned");
            let graph = core.graph.lock().expect("dependency graph lock poisoned");
            for (key, _info) in core.kinds.iter() {
                if phase.delayed[key.index()] {
                    continue;
                }
                for entity in graph.entities_with_dependers(key) {
                    if !core.table.contains(entity, key) {
                        targets.push((entity, key));
                    }
                }
            }
            for pair in core.forced.iter() {
                let (entity, key) = *pair;
                if !phase.delayed[key.index()] && !core.table.contains(entity, key) {
                    targets.push((entity, key));
                }
            }
        }
        targets.sort();
        targets.dedup();

        for &(entity, key) in &targets {
            let kind = core
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
            core.stats.count_fallback_used();
            if let Some(tracer) = &core.tracer {
                tracer.fallback_used(entity, key);
            }
            tracing::debug!(entity = %entity, key = %key, "fallback injected");
            core.enqueue_update(
                UpdateMessage::Result {
                    result: ComputationResult::Final {
                        entity,
                        property: value,
                    },
                    force_notification: false,
                },
                true,
            );
        }
        Ok(targets.len())
    }

    // -----------------------------------------------------------------------
    // Round 2: closed strongly-connected components
    // -----------------------------------------------------------------------

    /// Find the closed strongly-connected components of the current
    /// depender graph, restricted to refinable values of non-delayed kinds.
    ///
    /// A component is closed when no member depends on anything outside it;
    /// incoming edges from the rest of the graph are fine and their owners
    /// get notified once the members are resolved.
    fn find_closed_sccs(&self) -> Vec<Vec<EpPair>> {
        let core = &self.core;
        let phase = core.phase.read().expect("phase lock poisoned");
        let graph = core.graph.lock().expect("dependency graph lock poisoned");

        let eligible = |pair: &EpPair| -> bool {
            !phase.delayed[pair.1.index()]
                && core
                    .table
                    .get(pair.0, pair.1)
                    .is_some_and(|s| s.is_refinable())
        };

        let mut dig: DiGraph<EpPair, ()> = DiGraph::new();
        let mut index: HashMap<EpPair, NodeIndex> = HashMap::new();
        for (from, to) in graph.edges() {
            if !eligible(&from) || !eligible(&to) {
                continue;
            }
            let fi = *index.entry(from).or_insert_with(|| dig.add_node(from));
            let ti = *index.entry(to).or_insert_with(|| dig.add_node(to));
            dig.add_edge(fi, ti, ());
        }

        let mut closed = Vec::new();
        for scc in tarjan_scc(&dig) {
            if scc.len() == 1 && !dig.contains_edge(scc[0], scc[0]) {
                continue;
            }
            let members: HashSet<EpPair> = scc.iter().map(|n| dig[*n]).collect();
            let is_closed = members.iter().all(|member| {
                graph
                    .dependees_of(*member)
                    .map(|deps| deps.iter().all(|d| members.contains(&d.pair())))
                    .unwrap_or(true)
            });
            if is_closed {
                let mut component: Vec<EpPair> = members.into_iter().collect();
                component.sort();
                closed.push(component);
            }
        }
        closed
    }

    // -----------------------------------------------------------------------
    // Round 3: finalization of dangling refinable values
    // -----------------------------------------------------------------------

    /// Finalize every refinable value of a non-delayed kind that has no
    /// remaining dependees: with nothing queued and nothing to wait for,
    /// its upper bound is as good as it will ever get.
    fn finalize_dangling(&self) -> usize {
        let core = &self.core;
        let mut targets: Vec<PropertyState> = Vec::new();
        {
            let phase = core.phase.read().expect("phase lock poisoned");
            let graph = core.graph.lock().expect("dependency graph lock poisoned");
            for (key, _info) in core.kinds.iter() {
                if phase.delayed[key.index()] {
                    continue;
                }
                for state in core.table.states(key) {
                    if state.is_refinable() && !graph.has_dependees((state.entity, key)) {
                        targets.push(state);
                    }
                }
            }
        }
        let count = targets.len();
        for state in targets {
            tracing::debug!(
                entity = %state.entity,
                key = %state.key,
                "finalizing refinable value with no remaining dependees"
            );
            core.enqueue_update(
                UpdateMessage::Result {
                    result: ComputationResult::Final {
                        entity: state.entity,
                        property: state.ub,
                    },
                    force_notification: false,
                },
                true,
            );
        }
        count
    }

    // -----------------------------------------------------------------------
    // End-of-phase diagnostics
    // -----------------------------------------------------------------------

    /// Diagnostic scans that log but never fail the phase: forced pairs
    /// left intermediate, and dependee registrations surviving a
    /// finalization. The third diagnostic, monotonicity, is checked per
    /// update on the dispatcher, where both the old and the new bounds are
    /// still at hand.
    fn log_end_of_phase_diagnostics(&self) {
        let core = &self.core;
        let phase = core.phase.read().expect("phase lock poisoned");
        let graph = core.graph.lock().expect("dependency graph lock poisoned");

        for pair in core.forced.iter() {
            let (entity, key) = *pair;
            if phase.delayed[key.index()] {
                continue;
            }
            let still_open = core
                .table
                .get(entity, key)
                .map_or(true, |s| s.is_refinable());
            if still_open {
                tracing::warn!(
                    entity = %entity,
                    key = %key,
                    "forced pair left intermediate at end of phase"
                );
            }
        }
        for (key, _info) in core.kinds.iter() {
            for state in core.table.states(key) {
                if state.is_final() && graph.has_dependees((state.entity, key)) {
                    tracing::warn!(
                        entity = %state.entity,
                        key = %key,
                        "final value still carries a dependee registration"
                    );
                }
            }
        }
    }
}
