//! Dependency graph: who observed whom, and who to notify on refinement.
//!
//! Two mirrored maps, both kind-indexed then entity-keyed:
//!
//! 1. depender side: the dependee snapshots the computation for a pair last
//!    observed;
//! 2. dependee side: every depender registered on a pair, with the
//!    continuation to re-run and its scheduling hint.
//!
//! Every edge in one map has a reciprocal edge in the other, and a non-final
//! depender has exactly one registration at a time: registering replaces,
//! and notification retires the registration before the continuation is
//! rescheduled. That retire-before-reschedule step is what guarantees at
//! most one live computation per pair.
//!
//! Single-writer discipline: the updates worker owns all mutation while a
//! phase runs; the phase controller touches the graph only at quiescence,
//! when in-flight jobs are exactly zero.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::entity::EntityId;
use crate::kind::PropertyKey;
use crate::property::EntityProperty;
use crate::result::{ComputationHint, OnUpdateContinuation};

/// An (entity, kind) pair: the node identity of the graph.
pub type EpPair = (EntityId, PropertyKey);

/// A depender registered on a dependee: the continuation to re-run when the
/// dependee is refined, and how to schedule it.
#[derive(Clone)]
pub struct DependerEntry {
    /// Continuation re-run with the dependee's new bounds.
    pub continuation: OnUpdateContinuation,
    /// Inline on the dispatch loop or round-trip through the task deque.
    pub hint: ComputationHint,
}

impl fmt::Debug for DependerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependerEntry")
            .field("hint", &self.hint)
            .finish_non_exhaustive()
    }
}

/// The mirrored depender/dependee maps.
pub struct DependencyGraph {
    /// `dependees[k][e]`: snapshots the computation for `(e, k)` observed.
    dependees: Vec<HashMap<EntityId, Vec<EntityProperty>>>,
    /// `dependers[k'][e']`: dependers registered on `(e', k')`.
    dependers: Vec<HashMap<EntityId, HashMap<EpPair, DependerEntry>>>,
}

impl DependencyGraph {
    /// Create an empty graph for a frozen universe of `num_kinds` kinds.
    pub fn new(num_kinds: usize) -> Self {
        Self {
            dependees: (0..num_kinds).map(|_| HashMap::new()).collect(),
            dependers: (0..num_kinds).map(|_| HashMap::new()).collect(),
        }
    }

    /// Register a depender with its observed dependee set, both ways.
    ///
    /// Replaces any previous registration of the depender, so exactly one
    /// entry exists per non-final depender.
    pub fn register(
        &mut self,
        depender: EpPair,
        dependees: Vec<EntityProperty>,
        continuation: OnUpdateContinuation,
        hint: ComputationHint,
    ) {
        self.clear_dependees(depender);
        for dependee in &dependees {
            let (e, k) = dependee.pair();
            self.dependers[k.index()].entry(e).or_default().insert(
                depender,
                DependerEntry {
                    continuation: Arc::clone(&continuation),
                    hint,
                },
            );
        }
        self.dependees[depender.1.index()].insert(depender.0, dependees);
    }

    /// Retire a depender's registration: its dependee list and every
    /// reciprocal edge. Returns whether a registration existed.
    pub fn clear_dependees(&mut self, depender: EpPair) -> bool {
        let Some(seen) = self.dependees[depender.1.index()].remove(&depender.0) else {
            return false;
        };
        for dependee in &seen {
            let (e, k) = dependee.pair();
            let kind_map = &mut self.dependers[k.index()];
            if let Some(entries) = kind_map.get_mut(&e) {
                entries.remove(&depender);
                if entries.is_empty() {
                    kind_map.remove(&e);
                }
            }
        }
        true
    }

    /// Take every depender registered on the pair, retiring each one's own
    /// dependee registration on the way out.
    ///
    /// The returned entries are exactly the continuations to notify; because
    /// their registrations are gone, a second update of the same dependee
    /// cannot notify them again.
    pub fn take_dependers(&mut self, dependee: EpPair) -> Vec<(EpPair, DependerEntry)> {
        let Some(entries) = self.dependers[dependee.1.index()].remove(&dependee.0) else {
            return Vec::new();
        };
        let taken: Vec<(EpPair, DependerEntry)> = entries.into_iter().collect();
        for (depender, _) in &taken {
            self.clear_dependees(*depender);
        }
        taken
    }

    /// The dependee snapshots registered for a depender, if any.
    pub fn dependees_of(&self, depender: EpPair) -> Option<&[EntityProperty]> {
        self.dependees[depender.1.index()]
            .get(&depender.0)
            .map(|v| v.as_slice())
    }

    /// Whether the pair has a live dependee registration.
    pub fn has_dependees(&self, depender: EpPair) -> bool {
        self.dependees[depender.1.index()].contains_key(&depender.0)
    }

    /// Number of dependers currently registered on the pair.
    pub fn depender_count(&self, dependee: EpPair) -> usize {
        self.dependers[dependee.1.index()]
            .get(&dependee.0)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Entities of the kind that currently have at least one depender.
    ///
    /// This is the fallback-injection work list: a pair someone depends on
    /// but that has no value at quiescence gets the kind's fallback.
    pub fn entities_with_dependers(&self, key: PropertyKey) -> Vec<EntityId> {
        self.dependers[key.index()].keys().copied().collect()
    }

    /// Snapshot of every depender to dependee edge.
    pub fn edges(&self) -> Vec<(EpPair, EpPair)> {
        let mut out = Vec::new();
        for (k, kind_map) in self.dependees.iter().enumerate() {
            let key = PropertyKey::new(k as u32);
            for (e, seen) in kind_map {
                let depender = (*e, key);
                for dependee in seen {
                    out.push((depender, dependee.pair()));
                }
            }
        }
        out
    }

    /// All pairs that currently have a dependee registration.
    pub fn dependers(&self) -> Vec<EpPair> {
        let mut out = Vec::new();
        for (k, kind_map) in self.dependees.iter().enumerate() {
            let key = PropertyKey::new(k as u32);
            out.extend(kind_map.keys().map(|e| (*e, key)));
        }
        out
    }

    /// Total number of depender to dependee edges.
    pub fn edge_count(&self) -> usize {
        self.dependees
            .iter()
            .flat_map(|m| m.values())
            .map(|v| v.len())
            .sum()
    }

    /// Whether no registration exists at all.
    pub fn is_empty(&self) -> bool {
        self.dependees.iter().all(|m| m.is_empty())
            && self.dependers.iter().all(|m| m.is_empty())
    }

    /// Debug validation: every edge has its reciprocal edge.
    pub fn symmetry_holds(&self) -> bool {
        for (depender, dependee) in self.edges() {
            let present = self.dependers[dependee.1.index()]
                .get(&dependee.0)
                .is_some_and(|m| m.contains_key(&depender));
            if !present {
                return false;
            }
        }
        for (k, kind_map) in self.dependers.iter().enumerate() {
            let key = PropertyKey::new(k as u32);
            for (e, entries) in kind_map {
                for depender in entries.keys() {
                    let seen = self.dependees[depender.1.index()].get(&depender.0);
                    let present = seen
                        .is_some_and(|v| v.iter().any(|d| d.pair() == (*e, key)));
                    if !present {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Drop every registration. Phase-interruption path only.
    pub fn clear(&mut self) {
        for m in &mut self.dependees {
            m.clear();
        }
        for m in &mut self.dependers {
            m.clear();
        }
    }
}

impl fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("dependers", &self.dependers().len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
