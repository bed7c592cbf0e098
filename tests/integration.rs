//! End-to-end tests for the quiesce engine.
//!
//! These drive whole phases through the public API: eager and lazy
//! computations, dependee refinement, fallback injection, cycle resolution,
//! forcing, and failure propagation, validating the final property
//! assignments and the statistics the store keeps along the way.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use quiesce::entity::EntityId;
use quiesce::kind::{KindRegistryBuilder, PropertyKey, PropertyKindInfo};
use quiesce::property::{EntityProperty, Property, PropertyState, PropertyValue};
use quiesce::result::{ComputationHint, ComputationResult};
use quiesce::store::{PropertyStore, StoreConfig};
use quiesce::trace::StoreTracer;

// ---------------------------------------------------------------------------
// Test lattice: a small "confidence level" ladder per kind
// ---------------------------------------------------------------------------

/// Levels 0..=3; the lower bound may only rise, the upper bound only fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Conf {
    key: PropertyKey,
    level: u8,
}

impl Property for Conf {
    fn key(&self) -> PropertyKey {
        self.key
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn dyn_eq(&self, other: &dyn Property) -> bool {
        other.downcast_ref::<Self>() == Some(self)
    }
}

const TOP: u8 = 3;

fn conf(key: PropertyKey, level: u8) -> PropertyValue {
    Arc::new(Conf { key, level })
}

fn level_of(value: &PropertyValue) -> u8 {
    value
        .downcast_ref::<Conf>()
        .expect("test property is always Conf")
        .level
}

fn ent(raw: u64) -> EntityId {
    EntityId::new(raw).unwrap()
}

/// A store over `n` ladder kinds: fallback is level 0, cycles resolve to
/// the upper bound, and the refinement order is checked when validation is
/// on.
fn build_store(
    n: u32,
    configure: impl FnOnce(StoreConfig) -> StoreConfig,
) -> (PropertyStore, Vec<PropertyKey>) {
    let mut builder = KindRegistryBuilder::new();
    let mut keys = Vec::new();
    for i in 0..n {
        let key = PropertyKey::new(i);
        let info = PropertyKindInfo::new(
            "conf",
            Arc::new(move |_store: &PropertyStore, _entity| conf(key, 0)),
            Arc::new(|_store: &PropertyStore, state: &PropertyState| Arc::clone(&state.ub)),
        )
        .with_refinement_check(Arc::new(|old: &PropertyState, new: &PropertyState| {
            level_of(&new.lb) >= level_of(&old.lb) && level_of(&new.ub) <= level_of(&old.ub)
        }));
        let registered = builder.register(info);
        assert_eq!(registered, key);
        keys.push(registered);
    }
    let store = PropertyStore::new(configure(StoreConfig::new(builder.build()))).unwrap();
    (store, keys)
}

fn final_level(store: &PropertyStore, entity: EntityId, key: PropertyKey) -> u8 {
    let answer = store.get(entity, key).unwrap();
    let value = answer
        .final_value()
        .unwrap_or_else(|| panic!("({entity}, {key}) should be final, got {answer:?}"));
    level_of(value)
}

/// Computation that adopts `other`'s final level, capped at `ub`, staying
/// refinable (and registered on `other`) until that happens.
fn adopting_computation(
    k: PropertyKey,
    other: EntityId,
    ub: u8,
) -> Arc<dyn Fn(&PropertyStore, EntityId) -> ComputationResult + Send + Sync> {
    fn continue_with(
        k: PropertyKey,
        entity: EntityId,
        ub: u8,
        observed: EntityProperty,
    ) -> ComputationResult {
        if let Some(value) = observed.final_value() {
            return ComputationResult::Final {
                entity,
                property: conf(k, level_of(value).min(ub)),
            };
        }
        ComputationResult::Interim {
            state: PropertyState::new(entity, k, conf(k, 0), conf(k, ub)),
            dependees: vec![observed],
            on_update: Arc::new(move |_store: &PropertyStore, updated: &PropertyState| {
                continue_with(k, entity, ub, EntityProperty::State(updated.clone()))
            }),
            hint: ComputationHint::Expensive,
        }
    }

    Arc::new(move |store: &PropertyStore, entity| {
        let observed = store.get(other, k).unwrap();
        continue_with(k, entity, ub, observed)
    })
}

// ---------------------------------------------------------------------------
// Scenario 1: single eager computation, no dependees
// ---------------------------------------------------------------------------

#[test]
fn single_eager_computation_finalizes() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let e1 = ent(1);

    store.setup_phase(&[k], &[]).unwrap();
    store
        .schedule_eager(
            e1,
            Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Final {
                entity,
                property: conf(k, 2),
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(final_level(&store, e1, k), 2);
    let stats = store.statistics();
    assert_eq!(stats.resolved_sccs, 0);
    assert!(stats.tasks_scheduled >= 1);
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario 2: linear chain, continuation rescheduled on refinement
// ---------------------------------------------------------------------------

#[test]
fn linear_chain_propagates_finality() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let (a, b) = (ent(1), ent(2));

    store.setup_phase(&[k], &[]).unwrap();
    store.schedule_eager(a, adopting_computation(k, b, TOP)).unwrap();
    // `b` starts refinable with no dependees; quiescence finalizes it to
    // its upper bound, which then reaches `a` through its continuation.
    store
        .schedule_eager(
            b,
            Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Interim {
                state: PropertyState::new(entity, k, conf(k, 0), conf(k, 2)),
                dependees: Vec::new(),
                on_update: Arc::new(|_store: &PropertyStore, _state: &PropertyState| {
                    ComputationResult::NoResult
                }),
                hint: ComputationHint::Expensive,
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(final_level(&store, b, k), 2);
    assert_eq!(final_level(&store, a, k), 2);
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario 3: cycles of refinable values resolve at quiescence
// ---------------------------------------------------------------------------

#[test]
fn two_node_cycle_resolves_at_quiescence() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let (a, b) = (ent(1), ent(2));

    store.setup_phase(&[k], &[]).unwrap();
    store.schedule_eager(a, adopting_computation(k, b, 2)).unwrap();
    store.schedule_eager(b, adopting_computation(k, a, 2)).unwrap();
    store.wait_on_phase_completion().unwrap();

    // Cycle resolution replaced both refinable values with their upper
    // bounds.
    assert_eq!(final_level(&store, a, k), 2);
    assert_eq!(final_level(&store, b, k), 2);
    assert!(store.statistics().resolved_sccs >= 1);
    store.shutdown();
}

#[test]
fn three_node_cycle_resolves_within_one_round() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(3));
    let k = keys[0];
    let (a, b, c) = (ent(1), ent(2), ent(3));

    store.setup_phase(&[k], &[]).unwrap();
    store.schedule_eager(a, adopting_computation(k, b, 1)).unwrap();
    store.schedule_eager(b, adopting_computation(k, c, 1)).unwrap();
    store.schedule_eager(c, adopting_computation(k, a, 1)).unwrap();
    store.wait_on_phase_completion().unwrap();

    for e in [a, b, c] {
        assert_eq!(final_level(&store, e, k), 1);
    }
    assert!(store.statistics().resolved_sccs >= 1);
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario 4: fallback injection revives the depender
// ---------------------------------------------------------------------------

#[test]
fn fallback_injected_for_uncomputed_dependee() {
    let (store, keys) = build_store(2, |c| c.with_num_threads(2));
    let (k, k2) = (keys[0], keys[1]);
    let (y, x) = (ent(1), ent(2));

    // k2 is announced as computed, so the query returns `Key` instead of
    // short-circuiting to the fallback; the value only appears at
    // quiescence.
    store.setup_phase(&[k, k2], &[]).unwrap();
    // `y` adopts `x`'s k2 level; nobody computes k2.
    store
        .schedule_eager(
            y,
            Arc::new(move |store: &PropertyStore, entity| {
                let observed = store.get(x, k2).unwrap();
                if let Some(value) = observed.final_value() {
                    return ComputationResult::Final {
                        entity,
                        property: conf(k, level_of(value)),
                    };
                }
                ComputationResult::Interim {
                    state: PropertyState::new(entity, k, conf(k, 0), conf(k, TOP)),
                    dependees: vec![observed],
                    on_update: Arc::new(
                        move |_store: &PropertyStore, updated: &PropertyState| {
                            ComputationResult::Final {
                                entity,
                                property: conf(k, level_of(&updated.ub)),
                            }
                        },
                    ),
                    hint: ComputationHint::Expensive,
                }
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(final_level(&store, x, k2), 0);
    assert_eq!(final_level(&store, y, k), 0);
    assert!(store.statistics().fallbacks_used >= 1);
    store.shutdown();
}

#[test]
fn get_short_circuits_to_fallback_for_uncomputed_kind() {
    let (store, keys) = build_store(2, |c| c.with_num_threads(2));
    let (k, k2) = (keys[0], keys[1]);

    // Only k is computed this phase; k2 is neither computed nor delayed.
    store.setup_phase(&[k], &[]).unwrap();
    let answer = store.get(ent(9), k2).unwrap();
    assert_eq!(level_of(answer.final_value().unwrap()), 0);
    store.wait_on_phase_completion().unwrap();

    // Delayed kinds instead answer with `Key`.
    store.setup_phase(&[k], &[k2]).unwrap();
    let answer = store.get(ent(10), k2).unwrap();
    assert!(!answer.has_value());
    store.wait_on_phase_completion().unwrap();
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario 5: lazy computations run at most once, forcing resolves them
// ---------------------------------------------------------------------------

#[test]
fn forced_lazy_computation_runs_at_most_once() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let e = ent(1);
    let runs = Arc::new(AtomicUsize::new(0));

    let runs_in_computation = Arc::clone(&runs);
    store
        .register_lazy(
            k,
            Arc::new(move |_store: &PropertyStore, entity| {
                runs_in_computation.fetch_add(1, Ordering::SeqCst);
                ComputationResult::Final {
                    entity,
                    property: conf(k, 2),
                }
            }),
        )
        .unwrap();
    store.setup_phase(&[k], &[]).unwrap();

    store.force(e, k).unwrap();
    store.force(e, k).unwrap();
    let _ = store.get(e, k).unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(final_level(&store, e, k), 2);
    assert_eq!(store.statistics().scheduled_lazy, 1);
    store.shutdown();
}

#[test]
fn fast_track_answers_before_lazy_runs() {
    let mut builder = KindRegistryBuilder::new();
    let key = PropertyKey::new(0);
    let info = PropertyKindInfo::new(
        "conf",
        Arc::new(move |_store: &PropertyStore, _entity| conf(key, 0)),
        Arc::new(|_store: &PropertyStore, state: &PropertyState| Arc::clone(&state.ub)),
    )
    .with_fast_track(Arc::new(move |_store: &PropertyStore, _entity| {
        Some(conf(key, 1))
    }));
    let k = builder.register(info);
    let store =
        PropertyStore::new(StoreConfig::new(builder.build()).with_num_threads(2)).unwrap();

    let lazy_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&lazy_runs);
    store
        .register_lazy(
            k,
            Arc::new(move |_store: &PropertyStore, entity| {
                counter.fetch_add(1, Ordering::SeqCst);
                ComputationResult::Final {
                    entity,
                    property: conf(k, 2),
                }
            }),
        )
        .unwrap();
    store.setup_phase(&[k], &[]).unwrap();

    let answer = store.get(ent(1), k).unwrap();
    assert_eq!(level_of(answer.final_value().unwrap()), 1);
    store.wait_on_phase_completion().unwrap();

    assert_eq!(lazy_runs.load(Ordering::SeqCst), 0);
    assert_eq!(store.statistics().fast_track_hits, 1);
    assert_eq!(final_level(&store, ent(1), k), 1);
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario 6: contention on a single dependee
// ---------------------------------------------------------------------------

#[test]
fn many_dependers_are_notified_exactly_once() {
    const DEPENDERS: u64 = 10_000;
    let (store, keys) = build_store(1, |c| c.with_num_threads(4));
    let k = keys[0];
    let s = ent(1);
    let continuation_runs: Arc<DashMap<EntityId, usize>> = Arc::new(DashMap::new());

    let runs = Arc::clone(&continuation_runs);
    let depender: Arc<dyn Fn(&PropertyStore, EntityId) -> ComputationResult + Send + Sync> =
        Arc::new(move |store: &PropertyStore, entity| {
            let observed = store.get(s, k).unwrap();
            if let Some(value) = observed.final_value() {
                return ComputationResult::Final {
                    entity,
                    property: conf(k, level_of(value)),
                };
            }
            let runs = Arc::clone(&runs);
            ComputationResult::Interim {
                state: PropertyState::new(entity, k, conf(k, 0), conf(k, TOP)),
                dependees: vec![observed],
                on_update: Arc::new(move |_store: &PropertyStore, updated: &PropertyState| {
                    *runs.entry(entity).or_insert(0) += 1;
                    ComputationResult::Final {
                        entity,
                        property: conf(k, level_of(&updated.ub)),
                    }
                }),
                hint: ComputationHint::Expensive,
            }
        });

    store.setup_phase(&[k], &[]).unwrap();
    store
        .schedule_eager_for_entities((2..2 + DEPENDERS).map(ent), depender)
        .unwrap();
    store
        .schedule_eager(
            s,
            Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Final {
                entity,
                property: conf(k, 2),
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    for e in (2..2 + DEPENDERS).map(ent) {
        assert_eq!(final_level(&store, e, k), 2);
    }
    // Every continuation that was registered fired exactly once.
    for entry in continuation_runs.iter() {
        assert_eq!(*entry.value(), 1, "{} notified more than once", entry.key());
    }
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Universal properties
// ---------------------------------------------------------------------------

/// Tracer recording every published bound pair per (entity, kind).
#[derive(Default)]
struct BoundsRecorder {
    published: Mutex<Vec<(EntityId, PropertyKey, u8, u8)>>,
}

impl StoreTracer for BoundsRecorder {
    fn property_published(&self, state: &PropertyState) {
        self.published.lock().unwrap().push((
            state.entity,
            state.key,
            level_of(&state.lb),
            level_of(&state.ub),
        ));
    }
}

#[test]
fn updates_are_monotone_and_finality_is_stable() {
    let recorder = Arc::new(BoundsRecorder::default());
    let (store, keys) = build_store(1, |c| {
        c.with_num_threads(2)
            .with_validation(true)
            .with_tracer(Arc::clone(&recorder) as Arc<dyn StoreTracer>)
    });
    let k = keys[0];
    let (a, b) = (ent(1), ent(2));

    store.setup_phase(&[k], &[]).unwrap();
    store.schedule_eager(a, adopting_computation(k, b, 2)).unwrap();
    store.schedule_eager(b, adopting_computation(k, a, 2)).unwrap();
    store.wait_on_phase_completion().unwrap();

    let published = recorder.published.lock().unwrap();
    let mut last: HashMap<(EntityId, PropertyKey), (u8, u8)> = HashMap::new();
    for &(e, key, lb, ub) in published.iter() {
        if let Some(&(old_lb, old_ub)) = last.get(&(e, key)) {
            assert!(lb >= old_lb, "lower bound regressed for {e}");
            assert!(ub <= old_ub, "upper bound regressed for {e}");
            assert!(old_lb != old_ub, "update after a final value for {e}");
        }
        last.insert((e, key), (lb, ub));
    }
    // Everything ended final.
    for (_, (lb, ub)) in last.iter() {
        assert_eq!(lb, ub);
    }
    store.shutdown();
}

#[test]
fn final_assignments_are_deterministic_across_worker_counts() {
    let mut outcomes = Vec::new();
    for threads in [1, 2, 4] {
        let (store, keys) = build_store(1, |c| c.with_num_threads(threads));
        let k = keys[0];
        let (a, b, c) = (ent(1), ent(2), ent(3));

        store.setup_phase(&[k], &[]).unwrap();
        store.schedule_eager(a, adopting_computation(k, b, 2)).unwrap();
        store.schedule_eager(b, adopting_computation(k, c, 2)).unwrap();
        store.schedule_eager(c, adopting_computation(k, a, TOP)).unwrap();
        store.wait_on_phase_completion().unwrap();

        let mut snapshot: Vec<(u64, u8)> = [a, b, c]
            .into_iter()
            .map(|e| (e.get(), final_level(&store, e, k)))
            .collect();
        snapshot.sort();
        outcomes.push(snapshot);
        store.shutdown();
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);
}

#[test]
fn fallback_completeness_after_phase() {
    let (store, keys) = build_store(2, |c| c.with_num_threads(2));
    let (k, k2) = (keys[0], keys[1]);

    store.setup_phase(&[k, k2], &[]).unwrap();
    // Several dependers on k2 pairs nobody computes.
    for i in 0..20u64 {
        let x = ent(100 + i);
        store
            .schedule_eager(
                ent(1 + i),
                Arc::new(move |store: &PropertyStore, entity| {
                    let observed = store.get(x, k2).unwrap();
                    if observed.is_final() {
                        return ComputationResult::Final {
                            entity,
                            property: conf(k, 1),
                        };
                    }
                    ComputationResult::Interim {
                        state: PropertyState::new(entity, k, conf(k, 0), conf(k, TOP)),
                        dependees: vec![observed],
                        on_update: Arc::new(
                            move |_store: &PropertyStore, _updated: &PropertyState| {
                                ComputationResult::Final {
                                    entity,
                                    property: conf(k, 1),
                                }
                            },
                        ),
                        hint: ComputationHint::Cheap,
                    }
                }),
            )
            .unwrap();
    }
    store.wait_on_phase_completion().unwrap();

    // Every depended-on pair of a non-delayed kind has a value.
    for i in 0..20u64 {
        assert!(store.has_property(ent(100 + i), k2));
        assert_eq!(final_level(&store, ent(1 + i), k), 1);
    }
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

#[test]
fn first_computation_panic_is_re_raised() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];

    store.setup_phase(&[k], &[]).unwrap();
    store
        .schedule_eager(
            ent(1),
            Arc::new(|_store: &PropertyStore, _entity| -> ComputationResult {
                panic!("analysis bug")
            }),
        )
        .unwrap();

    let err = store.wait_on_phase_completion().unwrap_err();
    assert!(err.to_string().contains("analysis bug"));

    // The store is poisoned afterwards.
    assert!(store.get(ent(2), k).is_err());
    store.shutdown();
}

#[test]
fn conflicting_final_values_are_a_contract_violation() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let e = ent(1);

    store
        .handle_result(ComputationResult::Final {
            entity: e,
            property: conf(k, 1),
        })
        .unwrap();
    store
        .handle_result(ComputationResult::Final {
            entity: e,
            property: conf(k, 2),
        })
        .unwrap();

    let err = store.wait_on_phase_completion().unwrap_err();
    assert!(err.to_string().contains("must not change"));
    store.shutdown();
}

#[test]
fn illegal_refinement_is_caught_when_validating() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2).with_validation(true));
    let k = keys[0];
    let e = ent(1);

    let interim = |lb: u8, ub: u8| ComputationResult::Interim {
        state: PropertyState::new(e, k, conf(k, lb), conf(k, ub)),
        dependees: vec![EntityProperty::Key {
            entity: ent(99),
            key: k,
        }],
        on_update: Arc::new(|_store: &PropertyStore, _state: &PropertyState| {
            ComputationResult::NoResult
        }),
        hint: ComputationHint::Expensive,
    };

    store.handle_result(interim(1, 3)).unwrap();
    // The lower bound regresses from 1 to 0.
    store.handle_result(interim(0, 3)).unwrap();

    let err = store.wait_on_phase_completion().unwrap_err();
    assert!(err.to_string().contains("illegal refinement"));
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Partial, batched, and idempotent results
// ---------------------------------------------------------------------------

#[test]
fn partial_results_collaborate_on_one_value() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let e = ent(1);

    store.setup_phase(&[k], &[]).unwrap();
    // Three contributors raise the lower bound; contributions that change
    // nothing are counted as useless.
    for contribution in [1u8, 2, 2] {
        store
            .handle_result(ComputationResult::Partial {
                entity: e,
                key: k,
                update: Arc::new(move |current: &EntityProperty| {
                    let (lb, ub) = match current.as_state() {
                        Some(s) => (level_of(&s.lb), level_of(&s.ub)),
                        None => (0, TOP),
                    };
                    if contribution <= lb {
                        return None;
                    }
                    Some(PropertyState::new(
                        e,
                        k,
                        conf(k, contribution.max(lb)),
                        conf(k, ub),
                    ))
                }),
            })
            .unwrap();
    }
    store.wait_on_phase_completion().unwrap();

    // No dependees, so quiescence finalized the collaborative value to its
    // upper bound.
    assert_eq!(final_level(&store, e, k), TOP);
    assert!(store.statistics().useless_partial >= 1);
    store.shutdown();
}

#[test]
fn batch_and_incremental_results_dispatch_all_parts() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];

    let followup: Arc<dyn Fn(&PropertyStore, EntityId) -> ComputationResult + Send + Sync> =
        Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Final {
            entity,
            property: conf(k, 1),
        });

    store.setup_phase(&[k], &[]).unwrap();
    store
        .schedule_eager(
            ent(1),
            Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Incremental {
                result: Box::new(ComputationResult::Batch(vec![
                    ComputationResult::Final {
                        entity,
                        property: conf(k, 2),
                    },
                    ComputationResult::IdempotentFinal {
                        entity: ent(2),
                        property: conf(k, 1),
                    },
                ])),
                followups: vec![(Arc::clone(&followup), ent(3)), (followup.clone(), ent(4))],
                hint: ComputationHint::Expensive,
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(final_level(&store, ent(1), k), 2);
    assert_eq!(final_level(&store, ent(2), k), 1);
    assert_eq!(final_level(&store, ent(3), k), 1);
    assert_eq!(final_level(&store, ent(4), k), 1);
    store.shutdown();
}

#[test]
fn redundant_idempotent_results_are_dropped() {
    let (store, keys) = build_store(1, |c| c.with_num_threads(2));
    let k = keys[0];
    let e = ent(1);

    store.setup_phase(&[k], &[]).unwrap();
    store.set(e, conf(k, 2)).unwrap();
    store.wait_on_phase_completion().unwrap();
    assert_eq!(final_level(&store, e, k), 2);

    // The value is already present; an equal idempotent result is dropped.
    store
        .handle_result(ComputationResult::IdempotentFinal {
            entity: e,
            property: conf(k, 2),
        })
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(final_level(&store, e, k), 2);
    assert!(store.statistics().redundant_idempotent >= 1);
    store.shutdown();
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[test]
fn successive_phases_reuse_the_store() {
    let (store, keys) = build_store(2, |c| c.with_num_threads(2));
    let (k, k2) = (keys[0], keys[1]);

    store.setup_phase(&[k], &[k2]).unwrap();
    store
        .schedule_eager(
            ent(1),
            Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Final {
                entity,
                property: conf(k, 1),
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();
    assert_eq!(final_level(&store, ent(1), k), 1);

    // Second phase computes the previously delayed kind.
    store.setup_phase(&[k2], &[]).unwrap();
    store
        .schedule_eager(
            ent(1),
            Arc::new(move |_store: &PropertyStore, entity| ComputationResult::Final {
                entity,
                property: conf(k2, 2),
            }),
        )
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    assert_eq!(final_level(&store, ent(1), k), 1);
    assert_eq!(final_level(&store, ent(1), k2), 2);
    assert!(store.statistics().quiescence_count >= 2);
    store.shutdown();
}

#[test]
fn delayed_kinds_survive_cycle_resolution_and_finalization() {
    let (store, keys) = build_store(2, |c| c.with_num_threads(2));
    let (k, k2) = (keys[0], keys[1]);
    let e = ent(1);

    store.setup_phase(&[k], &[k2]).unwrap();
    // A refinable k2 value with no way to make progress this phase.
    store
        .handle_result(ComputationResult::Interim {
            state: PropertyState::new(e, k2, conf(k2, 0), conf(k2, TOP)),
            dependees: vec![EntityProperty::Key {
                entity: ent(50),
                key: k2,
            }],
            on_update: Arc::new(|_store: &PropertyStore, _state: &PropertyState| {
                ComputationResult::NoResult
            }),
            hint: ComputationHint::Expensive,
        })
        .unwrap();
    store.wait_on_phase_completion().unwrap();

    // The delayed value is still refinable: neither fallback injection nor
    // finalization touched it.
    let answer = store.get(e, k2).unwrap();
    assert!(answer.is_refinable());
    store.shutdown();
}
