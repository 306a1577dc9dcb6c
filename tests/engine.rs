#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use cellpool::{
    Cell, CellError, HandlerPool, HandlerPoolBuilder, Key, NotMonotonic, Outcome, Updater,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Purity {
    Bottom,
    Pure,
    Impure,
}

struct PurityUpdater;

impl Updater<Purity> for PurityUpdater {
    fn bottom(&self) -> Purity {
        Purity::Bottom
    }

    fn update(&self, current: &Purity, incoming: Purity) -> Result<Purity, NotMonotonic> {
        Ok((*current).max(incoming))
    }
}

/// Rejects any downgrade attempt instead of absorbing it.
struct StrictPurityUpdater;

impl Updater<Purity> for StrictPurityUpdater {
    fn bottom(&self) -> Purity {
        Purity::Bottom
    }

    fn update(&self, current: &Purity, incoming: Purity) -> Result<Purity, NotMonotonic> {
        if incoming < *current {
            Err(NotMonotonic)
        } else {
            Ok(incoming)
        }
    }
}

struct IgnoreFinalUpdater;

impl Updater<Purity> for IgnoreFinalUpdater {
    fn bottom(&self) -> Purity {
        Purity::Bottom
    }

    fn update(&self, current: &Purity, incoming: Purity) -> Result<Purity, NotMonotonic> {
        Ok((*current).max(incoming))
    }

    fn ignore_if_final(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct PureKey;

impl Key<Purity> for PureKey {
    fn resolve(&self, cells: &[Cell<Self, Purity>]) -> Vec<(Cell<Self, Purity>, Purity)> {
        cells.iter().map(|c| (c.clone(), Purity::Pure)).collect()
    }

    fn fallback(&self, cells: &[Cell<Self, Purity>]) -> Vec<(Cell<Self, Purity>, Purity)> {
        cells.iter().map(|c| (c.clone(), Purity::Pure)).collect()
    }
}

fn purity_pool() -> HandlerPool<PureKey, Purity> {
    HandlerPoolBuilder::new()
        .parallelism(4)
        .build(PurityUpdater)
        .expect("pool must build")
}

struct MaxUpdater;

impl Updater<u64> for MaxUpdater {
    fn bottom(&self) -> u64 {
        0
    }

    fn update(&self, current: &u64, incoming: u64) -> Result<u64, NotMonotonic> {
        Ok((*current).max(incoming))
    }
}

#[derive(Debug, Clone)]
struct MaxKey;

impl Key<u64> for MaxKey {
    fn resolve(&self, cells: &[Cell<Self, u64>]) -> Vec<(Cell<Self, u64>, u64)> {
        cells.iter().map(|c| (c.clone(), c.get())).collect()
    }

    fn fallback(&self, cells: &[Cell<Self, u64>]) -> Vec<(Cell<Self, u64>, u64)> {
        cells.iter().map(|c| (c.clone(), c.get())).collect()
    }
}

fn max_pool() -> HandlerPool<MaxKey, u64> {
    HandlerPoolBuilder::new()
        .parallelism(4)
        .build(MaxUpdater)
        .expect("pool must build")
}

#[test]
fn intermediate_then_final() {
    let pool = purity_pool();
    let cell = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    cell.put_next(Purity::Pure).unwrap();
    assert_eq!(cell.get(), Purity::Pure);
    assert!(!cell.is_complete());

    cell.put_final(Purity::Impure).unwrap();
    assert_eq!(cell.get(), Purity::Impure);
    assert!(cell.is_complete());

    assert!(pool.quiescent_incomplete_cells().unwrap().is_empty());
    pool.shutdown();
}

#[test]
fn completed_cell_reads_back() {
    let pool = purity_pool();
    let cell = pool.create_completed_cell(PureKey, Purity::Pure);

    assert!(cell.is_complete());
    assert_eq!(cell.get(), Purity::Pure);

    // Re-finalizing with the same value is fine; advancing is not.
    cell.put_final(Purity::Pure).unwrap();
    assert_eq!(cell.put_final(Purity::Impure), Err(CellError::AlreadyFinal));
    assert_eq!(cell.put_next(Purity::Impure), Err(CellError::AlreadyFinal));
    // A join that cannot change the final value succeeds.
    cell.put_next(Purity::Bottom).unwrap();
    assert_eq!(cell.get(), Purity::Pure);
}

#[test]
fn when_complete_propagates_final_value() {
    let pool = purity_pool();
    let a = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    a.when_complete(&b, |value| Outcome::Final(*value));
    b.put_final(Purity::Impure).unwrap();

    assert!(pool.quiescent_incomplete_cells().unwrap().is_empty());
    assert!(a.is_complete());
    assert_eq!(a.get(), Purity::Impure);
}

#[test]
fn when_next_sees_intermediate_values() {
    let pool = purity_pool();
    let a = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    a.when_next(&b, |value| Outcome::Next(*value));
    b.put_next(Purity::Pure).unwrap();

    let incomplete = pool.quiescent_incomplete_cells().unwrap();
    assert_eq!(incomplete.len(), 2);
    assert_eq!(a.get(), Purity::Pure);
    assert!(!a.is_complete());
}

#[test]
fn duplicate_registration_is_observationally_idempotent() {
    let pool = purity_pool();
    let a = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    a.when_next(&b, |value| Outcome::Next(*value));
    a.when_next(&b, |value| Outcome::Next(*value));
    b.put_next(Purity::Impure).unwrap();

    pool.quiescent_incomplete_cells().unwrap();
    // The duplicate firing is absorbed by the join.
    assert_eq!(a.get(), Purity::Impure);
    assert_eq!(a.dependency_ids(), vec![b.id()]);
}

#[test]
fn fan_in_advances_every_dependent() {
    let pool = purity_pool();
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    let dependents: Vec<_> = (0..8)
        .map(|_| {
            let cell = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
            cell.when_next(&b, |value| Outcome::Next(*value));
            cell
        })
        .collect();

    b.put_next(Purity::Impure).unwrap();
    pool.quiescent_incomplete_cells().unwrap();

    for cell in &dependents {
        assert_eq!(cell.get(), Purity::Impure);
    }
}

#[test]
fn combined_callback_receives_final_flag() {
    let pool = purity_pool();
    let a = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    a.when(&b, |value, is_final| {
        if is_final {
            Outcome::Final(*value)
        } else {
            Outcome::NoUpdate
        }
    });
    b.put_next(Purity::Pure).unwrap();
    b.put_final(Purity::Impure).unwrap();

    assert!(pool.quiescent_incomplete_cells().unwrap().is_empty());
    assert!(a.is_complete());
    assert_eq!(a.get(), Purity::Impure);
}

#[test]
fn registration_on_final_dependee() {
    let pool = purity_pool();
    let done = pool.create_completed_cell(PureKey, Purity::Impure);

    // `when_complete` dispatches immediately against a final dependee.
    let a = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    a.when_complete(&done, |value| Outcome::Final(*value));

    // `when_next` is ignored against a final dependee.
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    b.when_next(&done, |value| Outcome::Next(*value));

    let incomplete = pool.quiescent_incomplete_cells().unwrap();
    assert!(a.is_complete());
    assert_eq!(a.get(), Purity::Impure);
    assert!(!b.is_complete());
    assert_eq!(b.get(), Purity::Bottom);
    assert_eq!(incomplete.len(), 1);
    assert!(b.dependency_ids().is_empty());
}

#[test]
fn init_runs_once_and_applies_its_outcome() {
    let pool = purity_pool();
    let runs = Arc::new(AtomicUsize::new(0));
    let cell = {
        let runs = Arc::clone(&runs);
        pool.create_cell(PureKey, move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Outcome::Next(Purity::Pure)
        })
    };

    cell.trigger();
    cell.trigger();
    pool.trigger_execution(&cell);

    pool.quiescent_incomplete_cells().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(cell.get(), Purity::Pure);
    assert!(!cell.is_complete());
}

#[test]
fn init_can_finalize_its_cell() {
    let pool = purity_pool();
    let cell = pool.create_cell(PureKey, |_| Outcome::Final(Purity::Impure));
    cell.trigger();

    assert!(pool.quiescent_incomplete_cells().unwrap().is_empty());
    assert!(cell.is_complete());
    assert_eq!(cell.get(), Purity::Impure);
}

#[test]
fn fallback_resolves_untriggered_cell() {
    let pool = purity_pool();
    let cell = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    pool.quiescent_resolve_defaults().unwrap();
    assert!(pool.quiescent_incomplete_cells().unwrap().is_empty());
    assert!(cell.is_complete());
    assert_eq!(cell.get(), Purity::Pure);
}

#[test]
fn callback_panic_is_routed_to_the_hook() {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let pool: HandlerPool<PureKey, Purity> = {
        let failures = Arc::clone(&failures);
        HandlerPoolBuilder::new()
            .parallelism(2)
            .unhandled_failure(move |failure| {
                failures
                    .lock()
                    .unwrap()
                    .push(failure.panic_message().unwrap_or("<non-panic>").to_owned());
            })
            .build(PurityUpdater)
            .expect("pool must build")
    };

    let a = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    let b = pool.create_cell(PureKey, |_| Outcome::NoUpdate);
    a.when_next(&b, |_| -> Outcome<Purity> { panic!("callback boom") });
    b.put_next(Purity::Pure).unwrap();

    // The pool still quiesces and the dependent stays incomplete.
    let incomplete = pool.quiescent_incomplete_cells().unwrap();
    assert_eq!(incomplete.len(), 2);
    assert!(!a.is_complete());
    assert_eq!(a.get(), Purity::Bottom);
    assert_eq!(*failures.lock().unwrap(), vec!["callback boom".to_owned()]);
}

#[test]
fn non_monotonic_update_is_rejected() {
    let pool: HandlerPool<PureKey, Purity> = HandlerPoolBuilder::new()
        .parallelism(2)
        .build(StrictPurityUpdater)
        .expect("pool must build");
    let cell = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    cell.put_next(Purity::Impure).unwrap();
    assert_eq!(cell.put_next(Purity::Pure), Err(CellError::NotMonotonic));
    assert_eq!(cell.get(), Purity::Impure);
}

#[test]
fn ignore_if_final_drops_late_updates() {
    let pool: HandlerPool<PureKey, Purity> = HandlerPoolBuilder::new()
        .parallelism(2)
        .build(IgnoreFinalUpdater)
        .expect("pool must build");
    let cell = pool.create_cell(PureKey, |_| Outcome::NoUpdate);

    cell.put_final(Purity::Pure).unwrap();
    cell.put_next(Purity::Impure).unwrap();
    cell.put_final(Purity::Impure).unwrap();
    assert_eq!(cell.get(), Purity::Pure);
}

#[test]
fn on_quiescent_fires_immediately_when_idle() {
    let pool = purity_pool();
    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = Arc::clone(&fired);
        pool.on_quiescent(move || fired.store(true, Ordering::SeqCst))
            .unwrap();
    }
    // Synchronize on the handler having run.
    pool.quiescent_incomplete_cells().unwrap();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn shutdown_rejects_new_registrations() {
    let pool = purity_pool();
    pool.shutdown();
    assert!(matches!(
        pool.on_quiescent(|| {}),
        Err(cellpool::PoolError::ShutdownInProgress)
    ));
}

#[test]
fn concurrent_joins_converge_to_the_join_of_all_updates() {
    let pool = max_pool();
    let cell = pool.create_cell(MaxKey, |_| Outcome::NoUpdate);

    std::thread::scope(|scope| {
        for worker in 0..8_u64 {
            let cell = cell.clone();
            scope.spawn(move || {
                for step in 0..100_u64 {
                    // Duplicates and out-of-order joins on purpose.
                    cell.put_next(worker * 100 + step % 97).unwrap();
                    cell.put_next(step).unwrap();
                }
            });
        }
    });

    pool.quiescent_incomplete_cells().unwrap();
    // Largest join: worker 7, step 96 (96 is the largest residue mod 97).
    assert_eq!(cell.get(), 7 * 100 + 96);
}

#[test]
fn sequential_callbacks_never_overlap() {
    let pool = max_pool();
    let dependent = pool.create_cell(MaxKey, |_| Outcome::NoUpdate);
    let dependee = pool.create_cell(MaxKey, |_| Outcome::NoUpdate);

    let in_body = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let in_body = Arc::clone(&in_body);
        let overlapped = Arc::clone(&overlapped);
        let observed = Arc::clone(&observed);
        dependent.when_next_sequential(&dependee, move |value| {
            if in_body.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            observed.lock().unwrap().push(*value);
            std::thread::sleep(Duration::from_micros(50));
            in_body.fetch_sub(1, Ordering::SeqCst);
            Outcome::NoUpdate
        });
    }

    std::thread::scope(|scope| {
        for worker in 0..4_u64 {
            let dependee = dependee.clone();
            scope.spawn(move || {
                for step in 0..25_u64 {
                    dependee.put_next(worker * 25 + step + 1).unwrap();
                }
            });
        }
    });

    pool.quiescent_incomplete_cells().unwrap();
    assert!(!overlapped.load(Ordering::SeqCst));

    let observed = observed.lock().unwrap();
    assert!(!observed.is_empty());
    // Bodies are serialized, so each one reads a value at least as large as
    // the previous body's read.
    assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
}
