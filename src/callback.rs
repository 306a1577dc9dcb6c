use crate::{
    cell::{Cell, CellInner},
    error::CallbackFailure,
    key::Key,
    lattice::LatticeValue,
    outcome::Outcome,
    pool::PoolInner,
    sync::{AtomicBool, Mutex, Ordering},
};
use derive_more::Debug;
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
};

/// A unit of work submitted to the pool.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// User callback body: receives the dependee's current value and whether that
/// value is final.
pub(crate) type CallbackFn<V> = Arc<dyn Fn(&V, bool) -> Outcome<V> + Send + Sync + 'static>;

/// Which dependee events a registration reacts to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CallbackKind {
    /// Fire on every value advance (and once more, final-flagged, at
    /// finalization).
    Next,
    /// Fire exactly once, at finalization.
    Complete,
    /// `Next` placement, but dispatched immediately when registered against
    /// an already-final dependee.
    Combined,
}

/// How callback bodies for one dependent cell are interleaved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    /// Any worker, any interleaving.
    Concurrent,
    /// Serialized per dependent cell, in submission order.
    Sequential,
}

/// One registered callback, stored in the dependee's outgoing callback maps
/// keyed by the dependent's id.
///
/// The back-edge to the dependent is weak so a finalized (or dropped)
/// dependent never keeps stale records alive; firing such a record is a
/// silent no-op.
#[derive(Debug)]
pub(crate) struct CallbackRecord<K, V> {
    #[debug(skip)]
    pub(crate) dependent: Weak<CellInner<K, V>>,
    #[debug(skip)]
    pub(crate) run: CallbackFn<V>,
    pub(crate) mode: DispatchMode,
}

impl<K, V> Clone for CallbackRecord<K, V> {
    fn clone(&self) -> Self {
        Self {
            dependent: Weak::clone(&self.dependent),
            run: Arc::clone(&self.run),
            mode: self.mode,
        }
    }
}

impl<K, V> CallbackRecord<K, V>
where
    K: Key<V>,
    V: LatticeValue,
{
    /// Schedule this record against an advance (or finalization) of
    /// `dependee`, honoring the dispatch mode.
    pub(crate) fn schedule(&self, pool: &Arc<PoolInner<K, V>>, dependee: Cell<K, V>) {
        let record = self.clone();
        let task_pool = Arc::clone(pool);
        let job: Job = Box::new(move || record.fire(&task_pool, &dependee));
        match self.mode {
            DispatchMode::Concurrent => {
                if pool.submit(job).is_err() {
                    tracing::trace!("callback dropped: pool is shutting down");
                }
            }
            DispatchMode::Sequential => {
                let Some(dependent) = self.dependent.upgrade() else {
                    return;
                };
                let submit_pool = Arc::clone(pool);
                SequentialDispatcher::enqueue(&dependent.sequencer, job, move |drain| {
                    if submit_pool.submit(drain).is_err() {
                        tracing::trace!("sequential drain dropped: pool is shutting down");
                    }
                });
            }
        }
    }

    /// Run the user callback against the dependee's current value and apply
    /// the outcome to the dependent.
    ///
    /// The dependee is re-read at run time, so a spuriously scheduled record
    /// observes the latest value; the lattice join absorbs duplicates.
    fn fire(&self, pool: &Arc<PoolInner<K, V>>, dependee: &Cell<K, V>) {
        let Some(dependent) = self.dependent.upgrade() else {
            return;
        };
        let dependent = Cell::from_inner(dependent);
        if dependent.is_complete() {
            return;
        }
        let (value, is_final) = dependee.snapshot();
        match catch_unwind(AssertUnwindSafe(|| (self.run)(&value, is_final))) {
            Err(payload) => pool.report_failure(CallbackFailure::Panicked(payload)),
            Ok(outcome) => apply_outcome(pool, &dependent, outcome),
        }
    }
}

/// Apply a callback or `init` outcome to its cell, routing rejections to the
/// pool's failure hook.
pub(crate) fn apply_outcome<K, V>(pool: &Arc<PoolInner<K, V>>, cell: &Cell<K, V>, outcome: Outcome<V>)
where
    K: Key<V>,
    V: LatticeValue,
{
    let applied = match outcome {
        Outcome::Final(value) => cell.put_final(value),
        Outcome::Next(value) => cell.put_next(value),
        Outcome::NoUpdate => Ok(()),
    };
    if let Err(err) = applied {
        pool.report_failure(CallbackFailure::Rejected(err));
    }
}

/// Per-dependent serial execution token.
///
/// Sequential callbacks acquire the token before running; if it is taken they
/// park in the FIFO queue and the current holder drains them. At most one
/// body is active per dependent cell, and bodies run in submission order.
pub(crate) struct SequentialDispatcher {
    running: AtomicBool,
    queue: Mutex<VecDeque<Job>>,
}

impl SequentialDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue `job` and, if the token is free, launch a drain through
    /// `submit`. Exactly one drain holds the token at a time.
    pub(crate) fn enqueue(this: &Arc<Self>, job: Job, submit: impl FnOnce(Job)) {
        this.queue.lock().push_back(job);
        if this.try_acquire() {
            let dispatcher = Arc::clone(this);
            submit(Box::new(move || dispatcher.drain()));
        }
    }

    fn try_acquire(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn drain(&self) {
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => job(),
                None => {
                    self.running.store(false, Ordering::Release);
                    // A job pushed between the empty pop and the release is
                    // picked up here, either by re-acquiring the token or by
                    // the enqueuer's freshly submitted drain.
                    if self.queue.lock().is_empty() || !self.try_acquire() {
                        return;
                    }
                }
            }
        }
    }
}
