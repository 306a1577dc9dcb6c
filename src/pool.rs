use crate::{
    callback::{apply_outcome, Job},
    cell::Cell,
    error::{CallbackFailure, PoolError},
    key::Key,
    lattice::{LatticeValue, Updater},
    outcome::Outcome,
    scc::closed_sccs,
    types::{CellId, HashSet, IndexMap},
};
use core::sync::atomic::AtomicU64;
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tracing::{debug, error};

/// Hook invoked for failures raised inside pool tasks.
pub type FailureHook = Arc<dyn Fn(CallbackFailure) + Send + Sync + 'static>;

const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Configuration for a [`HandlerPool`].
///
/// ```ignore
/// let pool: HandlerPool<MyKey, MyValue> = HandlerPoolBuilder::new()
///     .parallelism(8)
///     .unhandled_failure(|failure| eprintln!("{failure:?}"))
///     .build(MyUpdater)?;
/// ```
#[must_use]
pub struct HandlerPoolBuilder {
    parallelism: Option<usize>,
    pass_timeout: Duration,
    failure_hook: Option<FailureHook>,
}

impl Default for HandlerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerPoolBuilder {
    /// Start from the defaults: hardware parallelism, a 15 minute resolve
    /// pass bound, and a failure hook that logs.
    pub fn new() -> Self {
        Self {
            parallelism: None,
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            failure_hook: None,
        }
    }

    /// Number of worker threads. Defaults to the number of hardware threads.
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers.max(1));
        self
    }

    /// Per-pass wait bound for the `while_quiescent_*` resolution loops.
    pub fn pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    /// Hook receiving callback panics and rejected outcomes. The default
    /// hook logs at error level.
    pub fn unhandled_failure(
        mut self,
        hook: impl Fn(CallbackFailure) + Send + Sync + 'static,
    ) -> Self {
        self.failure_hook = Some(Arc::new(hook));
        self
    }

    /// Build the pool around the user-supplied updater.
    ///
    /// # Errors
    /// [`PoolError::ThreadPool`] if the worker threads cannot be spawned.
    pub fn build<K, V>(self, updater: impl Updater<V>) -> Result<HandlerPool<K, V>, PoolError>
    where
        K: Key<V>,
        V: LatticeValue,
    {
        let workers = self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(core::num::NonZeroUsize::get)
                .unwrap_or(8)
        });
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|worker| format!("cellpool-{worker}"))
            .build()?;
        let failure_hook = self
            .failure_hook
            .unwrap_or_else(|| Arc::new(default_failure_hook));
        let inner = Arc::new_cyclic(|self_ref| PoolInner {
            self_ref: Weak::clone(self_ref),
            threads,
            state: Mutex::new(PoolState::default()),
            drained: Condvar::new(),
            updater: Arc::new(updater),
            cells_not_done: Mutex::new(IndexMap::default()),
            next_cell_id: AtomicU64::new(1),
            failure_hook,
            pass_timeout: self.pass_timeout,
        });
        Ok(HandlerPool { inner })
    }
}

fn default_failure_hook(failure: CallbackFailure) {
    error!(?failure, "unhandled callback failure");
}

#[derive(Default)]
struct PoolState {
    /// Tasks submitted and not yet finished. Zero means quiescent.
    active: usize,
    /// Handlers to re-submit as fresh tasks on the next zero edge.
    handlers: Vec<Job>,
    shutdown: bool,
}

/// Concurrent fixed-point engine: creates cells, schedules their callbacks on
/// a work-stealing pool, detects quiescence, and drives cycle/fallback
/// resolution of the cells that remain non-final.
///
/// Cheap to clone; all clones share one pool. Multiple pools may coexist in
/// one process, each with an independent lifecycle.
pub struct HandlerPool<K, V> {
    inner: Arc<PoolInner<K, V>>,
}

impl<K, V> Clone for HandlerPool<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<K, V> {
    /// Back-reference to the owning `Arc`, for handing tasks an owned handle.
    self_ref: Weak<PoolInner<K, V>>,
    threads: rayon::ThreadPool,
    state: Mutex<PoolState>,
    /// Signalled on every quiescence edge; `shutdown` blocks on it.
    drained: Condvar,
    pub(crate) updater: Arc<dyn Updater<V>>,
    pub(crate) cells_not_done: Mutex<IndexMap<CellId, Cell<K, V>>>,
    next_cell_id: AtomicU64,
    failure_hook: FailureHook,
    pass_timeout: Duration,
}

impl<K, V> HandlerPool<K, V>
where
    K: Key<V>,
    V: LatticeValue,
{
    /// Build a pool with all-default configuration.
    ///
    /// # Errors
    /// [`PoolError::ThreadPool`] if the worker threads cannot be spawned.
    pub fn new(updater: impl Updater<V>) -> Result<Self, PoolError> {
        Self::builder().build(updater)
    }

    /// Start configuring a pool.
    pub fn builder() -> HandlerPoolBuilder {
        HandlerPoolBuilder::new()
    }

    /// Register a new cell whose `init` runs on first trigger.
    ///
    /// The cell starts at the updater's bottom and is tracked in the pool's
    /// not-done set until finalized.
    pub fn create_cell<F>(&self, key: K, init: F) -> Cell<K, V>
    where
        F: FnOnce(&Cell<K, V>) -> Outcome<V> + Send + 'static,
    {
        let id = CellId::fresh(&self.inner.next_cell_id);
        let cell = Cell::new_incomplete(
            id,
            key,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.updater),
            Box::new(init),
        );
        self.inner.cells_not_done.lock().insert(id, cell.clone());
        cell
    }

    /// Shortcut for a cell that is final from the start.
    pub fn create_completed_cell(&self, key: K, value: V) -> Cell<K, V> {
        Cell::new_completed(
            CellId::fresh(&self.inner.next_cell_id),
            key,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.updater),
            value,
        )
    }

    /// Ensure `cell`'s `init` is scheduled; at most once per cell.
    pub fn trigger_execution(&self, cell: &Cell<K, V>) {
        self.inner.trigger_cell(cell);
    }

    /// Register a handler to run exactly once when the pool next has no
    /// tasks in flight. A pool that is already quiescent dispatches the
    /// handler immediately. Handlers run as pool tasks, so work they submit
    /// is counted and later handlers observe it.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn on_quiescent<F>(&self, handler: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.on_quiescent(Box::new(handler))
    }

    /// Block until the next quiescence boundary and return the cells that
    /// are still non-final there.
    ///
    /// Must be called from outside the pool's own workers.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn quiescent_incomplete_cells(&self) -> Result<Vec<Cell<K, V>>, PoolError> {
        self.await_quiescent(|inner| {
            inner
                .cells_not_done
                .lock()
                .values()
                .cloned()
                .collect::<Vec<_>>()
        })
    }

    /// At the next quiescence, find closed SCCs among the non-final cells
    /// and resolve each with its head cell's key. Returns once the pass has
    /// been applied; follow-up callback cascades settle asynchronously.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn quiescent_resolve_cycles(&self) -> Result<(), PoolError> {
        self.await_quiescent(|inner| inner.run_resolution_pass(true, false))
    }

    /// At the next quiescence, resolve the dependency-free non-final cells
    /// with their keys' fallback policies.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn quiescent_resolve_defaults(&self) -> Result<(), PoolError> {
        self.await_quiescent(|inner| inner.run_resolution_pass(false, true))
    }

    /// At the next quiescence, run one full resolution pass: closed-SCC
    /// resolution followed by fallback for the remaining dependency-free
    /// cells.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn quiescent_resolve_cell(&self) -> Result<(), PoolError> {
        self.await_quiescent(|inner| inner.run_resolution_pass(true, true))
    }

    /// Repeat full resolution passes at successive quiescence boundaries
    /// until every cell is final or a pass stops making progress. Each wait
    /// is bounded by the configured pass timeout; on timeout the loop stops
    /// and cells keep their current state.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn while_quiescent_resolve_cell(&self) -> Result<(), PoolError> {
        self.resolve_until_settled(true, true)
    }

    /// [`while_quiescent_resolve_cell`](Self::while_quiescent_resolve_cell)
    /// restricted to fallback resolution.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after `shutdown` was initiated.
    pub fn while_quiescent_resolve_default(&self) -> Result<(), PoolError> {
        self.resolve_until_settled(false, true)
    }

    /// Orderly shutdown: no new submissions are accepted and the calling
    /// thread blocks until in-flight tasks have drained.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        while state.active > 0 {
            self.inner.drained.wait(&mut state);
        }
    }

    fn resolve_until_settled(&self, cycles: bool, defaults: bool) -> Result<(), PoolError> {
        let timeout = self.inner.pass_timeout;
        let mut previous = usize::MAX;
        loop {
            let Some(remaining) =
                self.await_quiescent_timeout(timeout, |inner| inner.cells_not_done.lock().len())?
            else {
                return Ok(());
            };
            if remaining == 0 || remaining >= previous {
                return Ok(());
            }
            previous = remaining;
            let pass = self.await_quiescent_timeout(timeout, move |inner| {
                inner.run_resolution_pass(cycles, defaults);
            })?;
            if pass.is_none() {
                return Ok(());
            }
        }
    }

    fn await_quiescent<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<PoolInner<K, V>>) -> T + Send + 'static,
    {
        let gate = Arc::new((Mutex::new(None::<T>), Condvar::new()));
        self.register_gate(&gate, f)?;
        let mut slot = gate.0.lock();
        while slot.is_none() {
            gate.1.wait(&mut slot);
        }
        Ok(slot
            .take()
            .expect("HandlerPool::await_quiescent: slot must be filled"))
    }

    fn await_quiescent_timeout<T, F>(&self, timeout: Duration, f: F) -> Result<Option<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<PoolInner<K, V>>) -> T + Send + 'static,
    {
        let gate = Arc::new((Mutex::new(None::<T>), Condvar::new()));
        self.register_gate(&gate, f)?;
        let deadline = Instant::now() + timeout;
        let mut slot = gate.0.lock();
        while slot.is_none() {
            if gate.1.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        Ok(slot.take())
    }

    fn register_gate<T, F>(
        &self,
        gate: &Arc<(Mutex<Option<T>>, Condvar)>,
        f: F,
    ) -> Result<(), PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<PoolInner<K, V>>) -> T + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let gate = Arc::clone(gate);
        self.inner.on_quiescent(Box::new(move || {
            let value = f(&inner);
            *gate.0.lock() = Some(value);
            gate.1.notify_all();
        }))
    }
}

impl<K, V> PoolInner<K, V>
where
    K: Key<V>,
    V: LatticeValue,
{
    /// Owned handle to this pool, for moving into task closures.
    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("PoolInner::arc: reached through a live Arc")
    }

    /// Submit a counted task.
    ///
    /// # Errors
    /// [`PoolError::ShutdownInProgress`] after shutdown was initiated.
    pub(crate) fn submit(&self, job: Job) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(PoolError::ShutdownInProgress);
            }
            state.active += 1;
        }
        self.spawn_raw(job);
        Ok(())
    }

    /// Spawn an already-counted task onto the worker pool.
    fn spawn_raw(&self, job: Job) {
        let inner = self.arc();
        self.threads.spawn(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                inner.report_failure(CallbackFailure::Panicked(payload));
            }
            inner.task_finished();
        });
    }

    /// Decrement the task counter; on the zero edge, re-submit every pending
    /// quiescence handler as a fresh task (so handler-submitted work is
    /// counted), or signal full drain if there are none.
    fn task_finished(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active != 0 {
            return;
        }
        let handlers = core::mem::take(&mut state.handlers);
        if handlers.is_empty() {
            debug!("pool reached quiescence");
            self.drained.notify_all();
        } else {
            debug!(handlers = handlers.len(), "pool reached quiescence; dispatching handlers");
            for handler in handlers {
                state.active += 1;
                self.spawn_raw(handler);
            }
        }
    }

    pub(crate) fn on_quiescent(&self, handler: Job) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(PoolError::ShutdownInProgress);
        }
        if state.active == 0 {
            state.active += 1;
            self.spawn_raw(handler);
        } else {
            state.handlers.push(handler);
        }
        Ok(())
    }

    pub(crate) fn report_failure(&self, failure: CallbackFailure) {
        let hook = Arc::clone(&self.failure_hook);
        if catch_unwind(AssertUnwindSafe(|| hook(failure))).is_err() {
            error!("unhandled-failure hook panicked");
        }
    }

    pub(crate) fn deregister_cell(&self, id: CellId) {
        self.cells_not_done.lock().shift_remove(&id);
    }

    /// Schedule `cell`'s `init` as a task; the one-shot flag makes repeated
    /// triggers no-ops.
    pub(crate) fn trigger_cell(&self, cell: &Cell<K, V>) {
        use core::sync::atomic::Ordering;
        if cell.inner().init_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let cell_id = cell.id();
        let cell = cell.clone();
        let pool = self.arc();
        let submitted = self.submit(Box::new(move || {
            let Some(init) = cell.take_init() else {
                return;
            };
            match catch_unwind(AssertUnwindSafe(|| init(&cell))) {
                Err(payload) => pool.report_failure(CallbackFailure::Panicked(payload)),
                Ok(outcome) => apply_outcome(&pool, &cell, outcome),
            }
        }));
        if submitted.is_err() {
            tracing::trace!(cell = %cell_id, "init dropped: pool is shutting down");
        }
    }

    /// One resolution pass over the quiescent snapshot of non-final cells:
    /// closed SCCs first (when `cycles`), then fallback for the cells that
    /// survived and have no dependencies (when `defaults`).
    ///
    /// Runs inside a quiescence handler task, so the snapshot's edge set is
    /// consistent: nothing else is in flight.
    fn run_resolution_pass(&self, cycles: bool, defaults: bool) {
        let snapshot = self.cells_not_done.lock().clone();
        // The edge set is captured once, before any resolution mutates it;
        // both the SCC search and the dependency-free check below must see
        // the same quiescent graph.
        let edges: IndexMap<CellId, Vec<CellId>> = snapshot
            .iter()
            .map(|(id, cell)| (*id, cell.dependency_ids()))
            .collect();
        let mut attempted: HashSet<CellId> = HashSet::default();
        let mut scc_count = 0_usize;

        if cycles {
            let ids: Vec<CellId> = snapshot.keys().copied().collect();
            let components = closed_sccs(&ids, |id| {
                edges.get(&id).cloned().unwrap_or_default()
            });
            scc_count = components.len();
            for component in components {
                attempted.extend(component.iter().copied());
                let members: Vec<Cell<K, V>> = component
                    .iter()
                    .map(|id| snapshot[id].clone())
                    .collect();
                let head = members
                    .first()
                    .expect("run_resolution_pass: components are non-empty");
                let assignments = catch_unwind(AssertUnwindSafe(|| head.key().resolve(&members)));
                self.apply_assignments(assignments);
            }
        }

        let mut fallback_count = 0_usize;
        if defaults {
            for (id, cell) in &snapshot {
                if attempted.contains(id) || cell.is_complete() {
                    continue;
                }
                if edges.get(id).is_some_and(|deps| !deps.is_empty()) {
                    continue;
                }
                fallback_count += 1;
                let group = [cell.clone()];
                let assignments = catch_unwind(AssertUnwindSafe(|| cell.key().fallback(&group)));
                self.apply_assignments(assignments);
            }
        }

        debug!(
            cells = snapshot.len(),
            closed_sccs = scc_count,
            fallbacks = fallback_count,
            "resolution pass"
        );
    }

    #[allow(clippy::type_complexity)]
    fn apply_assignments(
        &self,
        assignments: Result<Vec<(Cell<K, V>, V)>, Box<dyn Any + Send>>,
    ) {
        match assignments {
            Err(payload) => self.report_failure(CallbackFailure::Panicked(payload)),
            Ok(assignments) => {
                for (cell, value) in assignments {
                    if let Err(err) = cell.resolve_with_value(value) {
                        self.report_failure(CallbackFailure::Rejected(err));
                    }
                }
            }
        }
    }
}
