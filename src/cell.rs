use crate::{
    callback::{CallbackFn, CallbackKind, CallbackRecord, DispatchMode, SequentialDispatcher},
    error::CellError,
    key::Key,
    lattice::{LatticeValue, Updater},
    outcome::Outcome,
    pool::PoolInner,
    types::{CellId, IndexMap, IndexSet},
};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use derive_more::Debug;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A cell's `init` function, run at most once on first trigger.
pub(crate) type InitFn<K, V> = Box<dyn FnOnce(&Cell<K, V>) -> Outcome<V> + Send + 'static>;

/// Handle to a monotonically growing value in a lattice.
///
/// Cells are created by a [`HandlerPool`](crate::pool::HandlerPool) and are
/// cheap to clone; all clones refer to the same underlying state. A cell's
/// value only ever grows under the pool's updater until the cell is
/// finalized, after which it is immutable.
pub struct Cell<K, V> {
    inner: Arc<CellInner<K, V>>,
}

impl<K, V> Clone for Cell<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> PartialEq for Cell<K, V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<K, V> Eq for Cell<K, V> {}

impl<K, V> core::hash::Hash for Cell<K, V> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<K, V> fmt::Debug for Cell<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("complete", &self.inner.completed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct CellInner<K, V> {
    pub(crate) id: CellId,
    pub(crate) key: K,
    #[debug(skip)]
    pub(crate) pool: Weak<PoolInner<K, V>>,
    #[debug(skip)]
    pub(crate) updater: Arc<dyn Updater<V>>,
    pub(crate) state: Mutex<CellState<K, V>>,
    pub(crate) completed: AtomicBool,
    pub(crate) init_started: AtomicBool,
    #[debug(skip)]
    pub(crate) sequencer: Arc<SequentialDispatcher>,
}

#[derive(Debug)]
pub(crate) enum CellState<K, V> {
    Incomplete(Incomplete<K, V>),
    Final(V),
}

/// Mutable record of a not-yet-final cell.
///
/// `next_deps`/`complete_deps` hold strong handles to the dependees this cell
/// listens to; the reverse direction (this cell's listeners) lives in the
/// callback maps, keyed by the dependent's id, with weak back-edges inside
/// the records.
#[derive(Debug)]
pub(crate) struct Incomplete<K, V> {
    pub(crate) value: V,
    #[debug(skip)]
    pub(crate) init: Option<InitFn<K, V>>,
    pub(crate) next_deps: IndexMap<CellId, Cell<K, V>>,
    pub(crate) complete_deps: IndexMap<CellId, Cell<K, V>>,
    pub(crate) next_callbacks: IndexMap<CellId, Vec<CallbackRecord<K, V>>>,
    pub(crate) complete_callbacks: IndexMap<CellId, Vec<CallbackRecord<K, V>>>,
}

impl<K, V> Incomplete<K, V> {
    fn new(value: V, init: InitFn<K, V>) -> Self {
        Self {
            value,
            init: Some(init),
            next_deps: IndexMap::default(),
            complete_deps: IndexMap::default(),
            next_callbacks: IndexMap::default(),
            complete_callbacks: IndexMap::default(),
        }
    }

    /// Prune records whose dependent is gone, then clone the surviving
    /// next-records for firing.
    fn collect_next_records(&mut self) -> Vec<CallbackRecord<K, V>> {
        self.next_callbacks.retain(|_, records| {
            records.retain(|record| record.dependent.strong_count() > 0);
            !records.is_empty()
        });
        self.next_callbacks.values().flatten().cloned().collect()
    }
}

#[derive(Copy, Clone)]
enum PutMode {
    Next,
    Final,
    /// Like `Final`, but a no-op on an already-final cell (pool resolution).
    Resolve,
}

impl<K, V> Cell<K, V>
where
    K: Key<V>,
    V: LatticeValue,
{
    pub(crate) fn new_incomplete(
        id: CellId,
        key: K,
        pool: Weak<PoolInner<K, V>>,
        updater: Arc<dyn Updater<V>>,
        init: InitFn<K, V>,
    ) -> Self {
        let bottom = updater.bottom();
        Self {
            inner: Arc::new(CellInner {
                id,
                key,
                pool,
                updater,
                state: Mutex::new(CellState::Incomplete(Incomplete::new(bottom, init))),
                completed: AtomicBool::new(false),
                init_started: AtomicBool::new(false),
                sequencer: Arc::new(SequentialDispatcher::new()),
            }),
        }
    }

    pub(crate) fn new_completed(
        id: CellId,
        key: K,
        pool: Weak<PoolInner<K, V>>,
        updater: Arc<dyn Updater<V>>,
        value: V,
    ) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id,
                key,
                pool,
                updater,
                state: Mutex::new(CellState::Final(value)),
                completed: AtomicBool::new(true),
                init_started: AtomicBool::new(true),
                sequencer: Arc::new(SequentialDispatcher::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<CellInner<K, V>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<CellInner<K, V>> {
        &self.inner
    }

    /// This cell's pool-unique id.
    #[must_use]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// The resolution key attached to this cell.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// The current value.
    ///
    /// Outside quiescence the result is a non-deterministic intermediate
    /// join; at quiescence it is the deterministic fixed-point value.
    #[must_use]
    pub fn get(&self) -> V {
        match &*self.inner.state.lock() {
            CellState::Incomplete(state) => state.value.clone(),
            CellState::Final(value) => value.clone(),
        }
    }

    /// `true` once the cell is finalized. Final cells never change again.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Current value together with its finality flag, read atomically.
    pub(crate) fn snapshot(&self) -> (V, bool) {
        match &*self.inner.state.lock() {
            CellState::Incomplete(state) => (state.value.clone(), false),
            CellState::Final(value) => (value.clone(), true),
        }
    }

    /// Ids of the cells this cell currently listens to (both kinds, deduped).
    ///
    /// Final cells listen to nothing. Dependees are dropped from the sets
    /// when they finalize, so outside of races this only names incomplete
    /// cells; the pool snapshots it at quiescence as the SCC edge set.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<CellId> {
        match &*self.inner.state.lock() {
            CellState::Incomplete(state) => state
                .next_deps
                .keys()
                .chain(state.complete_deps.keys())
                .copied()
                .collect::<IndexSet<CellId>>()
                .into_iter()
                .collect(),
            CellState::Final(_) => Vec::new(),
        }
    }

    /// Request that this cell's `init` function be scheduled. Idempotent.
    pub fn trigger(&self) {
        if let Some(pool) = self.inner.pool.upgrade() {
            pool.trigger_cell(self);
        }
    }

    pub(crate) fn take_init(&self) -> Option<InitFn<K, V>> {
        match &mut *self.inner.state.lock() {
            CellState::Incomplete(state) => state.init.take(),
            CellState::Final(_) => None,
        }
    }

    /// Join `value` into the cell's current value.
    ///
    /// A successful strict advance schedules every registered next-callback.
    /// Joining a value that does not change the current one is a no-op.
    ///
    /// # Errors
    /// [`CellError::AlreadyFinal`] if the cell is final and `value` would
    /// change the finalized value (unless the updater ignores updates on
    /// final cells); [`CellError::NotMonotonic`] if the updater rejects the
    /// join.
    pub fn put_next(&self, value: V) -> Result<(), CellError> {
        self.advance(value, PutMode::Next)
    }

    /// Join `value` and finalize the cell.
    ///
    /// On the transition both callback maps are drained and fired with the
    /// final value, the cell stops listening to its dependees, and it is
    /// deregistered from the pool's not-done set.
    ///
    /// # Errors
    /// [`CellError::AlreadyFinal`] if the cell is already final with an
    /// incompatible value; [`CellError::NotMonotonic`] if the updater rejects
    /// the join.
    pub fn put_final(&self, value: V) -> Result<(), CellError> {
        self.advance(value, PutMode::Final)
    }

    /// Force finalization with `value`, used by the pool during cycle and
    /// fallback resolution. Acts only on non-final cells; a cell that became
    /// final in the meantime is left untouched.
    ///
    /// # Errors
    /// [`CellError::NotMonotonic`] if the updater rejects the join against
    /// the current value.
    pub fn resolve_with_value(&self, value: V) -> Result<(), CellError> {
        self.advance(value, PutMode::Resolve)
    }

    fn advance(&self, incoming: V, mode: PutMode) -> Result<(), CellError> {
        let pool = self.inner.pool.upgrade();
        let mut guard = self.inner.state.lock();

        if let CellState::Final(current) = &*guard {
            return match mode {
                PutMode::Resolve => Ok(()),
                PutMode::Next | PutMode::Final => {
                    if self.inner.updater.ignore_if_final() {
                        return Ok(());
                    }
                    let joined = self.inner.updater.update(current, incoming)?;
                    if joined == *current {
                        Ok(())
                    } else {
                        Err(CellError::AlreadyFinal)
                    }
                }
            };
        }

        let (joined, changed) = {
            let CellState::Incomplete(state) = &*guard else {
                unreachable!("Cell::advance: state checked incomplete above");
            };
            let joined = self.inner.updater.update(&state.value, incoming)?;
            let changed = joined != state.value;
            (joined, changed)
        };

        match mode {
            PutMode::Next => {
                if !changed {
                    return Ok(());
                }
                let records = {
                    let CellState::Incomplete(state) = &mut *guard else {
                        unreachable!("Cell::advance: state checked incomplete above");
                    };
                    state.value = joined;
                    state.collect_next_records()
                };
                drop(guard);
                if let Some(pool) = pool {
                    for record in records {
                        record.schedule(&pool, self.clone());
                    }
                }
                Ok(())
            }
            PutMode::Final | PutMode::Resolve => {
                let previous = core::mem::replace(&mut *guard, CellState::Final(joined));
                let CellState::Incomplete(state) = previous else {
                    unreachable!("Cell::advance: state checked incomplete above");
                };
                self.inner.completed.store(true, Ordering::Release);
                drop(guard);
                self.after_finalize(state, pool);
                Ok(())
            }
        }
    }

    /// Post-finalization bookkeeping, run with no lock held.
    fn after_finalize(&self, state: Incomplete<K, V>, pool: Option<Arc<PoolInner<K, V>>>) {
        let Incomplete {
            value: _,
            init: _,
            next_deps,
            complete_deps,
            next_callbacks,
            complete_callbacks,
        } = state;

        // Every listener sees the final value: complete-records fire their
        // one shot, next-records fire once more, final-flagged.
        let records: Vec<CallbackRecord<K, V>> = complete_callbacks
            .values()
            .flatten()
            .chain(next_callbacks.values().flatten())
            .cloned()
            .collect();
        for record in &records {
            if let Some(dependent) = record.dependent.upgrade() {
                dependent.remove_dependee(self.inner.id);
            }
        }
        if let Some(pool) = &pool {
            for record in &records {
                record.schedule(pool, self.clone());
            }
        }

        // This cell no longer listens to anything.
        for dependee in next_deps.values().chain(complete_deps.values()) {
            dependee.inner.remove_listener(self.inner.id);
        }

        if let Some(pool) = &pool {
            pool.deregister_cell(self.inner.id);
        }
        tracing::trace!(cell = %self.inner.id, "cell finalized");
    }

    /// Register a callback on every advance of `dependee`.
    ///
    /// The callback receives intermediate values as `dependee` grows and the
    /// final value once `dependee` is finalized; its outcome is applied to
    /// this cell. Registering against an already-final dependee is ignored.
    pub fn when_next<F>(&self, dependee: &Cell<K, V>, callback: F)
    where
        F: Fn(&V) -> Outcome<V> + Send + Sync + 'static,
    {
        self.register(
            dependee,
            CallbackKind::Next,
            DispatchMode::Concurrent,
            Arc::new(move |value: &V, _| callback(value)),
        );
    }

    /// [`when_next`](Self::when_next) with the callback body serialized per
    /// dependent cell, in submission order.
    pub fn when_next_sequential<F>(&self, dependee: &Cell<K, V>, callback: F)
    where
        F: Fn(&V) -> Outcome<V> + Send + Sync + 'static,
    {
        self.register(
            dependee,
            CallbackKind::Next,
            DispatchMode::Sequential,
            Arc::new(move |value: &V, _| callback(value)),
        );
    }

    /// Register a callback fired once when `dependee` is finalized.
    ///
    /// If `dependee` is already final, the callback is dispatched immediately
    /// on the pool without installing a dependency on either side.
    pub fn when_complete<F>(&self, dependee: &Cell<K, V>, callback: F)
    where
        F: Fn(&V) -> Outcome<V> + Send + Sync + 'static,
    {
        self.register(
            dependee,
            CallbackKind::Complete,
            DispatchMode::Concurrent,
            Arc::new(move |value: &V, _| callback(value)),
        );
    }

    /// [`when_complete`](Self::when_complete) with the callback body
    /// serialized per dependent cell.
    pub fn when_complete_sequential<F>(&self, dependee: &Cell<K, V>, callback: F)
    where
        F: Fn(&V) -> Outcome<V> + Send + Sync + 'static,
    {
        self.register(
            dependee,
            CallbackKind::Complete,
            DispatchMode::Sequential,
            Arc::new(move |value: &V, _| callback(value)),
        );
    }

    /// Register a combined callback: fired on every advance of `dependee`
    /// with the current value and a flag telling whether that value is
    /// final. Registering against an already-final dependee dispatches the
    /// callback immediately with the final value.
    pub fn when<F>(&self, dependee: &Cell<K, V>, callback: F)
    where
        F: Fn(&V, bool) -> Outcome<V> + Send + Sync + 'static,
    {
        self.register(
            dependee,
            CallbackKind::Combined,
            DispatchMode::Concurrent,
            Arc::new(callback),
        );
    }

    /// [`when`](Self::when) with the callback body serialized per dependent
    /// cell.
    pub fn when_sequential<F>(&self, dependee: &Cell<K, V>, callback: F)
    where
        F: Fn(&V, bool) -> Outcome<V> + Send + Sync + 'static,
    {
        self.register(
            dependee,
            CallbackKind::Combined,
            DispatchMode::Sequential,
            Arc::new(callback),
        );
    }

    fn register(
        &self,
        dependee: &Cell<K, V>,
        kind: CallbackKind,
        mode: DispatchMode,
        run: CallbackFn<V>,
    ) {
        let mut record = Some(CallbackRecord {
            dependent: Arc::downgrade(&self.inner),
            run,
            mode,
        });

        let dependee_final = {
            let mut guard = dependee.inner.state.lock();
            match &mut *guard {
                CellState::Final(_) => true,
                CellState::Incomplete(state) => {
                    let map = match kind {
                        CallbackKind::Next | CallbackKind::Combined => &mut state.next_callbacks,
                        CallbackKind::Complete => &mut state.complete_callbacks,
                    };
                    map.entry(self.inner.id)
                        .or_default()
                        .push(record.take().expect("Cell::register: record taken once"));
                    false
                }
            }
        };

        if dependee_final {
            match kind {
                // Intermediate updates can no longer happen.
                CallbackKind::Next => {}
                CallbackKind::Complete | CallbackKind::Combined => {
                    let record = record.expect("Cell::register: record untouched on final");
                    if let Some(pool) = self.inner.pool.upgrade() {
                        record.schedule(&pool, dependee.clone());
                    }
                }
            }
            return;
        }

        // Mirror the edge on our side. If this cell finalized concurrently,
        // the stale record in the dependee is pruned on its next firing.
        {
            let mut guard = self.inner.state.lock();
            if let CellState::Incomplete(state) = &mut *guard {
                let set = match kind {
                    CallbackKind::Next | CallbackKind::Combined => &mut state.next_deps,
                    CallbackKind::Complete => &mut state.complete_deps,
                };
                set.entry(dependee.inner.id)
                    .or_insert_with(|| dependee.clone());
            }
        }
        // The dependee may have finalized between the two inserts, and its
        // edge cleanup may have run before our entry existed; recheck so a
        // final dependee never lingers in the dependency sets.
        if dependee.is_complete() {
            self.inner.remove_dependee(dependee.inner.id);
        }

        dependee.trigger();
    }
}

impl<K, V> CellInner<K, V> {
    /// Drop `dependent`'s entries from both outgoing callback maps.
    fn remove_listener(&self, dependent: CellId) {
        if let CellState::Incomplete(state) = &mut *self.state.lock() {
            state.next_callbacks.shift_remove(&dependent);
            state.complete_callbacks.shift_remove(&dependent);
        }
    }

    /// Drop `dependee` from both dependency sets.
    fn remove_dependee(&self, dependee: CellId) {
        if let CellState::Incomplete(state) = &mut *self.state.lock() {
            state.next_deps.shift_remove(&dependee);
            state.complete_deps.shift_remove(&dependee);
        }
    }
}
