use core::fmt;
use std::any::Any;
use thiserror::Error;

/// The updater rejected an incoming value as incompatible with the lattice
/// order.
///
/// Raised by [`Updater::update`](crate::lattice::Updater::update) when joining
/// the incoming value with the current one would not be monotone. The engine
/// reports this as a failed update; the cell keeps its last accepted value.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("incoming value is not monotonic with respect to the current value")]
pub struct NotMonotonic;

/// Error returned by value updates on a cell.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CellError {
    /// The cell is already finalized and the incoming value would advance or
    /// contradict the finalized value.
    #[error("cell is already finalized with an incompatible value")]
    AlreadyFinal,
    /// The updater rejected the incoming join.
    #[error("updater rejected the incoming value as non-monotonic")]
    NotMonotonic,
}

impl From<NotMonotonic> for CellError {
    fn from(_: NotMonotonic) -> Self {
        Self::NotMonotonic
    }
}

/// Error returned by pool-level operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool is shutting down; task submission and quiescence registration
    /// are rejected.
    #[error("pool is shutting down; no new tasks are accepted")]
    ShutdownInProgress,
    /// The worker thread pool could not be constructed.
    #[error("failed to build the worker thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A failure raised inside a pool task, routed to the pool's
/// unhandled-failure hook.
///
/// Callback failures never propagate to the producer that scheduled the
/// callback; the task counter is decremented on every path so quiescence is
/// still reached.
pub enum CallbackFailure {
    /// A user callback, `init` function, or resolution policy panicked. The
    /// payload is the raw panic payload.
    Panicked(Box<dyn Any + Send + 'static>),
    /// A callback outcome or resolution value was rejected by the target
    /// cell.
    Rejected(CellError),
}

impl CallbackFailure {
    /// Best-effort extraction of the panic message, if this failure is a
    /// panic with a string payload.
    #[must_use]
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            Self::Panicked(payload) => payload
                .downcast_ref::<&'static str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str)),
            Self::Rejected(_) => None,
        }
    }
}

impl fmt::Debug for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panicked(_) => match self.panic_message() {
                Some(msg) => f.debug_tuple("Panicked").field(&msg).finish(),
                None => f.debug_tuple("Panicked").field(&"..").finish(),
            },
            Self::Rejected(err) => f.debug_tuple("Rejected").field(err).finish(),
        }
    }
}
