use crate::error::NotMonotonic;

/// Bound alias for values that can live in a cell.
///
/// The engine compares joined values against the current one to detect a
/// strict advance, and hands clones to callbacks, so values must be cheap-ish
/// to clone and comparable for equality.
pub trait LatticeValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> LatticeValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// User-supplied join-semilattice over a value type `V`.
///
/// The updater provides the distinguished bottom element every fresh cell
/// starts from and the join applied by `put_next`/`put_final`. The contract:
///
/// - idempotence: `update(x, x) == x`
/// - `update(x, y)` is an upper bound of both `x` and `y`
/// - `update` never decreases the current value
///
/// When these laws hold, the final value of every cell at quiescence is the
/// join of all successful updates, independent of scheduling order. An
/// updater may signal [`NotMonotonic`] to reject an incoming value outright;
/// the engine surfaces this as a failed update instead of silently
/// regressing the cell.
pub trait Updater<V>: Send + Sync + 'static {
    /// The initial value of every cell created against this updater.
    fn bottom(&self) -> V;

    /// Join `incoming` into `current`, returning the joined value.
    ///
    /// # Errors
    /// [`NotMonotonic`] if the incoming value is incompatible with the
    /// lattice order.
    fn update(&self, current: &V, incoming: V) -> Result<V, NotMonotonic>;

    /// When `true`, updates arriving at an already-final cell are silently
    /// dropped instead of failing with `AlreadyFinal`.
    fn ignore_if_final(&self) -> bool {
        false
    }
}
