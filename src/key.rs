use crate::{cell::Cell, lattice::LatticeValue};

/// Per-cell resolution policy, consulted by the pool at quiescence.
///
/// When the pool quiesces with non-final cells left over, the remaining cells
/// either form closed strongly connected components of the dependency graph
/// (feedback loops that cannot advance without intervention) or are
/// dependency-free stragglers. The key attached to each cell decides how to
/// force final values in both situations.
///
/// Both policies must return values that are monotone with respect to each
/// cell's current value; assignments rejected by a cell are routed to the
/// pool's unhandled-failure hook and leave the cell non-final.
pub trait Key<V>: Sized + Send + Sync + 'static
where
    V: LatticeValue,
{
    /// Resolve a closed strongly connected component of non-final cells.
    ///
    /// Invoked with the members of one closed SCC; the key of the component's
    /// first cell is used. Returns a finalization value for each cell the
    /// policy decides to resolve (usually all of them).
    fn resolve(&self, cells: &[Cell<Self, V>]) -> Vec<(Cell<Self, V>, V)>;

    /// Resolve cells that survived cycle resolution and have no remaining
    /// dependencies.
    ///
    /// Returns a finalization value for each cell the policy decides to
    /// resolve.
    fn fallback(&self, cells: &[Cell<Self, V>]) -> Vec<(Cell<Self, V>, V)>;
}
