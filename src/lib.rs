//! Concurrent, deterministic fixed-point computation over user-defined
//! lattices.
//!
//! This crate provides *cells* — monotonically growing containers of a value
//! drawn from a join-semilattice — together with a handler pool that
//! schedules dependency callbacks on a work-stealing thread pool, detects
//! quiescence, and resolves the cells that remain non-final, including
//! cyclic dependency components. It:
//! - Joins every incoming value into the cell's current one through the
//!   user-supplied updater, so the final value at quiescence is independent
//!   of scheduling order.
//! - Fires registered callbacks on value advances (`when_next`, `when`) and
//!   on finalization (`when_complete`), concurrently or serialized per
//!   dependent cell.
//! - Detects quiescence with a single atomic task-counting word and runs
//!   registered quiescence handlers as counted tasks.
//! - Finds closed strongly connected components of the remaining dependency
//!   graph at quiescence and finalizes them through per-key resolution
//!   policies, with fallback resolution for dependency-free stragglers.
//!
//! Key modules:
//! - `lattice`: the `Updater` contract binding a value type to its join.
//! - `key`: per-cell cycle-resolution and fallback policies.
//! - `cell`: the cell state machine (joins, dependencies, callbacks,
//!   completion).
//! - `pool`: the handler pool (task counting, quiescence, resolution
//!   drivers).
//! - `scc`: the closed-SCC finder used by cycle resolution.
//!
//! Quick start:
//! 1. Implement [`Updater`] for your lattice and, per cell, a [`Key`] with
//!    `resolve`/`fallback` policies.
//! 2. Build a [`HandlerPool`], create cells with `create_cell`, and wire
//!    dependencies with `when_next`/`when_complete`/`when`.
//! 3. Feed values with `put_next`/`put_final`, then drive the engine to a
//!    fixed point with `quiescent_resolve_cell` or the
//!    `while_quiescent_resolve_cell` loop.
//!
//! Provided user updates respect lattice monotonicity, every cell's value at
//! quiescence equals the join of all successful updates ever applied to it,
//! and the resolution drivers produce one deterministic final assignment.

mod callback;
/// Cells and their state machine.
///
/// Defines the [`Cell`] handle: value reads, `put_next`/`put_final` joins,
/// dependency registration (`when_next`/`when_complete`/`when` and their
/// `_sequential` variants), triggering, and pool-driven resolution.
pub mod cell;
/// Error kinds surfaced by cells and the pool.
pub mod error;
/// Per-cell resolution policies consulted at quiescence.
pub mod key;
/// The user-supplied lattice contract.
pub mod lattice;
/// Callback outcome sum type.
pub mod outcome;
/// The handler pool: task submission, quiescence detection, and cycle and
/// fallback resolution drivers.
pub mod pool;
/// Closed strongly connected components of the cell-dependency graph.
///
/// A *closed* SCC is a maximal set of mutually reachable nodes with no edge
/// leaving the set; at quiescence these are exactly the feedback loops whose
/// cells cannot advance without intervention, so they form the unit of cycle
/// resolution. Exposed because the traversal is independent of cells: it
/// works over any node set with a successor function.
pub mod scc;
mod sync;
/// Core identifier and collection types used across the crate.
pub mod types;

pub use cell::Cell;
pub use error::{CallbackFailure, CellError, NotMonotonic, PoolError};
pub use key::Key;
pub use lattice::{LatticeValue, Updater};
pub use outcome::Outcome;
pub use pool::{FailureHook, HandlerPool, HandlerPoolBuilder};
pub use types::CellId;
