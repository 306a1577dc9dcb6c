use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};
use derive_more::Display;
use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap as _HashMap, HashSet as _HashSet};

/// Unique identifier of a cell within its pool.
///
/// Ids are handed out by a monotone per-pool counter and are never reused
/// during the pool's lifetime. Compact `NonZeroU64` keeps `Option<CellId>`
/// word-sized.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CellId(NonZeroU64);

impl CellId {
    pub(crate) fn fresh(counter: &AtomicU64) -> Self {
        let raw = counter.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).expect("CellId::fresh: counter must start at 1"))
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
