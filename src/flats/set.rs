//! Loaded flat-field sets and the store that publishes them.

use ndarray::Array2;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One flat frame per detector.
#[derive(Debug, Clone, Default)]
pub struct FlatFieldSet {
    flats: HashMap<u32, Array2<f64>>,
    expected_count: usize,
}

impl FlatFieldSet {
    /// Creates an empty set that is complete once `expected_count` flats are in.
    pub fn new(expected_count: usize) -> Self {
        Self {
            flats: HashMap::with_capacity(expected_count),
            expected_count,
        }
    }

    /// Wraps an already loaded map.
    pub fn from_map(flats: HashMap<u32, Array2<f64>>, expected_count: usize) -> Self {
        Self {
            flats,
            expected_count,
        }
    }

    /// Adds or replaces the flat for `detector`.
    pub fn insert(&mut self, detector: u32, flat: Array2<f64>) {
        self.flats.insert(detector, flat);
    }

    /// Flat for `detector`, if loaded.
    pub fn get(&self, detector: u32) -> Option<&Array2<f64>> {
        self.flats.get(&detector)
    }

    /// Flats loaded so far.
    pub fn len(&self) -> usize {
        self.flats.len()
    }

    /// Number of detectors the set must cover.
    pub fn expected_count(&self) -> usize {
        self.expected_count
    }

    /// True once every expected detector has a flat.
    pub fn is_complete(&self) -> bool {
        self.flats.len() == self.expected_count
    }

    /// True when no flat is loaded.
    pub fn is_empty(&self) -> bool {
        self.flats.is_empty()
    }

    /// Detector ids with a flat, ascending.
    pub fn detectors(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.flats.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// The flat set in effect, replaced whole when a load completes.
///
/// Every load takes a generation number when it starts. Only the load
/// holding the newest generation may publish, so an older load finishing
/// late never overwrites a newer one.
#[derive(Debug, Default)]
pub struct FlatStore {
    current: RwLock<Option<Arc<FlatFieldSet>>>,
    generation: AtomicU64,
}

impl FlatStore {
    /// Creates an empty store with nothing published.
    pub fn new() -> Self {
        Self::default()
    }

    /// The published set, if any.
    pub fn current(&self) -> Option<Arc<FlatFieldSet>> {
        self.current.read().clone()
    }

    /// Reserves the generation for a load that is about to start.
    pub fn begin_load(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Generation of the most recently started load.
    pub fn latest_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Publishes `set` if it is complete and `generation` is still the
    /// newest. Returns whether it was published.
    pub fn publish(&self, generation: u64, set: FlatFieldSet) -> bool {
        if !set.is_complete() {
            tracing::warn!(
                generation,
                loaded = set.len(),
                expected = set.expected_count(),
                "Refusing to publish incomplete flat set"
            );
            return false;
        }
        let mut current = self.current.write();
        if generation != self.generation.load(Ordering::SeqCst) {
            tracing::info!(
                generation,
                latest = self.latest_generation(),
                "Flat load superseded; not publishing"
            );
            return false;
        }
        *current = Some(Arc::new(set));
        true
    }

    /// Drops the published set.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}
