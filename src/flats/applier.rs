//! Flat-field division.

use super::{FlatError, FlatFieldSet, FlatStore};
use ndarray::Array2;
use std::sync::Arc;

/// Divides corrected tiles by their detector's flat when enabled.
#[derive(Debug, Clone)]
pub struct FlatFieldApplier {
    store: Arc<FlatStore>,
    enabled: bool,
}

impl FlatFieldApplier {
    /// Creates an applier reading flats from `store`.
    pub fn new(store: Arc<FlatStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Turns flat division on or off.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether flat division is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Store the applier reads from.
    pub fn store(&self) -> &Arc<FlatStore> {
        &self.store
    }

    /// Divides `data` by the published flat for `detector`.
    ///
    /// Returns `Ok(false)` without touching `data` when flat-fielding is
    /// disabled or nothing has been published yet.
    pub fn apply(&self, data: &mut Array2<f64>, detector: u32) -> Result<bool, FlatError> {
        if !self.enabled {
            return Ok(false);
        }
        match self.store.current() {
            Some(flats) if !flats.is_empty() => divide(data, detector, &flats).map(|()| true),
            _ => Ok(false),
        }
    }
}

/// Divides `data` element-wise by the flat for `detector` in `flats`.
///
/// `data` is left unchanged on error.
pub fn divide(data: &mut Array2<f64>, detector: u32, flats: &FlatFieldSet) -> Result<(), FlatError> {
    let flat = flats.get(detector).ok_or(FlatError::MissingDetector(detector))?;
    if flat.dim() != data.dim() {
        return Err(FlatError::ShapeMismatch {
            detector,
            flat: flat.dim(),
            image: data.dim(),
        });
    }
    *data /= flat;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn store_with(detector: u32, flat: Array2<f64>) -> Arc<FlatStore> {
        let store = Arc::new(FlatStore::new());
        let mut set = FlatFieldSet::new(1);
        set.insert(detector, flat);
        let generation = store.begin_load();
        store.publish(generation, set);
        store
    }

    #[test]
    fn test_all_ones_flat_is_identity() {
        let store = store_with(2, Array2::ones((3, 4)));
        let applier = FlatFieldApplier::new(store, true);

        let original = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f64 - 3.5);
        let mut data = original.clone();
        assert!(applier.apply(&mut data, 2).unwrap());
        assert_eq!(data, original);
    }

    #[test]
    fn test_division() {
        let store = store_with(0, array![[2.0, 4.0], [0.5, 1.0]]);
        let applier = FlatFieldApplier::new(store, true);

        let mut data = array![[10.0, 10.0], [10.0, 10.0]];
        applier.apply(&mut data, 0).unwrap();
        assert_eq!(data, array![[5.0, 2.5], [20.0, 10.0]]);
    }

    #[test]
    fn test_disabled_or_unloaded_is_noop() {
        let store = store_with(0, Array2::from_elem((2, 2), 2.0));
        let mut data = Array2::from_elem((2, 2), 8.0);

        let disabled = FlatFieldApplier::new(Arc::clone(&store), false);
        assert!(!disabled.apply(&mut data, 0).unwrap());

        let empty = FlatFieldApplier::new(Arc::new(FlatStore::new()), true);
        assert!(!empty.apply(&mut data, 0).unwrap());
        assert!(data.iter().all(|&v| v == 8.0));
    }

    #[test]
    fn test_errors_leave_data_untouched() {
        let store = store_with(1, Array2::from_elem((2, 2), 2.0));
        let applier = FlatFieldApplier::new(store, true);
        let mut data = Array2::from_elem((2, 3), 8.0);

        assert!(matches!(
            applier.apply(&mut data, 7),
            Err(FlatError::MissingDetector(7))
        ));
        assert!(matches!(
            applier.apply(&mut data, 1),
            Err(FlatError::ShapeMismatch { detector: 1, flat: (2, 2), image: (2, 3) })
        ));
        assert!(data.iter().all(|&v| v == 8.0));
    }
}
