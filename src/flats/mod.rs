//! Flat-field calibration.
//!
//! Flats are loaded from a directory in the background and published as a
//! whole set once every detector's flat has been read. The applier divides
//! corrected tiles by the published flat for their detector.

mod applier;
mod loader;
mod set;

pub use applier::{divide, FlatFieldApplier};
pub use loader::{
    flat_files, split_groups, FlatLoadHandle, FlatLoadStatus, FlatLoader, FLAT_FILE_PATTERN,
};
pub use set::{FlatFieldSet, FlatStore};

use crate::fits::FitsError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or applying flats.
#[derive(Debug, Error)]
pub enum FlatError {
    #[error("found {found} flat files in {dir}, expected {expected}")]
    CountMismatch {
        dir: PathBuf,
        found: usize,
        expected: usize,
    },
    #[error("no flat loaded for detector {0}")]
    MissingDetector(u32),
    #[error("flat for detector {detector} is {flat:?} but the image is {image:?}")]
    ShapeMismatch {
        detector: u32,
        flat: (usize, usize),
        image: (usize, usize),
    },
    #[error("detector {detector} has two flats: {first} and {second}")]
    DuplicateDetector {
        detector: u32,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("cannot list flat directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid flat file pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Fits(#[from] FitsError),
}
