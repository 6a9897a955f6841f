//! Frame sources.
//!
//! Reading is behind a trait so the pipeline and flat loader can run against
//! files on disk or images held in memory.

use super::{read_image, FitsError, FitsImage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Anything that can produce a decoded image for a path.
pub trait FrameSource: Send + Sync {
    /// Reads the image stored at `path`.
    fn read(&self, path: &Path) -> Result<FitsImage, FitsError>;
}

/// Reads FITS files from the filesystem.
///
/// Each read fetches the standard keywords plus the ones given at
/// construction, typically [`RegionExtractor::keywords`](crate::correction::RegionExtractor::keywords).
#[derive(Debug, Clone, Default)]
pub struct FitsFileSource {
    keywords: Vec<String>,
}

impl FitsFileSource {
    /// Creates a source that also fetches `keywords`.
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            keywords: keywords.into_iter().collect(),
        }
    }

    /// Extra keywords fetched on every read.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

impl FrameSource for FitsFileSource {
    fn read(&self, path: &Path) -> Result<FitsImage, FitsError> {
        read_image(path, &self.keywords)
    }
}

/// In-memory source for tests and dry runs. Counts every read.
#[derive(Debug, Default)]
pub struct MemorySource {
    images: Mutex<HashMap<PathBuf, FitsImage>>,
    reads: AtomicUsize,
}

impl MemorySource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `image` under `path`, replacing any previous one.
    pub fn insert(&self, path: impl Into<PathBuf>, image: FitsImage) {
        self.images.lock().insert(path.into(), image);
    }

    /// Number of `read` calls so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl FrameSource for MemorySource {
    fn read(&self, path: &Path) -> Result<FitsImage, FitsError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| FitsError::Io {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such image"),
            })
    }
}
