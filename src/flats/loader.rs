//! Concurrent flat-field loading.
//!
//! Flat files are split into near-equal groups, each group read on the
//! blocking pool. Loaded frames go into one shared map; the shared counter
//! is bumped under the same lock so it always matches the map. A supervisor
//! task joins every group before deciding whether the load completed, so
//! completion never depends on which group finished last.

use super::{FlatError, FlatFieldSet, FlatStore};
use crate::fits::FrameSource;
use ndarray::Array2;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};

/// File names accepted as flats: `<anything>-<detector>.fits`.
pub const FLAT_FILE_PATTERN: &str = r"^.+-(\d+)\.fits$";

/// Progress of one flat load.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatLoadStatus {
    /// Generation reserved in the [`FlatStore`] for this load.
    pub generation: u64,
    /// Flats the load must read to complete.
    pub expected: usize,
    /// Flats read so far.
    pub loaded: usize,
    /// Flats that could not be read.
    pub failed: usize,
    /// Every group has finished.
    pub is_complete: bool,
    /// The set was published to the store.
    pub published: bool,
}

impl FlatLoadStatus {
    fn new(generation: u64, expected: usize) -> Self {
        Self {
            generation,
            expected,
            loaded: 0,
            failed: 0,
            is_complete: false,
            published: false,
        }
    }

    /// Progress as a fraction from 0.0 to 1.0.
    pub fn progress_fraction(&self) -> f64 {
        if self.expected == 0 {
            return 1.0;
        }
        self.loaded as f64 / self.expected as f64
    }
}

/// Handle to a running flat load.
#[derive(Debug)]
pub struct FlatLoadHandle {
    status: Arc<Mutex<FlatLoadStatus>>,
    supervisor: JoinHandle<()>,
}

impl FlatLoadHandle {
    /// Snapshot of the load's progress.
    pub fn status(&self) -> FlatLoadStatus {
        self.status.lock().clone()
    }

    /// Waits for every group to finish and returns the final status.
    pub async fn wait(self) -> FlatLoadStatus {
        if let Err(e) = self.supervisor.await {
            tracing::warn!(error = %e, "Flat load supervisor did not finish");
        }
        self.status.lock().clone()
    }
}

/// Shared between the loader groups of one load.
struct LoadProgress {
    flats: Mutex<HashMap<u32, Array2<f64>>>,
    loaded: AtomicUsize,
    status: Arc<Mutex<FlatLoadStatus>>,
    expected: usize,
}

/// Loads flat directories into a [`FlatStore`].
pub struct FlatLoader<S> {
    source: Arc<S>,
    store: Arc<FlatStore>,
    num_groups: usize,
    runtime: Handle,
}

impl<S: FrameSource + 'static> FlatLoader<S> {
    /// Creates a loader that reads with `source` and splits work into `num_groups` groups.
    pub fn new(source: Arc<S>, store: Arc<FlatStore>, num_groups: usize, runtime: Handle) -> Self {
        Self {
            source,
            store,
            num_groups: num_groups.max(1),
            runtime,
        }
    }

    /// Store the loader publishes into.
    pub fn store(&self) -> &Arc<FlatStore> {
        &self.store
    }

    /// Starts loading every flat in `dir`.
    ///
    /// Fails with [`FlatError::CountMismatch`] before reading anything if
    /// the directory does not hold exactly `expected` flats.
    pub fn load(&self, dir: &Path, expected: usize) -> Result<FlatLoadHandle, FlatError> {
        let files = flat_files(dir)?;
        if files.len() != expected {
            return Err(FlatError::CountMismatch {
                dir: dir.to_path_buf(),
                found: files.len(),
                expected,
            });
        }

        let generation = self.store.begin_load();
        let status = Arc::new(Mutex::new(FlatLoadStatus::new(generation, expected)));
        let progress = Arc::new(LoadProgress {
            flats: Mutex::new(HashMap::with_capacity(expected)),
            loaded: AtomicUsize::new(0),
            status: Arc::clone(&status),
            expected,
        });

        let groups = split_groups(files, self.num_groups);
        tracing::info!(
            dir = %dir.display(),
            expected,
            groups = groups.len(),
            generation,
            "Loading flats"
        );

        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let supervisor = self.runtime.spawn(async move {
            let mut tasks = JoinSet::new();
            for group in groups {
                let source = Arc::clone(&source);
                let progress = Arc::clone(&progress);
                tasks.spawn_blocking(move || load_group(&*source, group, &progress));
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Flat loader group panicked");
                }
            }

            let loaded = progress.loaded.load(Ordering::SeqCst);
            let published = if loaded == progress.expected {
                let flats = std::mem::take(&mut *progress.flats.lock());
                store.publish(generation, FlatFieldSet::from_map(flats, progress.expected))
            } else {
                false
            };

            let mut status = progress.status.lock();
            status.is_complete = true;
            status.published = published;
            if published {
                tracing::info!(loaded, generation, "Flats loaded");
            } else {
                tracing::warn!(
                    loaded,
                    expected = progress.expected,
                    failed = status.failed,
                    generation,
                    "Flats not published; previous set stays in effect"
                );
            }
        });

        Ok(FlatLoadHandle { status, supervisor })
    }
}

fn load_group<S: FrameSource + ?Sized>(source: &S, group: Vec<(u32, PathBuf)>, progress: &LoadProgress) {
    for (detector, path) in group {
        match source.read(&path) {
            Ok(image) => {
                let count = {
                    let mut flats = progress.flats.lock();
                    flats.insert(detector, image.data);
                    let count = progress.loaded.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.status.lock().loaded = count;
                    count
                };
                tracing::debug!(
                    detector,
                    path = %path.display(),
                    progress = count as f64 / progress.expected.max(1) as f64,
                    "Loaded flat"
                );
            }
            Err(e) => {
                progress.status.lock().failed += 1;
                tracing::warn!(detector, path = %path.display(), error = %e, "Failed to load flat");
            }
        }
    }
}

/// Lists `(detector, path)` for every flat file in `dir`, ordered by detector.
pub fn flat_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>, FlatError> {
    let pattern = Regex::new(FLAT_FILE_PATTERN)?;
    let entries = std::fs::read_dir(dir).map_err(|source| FlatError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|source| FlatError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(detector) = pattern
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        else {
            continue;
        };
        if let Some(previous) = files.insert(detector, path.clone()) {
            return Err(FlatError::DuplicateDetector {
                detector,
                first: previous,
                second: path,
            });
        }
    }

    Ok(files.into_iter().collect())
}

/// Splits `items` into at most `n` groups whose sizes differ by at most one.
pub fn split_groups<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let n = n.max(1).min(items.len());
    if n == 0 {
        return Vec::new();
    }
    let base = items.len() / n;
    let extra = items.len() % n;

    let mut groups = Vec::with_capacity(n);
    let mut rest = items.into_iter();
    for i in 0..n {
        let size = base + usize::from(i < extra);
        groups.push(rest.by_ref().take(size).collect());
    }
    groups
}
