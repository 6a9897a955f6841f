//! Exposure boundary detection.
//!
//! Frames arrive one file per detector. The tracker decides, for each
//! drained batch, which paths belong to the exposure in progress, which
//! start a new exposure, and which are stale. Recency wins: an incomplete
//! exposure is dropped as soon as a frame from a later one shows up.

use super::frame::{Frame, FrameId};
use crate::config::InstrumentConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// State of the exposure being accumulated.
#[derive(Debug, Clone, Default)]
pub struct ExposureState {
    /// First frame number of the exposure in progress (0 before any frame).
    pub current_exposure_number: u64,
    /// Frames written per exposure.
    pub frames_per_exposure: u64,
    /// Frames accepted so far for the exposure in progress.
    pub frames: Vec<Frame>,
}

/// Paths seen for one exposure, stale ones included.
#[derive(Debug, Clone)]
pub struct ExposureEntry {
    /// Every path recorded for the exposure.
    pub paths: BTreeSet<PathBuf>,
    /// The first path seen, used as the exposure's representative.
    pub typical: PathBuf,
}

/// Outcome of classifying one batch.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Frames to process, in arrival order.
    pub accepted: Vec<Frame>,
    /// True if any path in the batch started a new exposure.
    pub is_new_exposure: bool,
    /// Exposure the accepted frames belong to.
    pub exposure: Option<FrameId>,
    /// Every exposure id touched by the batch, stale ones included.
    pub exposures_seen: BTreeSet<FrameId>,
    /// Paths dropped as stale, foreign or unparseable.
    pub dropped: usize,
}

impl Classification {
    /// Paths of the accepted frames.
    pub fn accepted_paths(&self) -> Vec<PathBuf> {
        self.accepted.iter().map(|f| f.path().to_path_buf()).collect()
    }
}

/// Classifies incoming frame paths against the exposure in progress.
#[derive(Debug)]
pub struct ExposureTracker {
    inscode: String,
    state: ExposureState,
    catalog: BTreeMap<FrameId, ExposureEntry>,
}

impl ExposureTracker {
    /// Creates a tracker for frames carrying `inscode`.
    pub fn new(inscode: impl Into<String>, frames_per_exposure: u64) -> Self {
        Self {
            inscode: inscode.into(),
            state: ExposureState {
                frames_per_exposure: frames_per_exposure.max(1),
                ..ExposureState::default()
            },
            catalog: BTreeMap::new(),
        }
    }

    /// Creates a tracker from instrument constants.
    pub fn for_instrument(instrument: &InstrumentConfig) -> Self {
        Self::new(&instrument.inscode, instrument.frames_per_exposure)
    }

    /// Classifies a batch in arrival order and updates the exposure state.
    pub fn classify<P: AsRef<Path>>(&mut self, batch: &[P]) -> Classification {
        let fpe = self.state.frames_per_exposure;
        let mut result = Classification::default();

        for path in batch {
            let path = path.as_ref();
            let frame = match Frame::from_path(path, fpe) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Ignoring non-frame path");
                    result.dropped += 1;
                    continue;
                }
            };

            if frame.inscode() != self.inscode {
                tracing::debug!(
                    path = %path.display(),
                    inscode = frame.inscode(),
                    "Ignoring frame from another instrument"
                );
                result.dropped += 1;
                continue;
            }

            let exposure_id = frame.exposure_id(fpe);
            self.record(&exposure_id, path);
            result.exposures_seen.insert(exposure_id.clone());

            if frame.number() < self.state.current_exposure_number {
                tracing::debug!(
                    frame = %frame.id(),
                    current = self.state.current_exposure_number,
                    "Dropping stale frame"
                );
                result.dropped += 1;
                continue;
            }

            let exp_num = frame.exposure_number(fpe);
            if exp_num > self.state.current_exposure_number {
                if !self.state.frames.is_empty() && !self.is_complete() {
                    tracing::info!(
                        abandoned = self.state.current_exposure_number,
                        received = self.state.frames.len(),
                        expected = fpe,
                        "Abandoning incomplete exposure"
                    );
                }
                tracing::info!(exposure = %exposure_id, "New exposure");

                self.state.current_exposure_number = exp_num;
                self.state.frames = vec![frame.clone()];
                result.accepted = vec![frame];
                result.is_new_exposure = true;
            } else {
                self.state.frames.push(frame.clone());
                result.accepted.push(frame);
            }
            result.exposure = Some(exposure_id);
        }

        result
    }

    fn record(&mut self, exposure_id: &FrameId, path: &Path) {
        self.catalog
            .entry(exposure_id.clone())
            .or_insert_with(|| ExposureEntry {
                paths: BTreeSet::new(),
                typical: path.to_path_buf(),
            })
            .paths
            .insert(path.to_path_buf());
    }

    /// Current exposure state.
    pub fn state(&self) -> &ExposureState {
        &self.state
    }

    /// First frame number of the exposure in progress.
    pub fn current_exposure_number(&self) -> u64 {
        self.state.current_exposure_number
    }

    /// Frames accepted so far for the exposure in progress.
    pub fn frames(&self) -> &[Frame] {
        &self.state.frames
    }

    /// Returns true once every frame of the current exposure has been accepted.
    pub fn is_complete(&self) -> bool {
        let mut numbers: Vec<u64> = self.state.frames.iter().map(Frame::number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers.len() as u64 == self.state.frames_per_exposure
    }

    /// Looks up the paths recorded for an exposure.
    pub fn exposure(&self, id: &FrameId) -> Option<&ExposureEntry> {
        self.catalog.get(id)
    }

    /// Every exposure seen since start-up.
    pub fn exposures(&self) -> impl Iterator<Item = (&FrameId, &ExposureEntry)> {
        self.catalog.iter()
    }

    /// Removes a frame that could not be processed from the exposure in
    /// progress. Returns false if it was not part of it.
    pub fn discard(&mut self, frame_number: u64) -> bool {
        let before = self.state.frames.len();
        self.state.frames.retain(|f| f.number() != frame_number);
        before != self.state.frames.len()
    }

    /// Forgets the exposure in progress so the next frame starts a new one,
    /// even if it is older. The catalog is kept.
    pub fn clear_current(&mut self) {
        self.state.current_exposure_number = 0;
        self.state.frames.clear();
    }

    /// Forgets the exposure in progress and the catalog.
    pub fn reset(&mut self) {
        self.state.current_exposure_number = 0;
        self.state.frames.clear();
        self.catalog.clear();
        tracing::info!("Exposure tracker reset");
    }
}
