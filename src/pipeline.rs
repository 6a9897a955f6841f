//! Per-batch processing.
//!
//! The pipeline owns all per-exposure state and runs on a single task. Each
//! drained batch is classified by the [`ExposureTracker`], and every
//! accepted frame is read, overscan-corrected, flat-fielded and handed to
//! the [`Display`]. A bad frame is reported and skipped; the rest of the
//! batch carries on.

use crate::config::{ConfigError, FileConfig, InstrumentConfig, PipelineConfig};
use crate::correction::{
    CorrectionError, MosaicAssembler, MosaicTile, OffsetTable, OverscanCorrector, RegionError,
    RegionExtractor,
};
pub use crate::fits::DETECTOR_KEYWORD;
use crate::fits::{FitsError, FrameSource, Header};
use crate::flats::{FlatFieldApplier, FlatStore};
use crate::ingest::{Batch, ExposureTracker, Frame, FrameId};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors that drop a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: FitsError,
    },
    #[error(transparent)]
    MalformedMetadata(#[from] RegionError),
    #[error(transparent)]
    RegionMismatch(#[from] CorrectionError),
    #[error("cannot list {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Receives finished images.
pub trait Display {
    /// Shows a corrected tile or composite.
    fn set_image(&mut self, tile: MosaicTile);

    /// Reports a non-fatal problem to the user.
    fn show_error(&mut self, message: &str) {
        tracing::warn!(message, "Pipeline error");
    }
}

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Frames the tracker accepted.
    pub accepted: usize,
    /// Frames corrected and displayed.
    pub processed: usize,
    /// Frames dropped because of an error.
    pub failed: usize,
    /// Frames shown without their flat because flat-fielding failed.
    pub flat_failures: usize,
    /// The batch started a new exposure.
    pub is_new_exposure: bool,
    /// Exposure the accepted frames belong to.
    pub exposure: Option<FrameId>,
    /// Every frame of the exposure has now been accepted.
    pub complete: bool,
}

/// Drives frames from arrival to display.
pub struct Pipeline<S, D> {
    instrument: InstrumentConfig,
    source: Arc<S>,
    display: D,
    tracker: ExposureTracker,
    extractor: RegionExtractor,
    corrector: OverscanCorrector,
    applier: FlatFieldApplier,
    assembler: MosaicAssembler,
    offsets: Option<OffsetTable>,
    tiles: Vec<MosaicTile>,
}

impl<S: FrameSource, D: Display> Pipeline<S, D> {
    /// Creates a pipeline for `instrument`.
    pub fn new(
        instrument: &InstrumentConfig,
        settings: &PipelineConfig,
        applier: FlatFieldApplier,
        source: Arc<S>,
        display: D,
    ) -> Self {
        Self {
            instrument: instrument.clone(),
            source,
            display,
            tracker: ExposureTracker::for_instrument(instrument),
            extractor: RegionExtractor::new(&instrument.keyword_prefix),
            corrector: OverscanCorrector::new(&instrument.keyword_prefix)
                .with_bias_subtraction(settings.subtract_bias)
                .with_gain(settings.apply_gain),
            applier,
            assembler: MosaicAssembler::new(),
            offsets: None,
            tiles: Vec::new(),
        }
    }

    /// Creates a pipeline from a validated configuration file.
    pub fn from_config(
        config: &FileConfig,
        store: Arc<FlatStore>,
        source: Arc<S>,
        display: D,
    ) -> Result<Self, ConfigError> {
        let instrument = config.instrument()?;
        instrument.validate()?;
        let applier = FlatFieldApplier::new(store, config.flats.use_flats);
        let offsets = OffsetTable::from(config.mosaic.offsets.as_slice());
        Ok(Self::new(&instrument, &config.pipeline, applier, source, display).with_offsets(offsets))
    }

    /// Composes each exposure's tiles using `offsets`. An empty table turns
    /// compositing off.
    pub fn with_offsets(mut self, offsets: OffsetTable) -> Self {
        self.offsets = (!offsets.is_empty()).then_some(offsets);
        self
    }

    /// Processes one drained batch.
    pub fn process_batch<P: AsRef<Path>>(&mut self, batch: &[P]) -> BatchReport {
        let classification = self.tracker.classify(batch);
        let mut report = BatchReport {
            accepted: classification.accepted.len(),
            is_new_exposure: classification.is_new_exposure,
            exposure: classification.exposure.clone(),
            ..BatchReport::default()
        };

        if classification.is_new_exposure {
            self.tiles.clear();
        }

        let mut new_tiles = Vec::with_capacity(classification.accepted.len());
        for frame in &classification.accepted {
            match self.correct_frame(frame) {
                Ok((mut data, header)) => {
                    let detector = detector_id(&header, frame);
                    if let Err(e) = self.applier.apply(&mut data, detector) {
                        tracing::warn!(frame = %frame.id(), detector, error = %e, "Flat field not applied");
                        self.display.show_error(&format!("Error applying flat field: {e}"));
                        report.flat_failures += 1;
                    }
                    let tile = self.assembler.package(
                        data,
                        header,
                        frame,
                        detector,
                        classification.exposure.clone(),
                    );
                    new_tiles.push(tile);
                    report.processed += 1;
                }
                Err(e) => {
                    tracing::warn!(frame = %frame.id(), error = %e, "Dropping frame");
                    self.display.show_error(&format!("{}: {e}", frame.id()));
                    self.tracker.discard(frame.number());
                    report.failed += 1;
                }
            }
        }

        report.complete = self.tracker.is_complete();
        self.show(new_tiles, report.complete);

        tracing::info!(
            exposure = ?report.exposure.as_ref().map(ToString::to_string),
            accepted = report.accepted,
            processed = report.processed,
            failed = report.failed,
            new_exposure = report.is_new_exposure,
            complete = report.complete,
            "Batch processed"
        );
        report
    }

    fn correct_frame(&self, frame: &Frame) -> Result<(Array2<f64>, Header), FrameError> {
        let image = self.source.read(frame.path()).map_err(|source| FrameError::Read {
            path: frame.path().to_path_buf(),
            source,
        })?;
        let mut header = image.header;
        let geometry = self.extractor.extract(&header)?;
        let data = self
            .corrector
            .correct(image.data.view(), &geometry, Some(&mut header))?;
        Ok((data, header))
    }

    fn show(&mut self, new_tiles: Vec<MosaicTile>, complete: bool) {
        if new_tiles.is_empty() {
            return;
        }
        let first_new = self.tiles.len();
        self.tiles.extend(new_tiles);
        let total = self.tiles.len();

        match &self.offsets {
            None => {
                for (i, tile) in self.tiles.iter().enumerate().skip(first_new) {
                    let mut tile = tile.clone();
                    tile.provenance.complete = complete && i + 1 == total;
                    self.display.set_image(tile);
                }
            }
            Some(offsets) => match self.assembler.compose(&self.tiles, offsets) {
                Ok(mut mosaic) => {
                    mosaic.provenance.complete = complete;
                    self.display.set_image(mosaic);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot compose mosaic");
                    self.display.show_error(&e.to_string());
                }
            },
        }
    }

    /// Processes every frame of `exposure` found in `dir` as a fresh exposure.
    pub fn load_exposure(&mut self, dir: &Path, exposure: &FrameId) -> Result<BatchReport, FrameError> {
        let paths = exposure_paths(dir, exposure, self.instrument.frames_per_exposure)?;
        tracing::info!(exposure = %exposure, frames = paths.len(), "Loading exposure");
        self.tracker.clear_current();
        Ok(self.process_batch(&paths))
    }

    /// Processes batches until the channel closes or `cancel` fires.
    pub async fn run(&mut self, mut batches: mpsc::UnboundedReceiver<Batch>, cancel: CancellationToken) {
        tracing::info!(instrument = %self.instrument.name, "Pipeline running");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Pipeline cancelled");
                    break;
                }
                batch = batches.recv() => match batch {
                    Some(batch) => {
                        self.process_batch(&batch);
                    }
                    None => {
                        tracing::info!("Batch channel closed");
                        break;
                    }
                },
            }
        }
    }

    /// Exposure tracker state.
    pub fn tracker(&self) -> &ExposureTracker {
        &self.tracker
    }

    /// Tiles of the exposure in progress.
    pub fn tiles(&self) -> &[MosaicTile] {
        &self.tiles
    }

    /// Flat applier, e.g. to toggle flat-fielding.
    pub fn applier_mut(&mut self) -> &mut FlatFieldApplier {
        &mut self.applier
    }

    /// The display tiles are sent to.
    pub fn display(&self) -> &D {
        &self.display
    }

    /// Mutable access to the display.
    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }
}

/// Detector used for flat lookup and mosaic placement.
///
/// `DET-ID` wins when present; otherwise the id derived from the frame number.
pub fn detector_id(header: &Header, frame: &Frame) -> u32 {
    header
        .get_i64(DETECTOR_KEYWORD)
        .and_then(|id| u32::try_from(id).ok())
        .unwrap_or_else(|| frame.detector_id())
}

/// Frame files in `dir` that belong to `exposure`, ordered by frame number.
pub fn exposure_paths(
    dir: &Path,
    exposure: &FrameId,
    frames_per_exposure: u64,
) -> Result<Vec<PathBuf>, FrameError> {
    let list_err = |source| FrameError::ListDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(list_err)? {
        let path = entry.map_err(list_err)?.path();
        let Ok(frame) = Frame::from_path(&path, frames_per_exposure) else {
            continue;
        };
        if &frame.exposure_id(frames_per_exposure) == exposure {
            frames.push(frame);
        }
    }
    frames.sort_by_key(Frame::number);
    Ok(frames.into_iter().map(|f| f.path().to_path_buf()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::{FitsImage, MemorySource};
    use crate::flats::FlatFieldSet;
    use crate::ingest::Ingestor;
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct Recorder {
        images: Vec<MosaicTile>,
        errors: Vec<String>,
    }

    impl Display for Recorder {
        fn set_image(&mut self, tile: MosaicTile) {
            self.images.push(tile);
        }

        fn show_error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
    }

    /// Four 4-column channels, each followed by 2 overscan columns, 3 rows.
    fn raw_frame(effective: f64, overscan: f64, det_id: Option<i64>) -> FitsImage {
        let keywords = RegionExtractor::new("S");
        let mut header = Header::new();
        for ch in 1..=4 {
            let left = (ch as i64 - 1) * 6 + 1;
            let mut set = |area: &str, bound: &str, axis: usize, value: i64| {
                header.set(&keywords.bound_keyword(area, bound, ch, axis), value)
            };
            set("EF", "MN", 1, left);
            set("EF", "MX", 1, left + 3);
            set("EF", "MN", 2, 1);
            set("EF", "MX", 2, 3);
            set("OS", "MN", 1, left + 4);
            set("OS", "MX", 1, left + 5);
            set("OS", "MN", 2, 1);
            set("OS", "MX", 2, 3);
            header.set(&keywords.gain_keyword(ch), 1.0);
        }
        if let Some(id) = det_id {
            header.set(DETECTOR_KEYWORD, id);
        }
        let data = Array2::from_shape_fn((3, 24), |(_, c)| if c % 6 < 4 { effective } else { overscan });
        FitsImage { header, data }
    }

    fn path(n: u64) -> PathBuf {
        PathBuf::from(format!("/data/SUPA{n:08}.fits"))
    }

    fn instrument() -> InstrumentConfig {
        InstrumentConfig {
            frames_per_exposure: 4,
            num_ccds: 4,
            ..InstrumentConfig::spcam()
        }
    }

    fn pipeline(source: Arc<MemorySource>, store: Arc<FlatStore>) -> Pipeline<MemorySource, Recorder> {
        Pipeline::new(
            &instrument(),
            &PipelineConfig::default(),
            FlatFieldApplier::new(store, true),
            source,
            Recorder::default(),
        )
    }

    fn source_with(numbers: &[u64]) -> Arc<MemorySource> {
        let source = Arc::new(MemorySource::new());
        for &n in numbers {
            source.insert(path(n), raw_frame(100.0 + (n % 4) as f64, 10.0, None));
        }
        source
    }

    #[test]
    fn test_frames_become_tiles() {
        let source = source_with(&[200, 201]);
        let mut pipeline = pipeline(source, Arc::new(FlatStore::new()));

        let report = pipeline.process_batch(&[path(200), path(201)]);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.processed, 2);
        assert!(report.is_new_exposure);
        assert!(!report.complete);

        let images = &pipeline.display().images;
        assert_eq!(images.len(), 2);
        assert!(images[1].data.iter().all(|&v| v == 91.0));
        assert_eq!(images[1].provenance.detectors, vec![1]);
        assert_eq!(images[0].header.get_i64("NAXIS1"), Some(16));
    }

    #[test]
    fn test_bad_frame_does_not_stop_batch() {
        let source = source_with(&[200, 202]);
        let mut broken = raw_frame(50.0, 10.0, None);
        broken.header.remove("S_EFMN31");
        source.insert(path(201), broken);
        let mut pipeline = pipeline(source, Arc::new(FlatStore::new()));

        let report = pipeline.process_batch(&[path(200), path(201), path(202), path(203)]);
        assert_eq!(report.accepted, 4);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);

        let display = pipeline.display();
        assert_eq!(display.images.len(), 2);
        assert_eq!(display.errors.len(), 2);
        assert!(display.errors[0].contains("S_EFMN31"));
    }

    #[test]
    fn test_dropped_frame_leaves_exposure_incomplete() {
        let source = source_with(&[200, 201, 203]);
        let mut broken = raw_frame(50.0, 10.0, None);
        broken.header.remove("S_EFMN31");
        source.insert(path(202), broken);
        let mut pipeline = pipeline(source, Arc::new(FlatStore::new()));

        let report = pipeline.process_batch(&[path(200), path(201), path(202), path(203)]);
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 1);
        assert!(!report.complete);
        assert_eq!(pipeline.tracker().frames().len(), 3);
        assert!(!pipeline.tracker().is_complete());

        let images = &pipeline.display().images;
        assert_eq!(images.len(), 3);
        assert!(images.iter().all(|tile| !tile.provenance.complete));
    }

    #[test]
    fn test_flat_uses_detector_keyword() {
        let source = Arc::new(MemorySource::new());
        source.insert(path(200), raw_frame(110.0, 10.0, Some(7)));

        let store = Arc::new(FlatStore::new());
        let mut flats = FlatFieldSet::new(1);
        flats.insert(7, Array2::from_elem((3, 16), 4.0));
        let generation = store.begin_load();
        store.publish(generation, flats);

        let mut pipeline = pipeline(source, store);
        pipeline.process_batch(&[path(200)]);

        let tile = &pipeline.display().images[0];
        assert!(tile.data.iter().all(|&v| v == 25.0));
        assert_eq!(tile.provenance.detectors, vec![7]);
    }

    #[test]
    fn test_missing_flat_still_displays() {
        let source = source_with(&[200]);
        let store = Arc::new(FlatStore::new());
        let mut flats = FlatFieldSet::new(1);
        flats.insert(3, Array2::ones((3, 16)));
        let generation = store.begin_load();
        store.publish(generation, flats);

        let mut pipeline = pipeline(source, store);
        let report = pipeline.process_batch(&[path(200)]);

        assert_eq!(report.processed, 1);
        assert_eq!(report.flat_failures, 1);
        assert_eq!(pipeline.display().images.len(), 1);
        assert!(pipeline.display().errors[0].contains("flat"));
    }

    #[test]
    fn test_composite_accumulates_exposure() {
        let source = source_with(&[200, 201, 202, 203, 204]);
        let mut offsets = OffsetTable::new();
        for d in 0..4 {
            offsets.insert(d, (d as usize % 2) * 16, (d as usize / 2) * 3);
        }
        let mut pipeline = pipeline(source, Arc::new(FlatStore::new())).with_offsets(offsets);

        pipeline.process_batch(&[path(200), path(201)]);
        let report = pipeline.process_batch(&[path(202), path(203)]);
        assert!(report.complete);

        let images = &pipeline.display().images;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dim(), (3, 32));
        assert!(!images[0].provenance.complete);
        let full = &images[1];
        assert_eq!(full.dim(), (6, 32));
        assert!(full.provenance.complete);
        assert_eq!(full.provenance.frame_count, 4);
        assert_eq!(full.data[[5, 31]], 93.0);

        pipeline.process_batch(&[path(204)]);
        assert_eq!(pipeline.tiles().len(), 1);
    }

    #[test]
    fn test_exposure_paths_and_load() {
        let dir = tempfile::tempdir().unwrap();
        for n in [196, 200, 201, 203, 204] {
            std::fs::write(dir.path().join(format!("SUPA{n:08}.fits")), b"").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let exposure = FrameId::parse("SUPA00000200").unwrap();
        let paths = exposure_paths(dir.path(), &exposure, 4).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["SUPA00000200.fits", "SUPA00000201.fits", "SUPA00000203.fits"]);

        let source = Arc::new(MemorySource::new());
        for p in &paths {
            source.insert(p.clone(), raw_frame(100.0, 10.0, None));
        }
        let mut pipeline = pipeline(source, Arc::new(FlatStore::new()));
        pipeline.process_batch(&[path(300)]);

        let report = pipeline.load_exposure(dir.path(), &exposure).unwrap();
        assert!(report.is_new_exposure);
        assert_eq!(report.processed, 3);
        assert_eq!(pipeline.tracker().current_exposure_number(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_debounced_batches() {
        let source = source_with(&[200, 201]);
        let mut pipeline = pipeline(source, Arc::new(FlatStore::new()));
        let (ingestor, batches) = Ingestor::new(Duration::from_millis(200), Handle::current());
        let cancel = CancellationToken::new();

        ingestor.notify(path(200));
        ingestor.notify(path(201));

        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.cancel();
        });
        pipeline.run(batches, cancel).await;

        assert_eq!(pipeline.display().images.len(), 2);
        assert_eq!(pipeline.tracker().frames().len(), 2);
    }
}
