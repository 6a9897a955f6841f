//! Mosaic tiles and composite assembly.
//!
//! A corrected frame is already a complete tile for its detector, so
//! packaging is a pass-through that attaches provenance. Composites of
//! several detectors are laid out from an externally supplied offset table.

use crate::config::DetectorOffset;
use crate::fits::Header;
use crate::ingest::{Frame, FrameId};
use chrono::{DateTime, Utc};
use ndarray::{s, Array2};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Errors raised while composing tiles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MosaicError {
    /// No tile's detector appears in the offset table.
    #[error("none of the {0} tiles has an entry in the offset table")]
    NothingToPlace(usize),
}

/// Where a tile came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    /// Exposure the frames belong to.
    pub exposure: Option<FrameId>,
    /// Lowest contributing frame number.
    pub first_frame: u64,
    /// Highest contributing frame number.
    pub last_frame: u64,
    /// Contributing detectors, ascending.
    pub detectors: Vec<u32>,
    /// Number of frames combined.
    pub frame_count: usize,
    /// True once every frame of the exposure has contributed.
    pub complete: bool,
    /// When the tile was produced.
    pub created: DateTime<Utc>,
}

/// Corrected image handed to the display.
#[derive(Debug, Clone)]
pub struct MosaicTile {
    /// Corrected pixel values.
    pub data: Array2<f64>,
    /// Metadata rewritten to the tile's coordinates.
    pub header: Header,
    /// Source frames.
    pub provenance: Provenance,
}

impl MosaicTile {
    /// `(rows, columns)` of the tile.
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Display name: the exposure id when known.
    pub fn name(&self) -> String {
        match &self.provenance.exposure {
            Some(id) => id.to_string(),
            None => format!("frames {}-{}", self.provenance.first_frame, self.provenance.last_frame),
        }
    }
}

/// Detector id → `(x, y)` placement of its tile's top-left corner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    offsets: HashMap<u32, (usize, usize)>,
}

impl OffsetTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `detector` with its left edge at column `x` and top edge at row `y`.
    pub fn insert(&mut self, detector: u32, x: usize, y: usize) {
        self.offsets.insert(detector, (x, y));
    }

    /// Offset of `detector`, if it has one.
    pub fn get(&self, detector: u32) -> Option<(usize, usize)> {
        self.offsets.get(&detector).copied()
    }

    /// Number of placed detectors.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True when no detector has an offset.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl From<&[DetectorOffset]> for OffsetTable {
    fn from(entries: &[DetectorOffset]) -> Self {
        let mut table = OffsetTable::new();
        for entry in entries {
            table.insert(entry.detector, entry.x, entry.y);
        }
        table
    }
}

/// Packages corrected frames and stitches multi-detector composites.
#[derive(Debug, Clone, Default)]
pub struct MosaicAssembler;

impl MosaicAssembler {
    /// Creates an assembler.
    pub fn new() -> Self {
        Self
    }

    /// Wraps one corrected frame as a tile.
    pub fn package(
        &self,
        data: Array2<f64>,
        header: Header,
        frame: &Frame,
        detector_id: u32,
        exposure: Option<FrameId>,
    ) -> MosaicTile {
        MosaicTile {
            data,
            header,
            provenance: Provenance {
                exposure,
                first_frame: frame.number(),
                last_frame: frame.number(),
                detectors: vec![detector_id],
                frame_count: 1,
                complete: false,
                created: Utc::now(),
            },
        }
    }

    /// Lays tiles out on one canvas according to `offsets`.
    ///
    /// Tiles whose detector is not in the table are skipped. Pixels no tile
    /// covers are NaN. Later tiles overwrite earlier ones where they overlap.
    pub fn compose(
        &self,
        tiles: &[MosaicTile],
        offsets: &OffsetTable,
    ) -> Result<MosaicTile, MosaicError> {
        let mut placed = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let detector = tile.provenance.detectors.first().copied();
            match detector.and_then(|d| offsets.get(d)) {
                Some(offset) => placed.push((tile, offset)),
                None => tracing::warn!(
                    detector = ?detector,
                    tile = %tile.name(),
                    "No offset for detector; tile left out of composite"
                ),
            }
        }

        let Some(&(first, _)) = placed.first() else {
            return Err(MosaicError::NothingToPlace(tiles.len()));
        };

        let (height, width) = placed.iter().fold((0, 0), |(h, w), (tile, (x, y))| {
            let (th, tw) = tile.dim();
            (h.max(y + th), w.max(x + tw))
        });

        let mut data = Array2::from_elem((height, width), f64::NAN);
        let mut detectors = BTreeSet::new();
        let mut first_frame = u64::MAX;
        let mut last_frame = 0;
        let mut frame_count = 0;

        for (tile, (x, y)) in &placed {
            let (th, tw) = tile.dim();
            data.slice_mut(s![*y..y + th, *x..x + tw]).assign(&tile.data);
            detectors.extend(tile.provenance.detectors.iter().copied());
            first_frame = first_frame.min(tile.provenance.first_frame);
            last_frame = last_frame.max(tile.provenance.last_frame);
            frame_count += tile.provenance.frame_count;
        }

        let mut header = first.header.clone();
        header.set("NAXIS1", width as i64);
        header.set("NAXIS2", height as i64);

        tracing::debug!(
            tiles = placed.len(),
            width,
            height,
            "Composed mosaic"
        );

        Ok(MosaicTile {
            data,
            header,
            provenance: Provenance {
                exposure: first.provenance.exposure.clone(),
                first_frame,
                last_frame,
                detectors: detectors.into_iter().collect(),
                frame_count,
                complete: false,
                created: Utc::now(),
            },
        })
    }
}
