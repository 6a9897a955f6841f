//! Per-frame correction: channel geometry, overscan bias removal and
//! mosaic assembly.
//!
//! A raw frame goes through [`RegionExtractor`] to find its channel layout,
//! then [`OverscanCorrector`] to subtract bias and trim, and finally
//! [`MosaicAssembler`] to become a displayable tile.

mod mosaic;
mod overscan;
mod regions;

pub use mosaic::{MosaicAssembler, MosaicError, MosaicTile, OffsetTable, Provenance};
pub use overscan::{row_medians, CorrectionError, OverscanCorrector};
pub use regions::{ImageGeometry, Region, RegionError, RegionExtractor, NUM_CHANNELS};
