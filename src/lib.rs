//! CCD Mosaic Library
//!
//! Quick-look processing for multi-detector CCD cameras. Every exposure is
//! written as one file per detector; this crate turns those files into
//! bias-corrected, trimmed and optionally flat-fielded tiles as they land
//! on disk.
//!
//! # Architecture
//!
//! ```text
//! ingest → correction → flats → display
//!   ↓          ↓
//! (debounce, (regions, overscan, mosaic)
//!  exposure
//!  tracking)
//! ```
//!
//! # Design Principles
//!
//! - **Recency wins**: a frame from a newer exposure abandons the one in progress
//! - **Per-frame isolation**: a bad frame is reported and skipped, never fatal
//! - **Whole-set flats**: a flat set is only used once every detector has loaded
//! - **Single owner**: exposure state lives on the pipeline task alone
//!
//! # Example
//!
//! ```no_run
//! use ccd_mosaic::{
//!     config::{InstrumentConfig, PipelineConfig},
//!     correction::{MosaicTile, RegionExtractor},
//!     fits::FitsFileSource,
//!     flats::{FlatFieldApplier, FlatStore},
//!     pipeline::{Display, Pipeline},
//! };
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! impl Display for Print {
//!     fn set_image(&mut self, tile: MosaicTile) {
//!         println!("{}: {:?}", tile.name(), tile.dim());
//!     }
//! }
//!
//! let instrument = InstrumentConfig::spcam();
//! let source = FitsFileSource::new(RegionExtractor::new(&instrument.keyword_prefix).keywords());
//! let store = Arc::new(FlatStore::new());
//! let mut pipeline = Pipeline::new(
//!     &instrument,
//!     &PipelineConfig::default(),
//!     FlatFieldApplier::new(store, false),
//!     Arc::new(source),
//!     Print,
//! );
//!
//! let report = pipeline.process_batch(&["/data/SUPA01234560.fits", "/data/SUPA01234561.fits"]);
//! println!("{} frames processed", report.processed);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod correction;
pub mod fits;
pub mod flats;
pub mod ingest;
pub mod pipeline;

// Re-export commonly used types at crate root
pub use config::{FileConfig, InstrumentConfig};
pub use correction::{MosaicAssembler, MosaicTile, OverscanCorrector, RegionExtractor};
pub use fits::{FitsImage, FrameSource, Header};
pub use flats::{FlatFieldApplier, FlatLoader, FlatStore};
pub use ingest::{ExposureTracker, Frame, FrameId, Ingestor};
pub use pipeline::{BatchReport, Display, Pipeline};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
