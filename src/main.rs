//! CCD Mosaic CLI
//!
//! Command-line front end for the quick-look pipeline. Corrected tiles are
//! handed to a display that logs them.

use ccd_mosaic::{
    config::{ConfigError, FileConfig, InstrumentConfig},
    correction::{MosaicTile, RegionExtractor},
    fits::FitsFileSource,
    flats::{FlatError, FlatLoadHandle, FlatLoader, FlatStore},
    ingest::{FrameId, FrameIdError, Ingestor},
    pipeline::{Display, FrameError, Pipeline},
};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Quick-look mosaicing of multi-CCD camera frames")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read arriving frame paths from stdin, one per line, until Ctrl+C or end of input
    Watch,
    /// Process the given frame files as one batch
    Process {
        /// Frame files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Process every frame of one exposure found in a directory
    Exposure {
        /// Directory holding the frames
        dir: PathBuf,
        /// Exposure id, e.g. SUPA01234560
        exposure: String,
    },
    /// Load a flat directory and report the result
    LoadFlats {
        /// Flat directory (defaults to flats.flat_directory)
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Flat(#[from] FlatError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid exposure id: {0}")]
    Exposure(#[from] FrameIdError),
    #[error("no flat directory given and none configured")]
    NoFlatDirectory,
    #[error("flats were not published ({loaded} of {expected} loaded, {failed} failed)")]
    FlatsIncomplete {
        loaded: usize,
        expected: usize,
        failed: usize,
    },
    #[error("failed to start runtime: {0}")]
    Runtime(std::io::Error),
    #[error("failed to set signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// Logs each tile.
struct LogDisplay;

impl Display for LogDisplay {
    fn set_image(&mut self, tile: MosaicTile) {
        let (height, width) = tile.dim();
        info!(
            name = %tile.name(),
            detectors = ?tile.provenance.detectors,
            width,
            height,
            complete = tile.provenance.complete,
            "Tile ready"
        );
    }
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("CCD Mosaic v{}", ccd_mosaic::VERSION);

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    let instrument = config.instrument()?;
    instrument.validate()?;
    info!(
        instrument = %instrument.name,
        frames_per_exposure = instrument.frames_per_exposure,
        prefix = %instrument.keyword_prefix,
        "Configuration loaded"
    );

    let runtime = Runtime::new().map_err(CliError::Runtime)?;
    let source = Arc::new(FitsFileSource::new(
        RegionExtractor::new(&instrument.keyword_prefix).keywords(),
    ));
    let store = Arc::new(FlatStore::new());
    let loader = FlatLoader::new(
        Arc::clone(&source),
        Arc::clone(&store),
        config.flats.num_load_threads,
        runtime.handle().clone(),
    );

    if let Command::LoadFlats { dir } = &cli.command {
        let dir = dir
            .clone()
            .or_else(|| config.flats.flat_directory.clone())
            .ok_or(CliError::NoFlatDirectory)?;
        let status = runtime.block_on(loader.load(&dir, instrument.num_ccds)?.wait());
        println!(
            "Flats: {} loaded, {} failed, published: {}",
            status.loaded, status.failed, status.published
        );
        if !status.published {
            return Err(CliError::FlatsIncomplete {
                loaded: status.loaded,
                expected: status.expected,
                failed: status.failed,
            });
        }
        return Ok(());
    }

    let flats = start_flats(&config, &instrument, &loader);
    let mut pipeline = Pipeline::from_config(&config, store, source, LogDisplay)?;

    match cli.command {
        Command::Watch => {
            let (ingestor, batches) =
                Ingestor::new(config.pipeline.debounce_interval(), runtime.handle().clone());
            let ingestor = Arc::new(ingestor);
            let cancel = CancellationToken::new();

            // The reader thread owns the ingestor; the batch channel closes
            // once it has flushed at end of input.
            let on_signal = Arc::downgrade(&ingestor);
            let stop = cancel.clone();
            ctrlc::set_handler(move || {
                if let Some(ingestor) = on_signal.upgrade() {
                    ingestor.stop();
                }
                stop.cancel();
            })?;

            std::thread::spawn(move || read_paths(ingestor));
            println!("Reading frame paths from stdin. Press Ctrl+C to stop.");
            runtime.block_on(pipeline.run(batches, cancel));
        }
        Command::Process { paths } => {
            wait_for_flats(runtime.handle(), flats);
            let report = pipeline.process_batch(&paths);
            println!(
                "Processed {} of {} accepted frames ({} failed)",
                report.processed, report.accepted, report.failed
            );
        }
        Command::Exposure { dir, exposure } => {
            let exposure = FrameId::parse(&exposure)?;
            wait_for_flats(runtime.handle(), flats);
            let report = pipeline.load_exposure(&dir, &exposure)?;
            println!(
                "Exposure {}: {} processed, {} failed, complete: {}",
                exposure, report.processed, report.failed, report.complete
            );
        }
        Command::LoadFlats { .. } => {}
    }

    Ok(())
}

/// Starts the configured flat load, if any. Failures leave flat-fielding off.
fn start_flats(
    config: &FileConfig,
    instrument: &InstrumentConfig,
    loader: &FlatLoader<FitsFileSource>,
) -> Option<FlatLoadHandle> {
    if !config.flats.use_flats {
        return None;
    }
    let Some(dir) = config.flats.flat_directory.as_deref() else {
        warn!("use_flats is set but no flat_directory is configured");
        return None;
    };
    match loader.load(dir, instrument.num_ccds) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Flat load not started");
            None
        }
    }
}

fn wait_for_flats(runtime: &Handle, flats: Option<FlatLoadHandle>) {
    if let Some(handle) = flats {
        let status = runtime.block_on(handle.wait());
        if !status.published {
            warn!(loaded = status.loaded, failed = status.failed, "Continuing without flats");
        }
    }
}

/// Feeds stdin lines to the ingestor; flushes the last batch at end of input.
fn read_paths(ingestor: Arc<Ingestor>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                let line = line.trim();
                if !line.is_empty() {
                    ingestor.notify(Path::new(line));
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
    ingestor.flush();
    info!("End of input");
}
