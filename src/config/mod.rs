//! Pipeline configuration.
//!
//! Everything is read from a single TOML file. Configuration errors are the
//! only fatal errors in the system and are raised before any frame is
//! touched.

mod instrument;

pub use instrument::InstrumentConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid keyword prefix {0:?} (one upper-case letter or digit expected)")]
    InvalidPrefix(String),
    #[error("invalid instrument code {0:?} (three upper-case letters expected)")]
    InvalidInscode(String),
    #[error("frames_per_exposure must be positive")]
    InvalidFramesPerExposure,
    #[error("num_ccds must be positive")]
    InvalidCcdCount,
    #[error("num_load_threads must be positive")]
    InvalidThreadCount,
    #[error("debounce interval must be a positive number of seconds, got {0}")]
    InvalidDebounceInterval(f64),
    #[error("unknown instrument preset {0:?}")]
    UnknownPreset(String),
    #[error("detector {0} appears more than once in the offset table")]
    DuplicateOffset(u32),
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Ingestion and correction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Quiet interval after the last notification before a batch is processed.
    pub debounce_interval_seconds: f64,
    /// Subtract the per-row overscan median (otherwise only trim).
    pub subtract_bias: bool,
    /// Multiply each channel by its gain after bias removal.
    pub apply_gain: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_interval_seconds: DEFAULT_DEBOUNCE_MS as f64 / 1000.0,
            subtract_bias: true,
            apply_gain: false,
        }
    }
}

impl PipelineConfig {
    /// Debounce interval as a duration.
    ///
    /// Falls back to the default interval if the setting does not validate.
    pub fn debounce_interval(&self) -> Duration {
        self.try_debounce_interval()
            .unwrap_or_else(|_| Duration::from_millis(DEFAULT_DEBOUNCE_MS))
    }

    fn try_debounce_interval(&self) -> Result<Duration, ConfigError> {
        let secs = self.debounce_interval_seconds;
        match Duration::try_from_secs_f64(secs) {
            Ok(interval) if !interval.is_zero() => Ok(interval),
            _ => Err(ConfigError::InvalidDebounceInterval(secs)),
        }
    }

    /// Validates the pipeline settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.try_debounce_interval().map(|_| ())
    }
}

/// Flat-field settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatConfig {
    /// Divide corrected tiles by their detector's flat.
    pub use_flats: bool,
    /// Directory holding `<name>-<detector>.fits` flats.
    pub flat_directory: Option<PathBuf>,
    /// Concurrent loader groups.
    pub num_load_threads: usize,
}

impl Default for FlatConfig {
    fn default() -> Self {
        Self {
            use_flats: false,
            flat_directory: None,
            num_load_threads: 4,
        }
    }
}

impl FlatConfig {
    /// Validates the flat settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_load_threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }
        Ok(())
    }
}

/// Placement of one detector's tile in a composite mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorOffset {
    /// Detector id.
    pub detector: u32,
    /// Column of the tile's left edge.
    pub x: usize,
    /// Row of the tile's top edge.
    pub y: usize,
}

/// Composite mosaic layout. Empty means every tile is shown on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Per-detector tile offsets.
    pub offsets: Vec<DetectorOffset>,
}

impl MosaicConfig {
    /// Validates the offset table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for offset in &self.offsets {
            if !seen.insert(offset.detector) {
                return Err(ConfigError::DuplicateOffset(offset.detector));
            }
        }
        Ok(())
    }
}

/// Full configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    /// Instrument preset name, used when no `[instrument]` table is given.
    #[serde(default)]
    pub preset: Option<String>,
    /// Explicit instrument constants.
    #[serde(default)]
    pub instrument: Option<InstrumentConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub flats: FlatConfig,
    #[serde(default)]
    pub mosaic: MosaicConfig,
}

impl FileConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the instrument: explicit table, then preset, then Suprime-Cam.
    pub fn instrument(&self) -> Result<InstrumentConfig, ConfigError> {
        match (&self.instrument, &self.preset) {
            (Some(instrument), _) => Ok(instrument.clone()),
            (None, Some(preset)) => InstrumentConfig::preset(preset),
            (None, None) => Ok(InstrumentConfig::default()),
        }
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.instrument()?.validate()?;
        self.pipeline.validate()?;
        self.flats.validate()?;
        self.mosaic.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = FileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.instrument().unwrap(), InstrumentConfig::spcam());
        assert_eq!(config.pipeline.debounce_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_preset_from_toml() {
        let config = FileConfig::from_toml_str(
            r#"
            preset = "hsc"

            [flats]
            use_flats = true
            flat_directory = "/data/flats"
            num_load_threads = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.instrument().unwrap().inscode, "HSC");
        assert!(config.flats.use_flats);
        assert_eq!(config.flats.num_load_threads, 6);
    }

    #[test]
    fn test_explicit_instrument_overrides_preset() {
        let config = FileConfig::from_toml_str(
            r#"
            preset = "hsc"

            [instrument]
            keyword_prefix = "X"
            frames_per_exposure = 4

            [[mosaic.offsets]]
            detector = 0
            x = 0
            y = 0

            [[mosaic.offsets]]
            detector = 1
            x = 2048
            y = 0
            "#,
        )
        .unwrap();
        let instrument = config.instrument().unwrap();
        assert_eq!(instrument.keyword_prefix, "X");
        assert_eq!(instrument.frames_per_exposure, 4);
        assert_eq!(instrument.inscode, "SUP");
        assert_eq!(config.mosaic.offsets.len(), 2);
    }

    #[test]
    fn test_invalid_prefix_is_fatal() {
        let result = FileConfig::from_toml_str(
            r#"
            [instrument]
            keyword_prefix = "bad prefix"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidPrefix(_))));
    }

    #[test]
    fn test_zero_debounce_invalid() {
        let result = FileConfig::from_toml_str(
            r#"
            [pipeline]
            debounce_interval_seconds = 0.0
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDebounceInterval(_))
        ));
    }

    #[test]
    fn test_huge_debounce_invalid() {
        let result = FileConfig::from_toml_str(
            r#"
            [pipeline]
            debounce_interval_seconds = 1e30
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDebounceInterval(_))
        ));

        let unchecked = PipelineConfig {
            debounce_interval_seconds: 1e30,
            ..PipelineConfig::default()
        };
        assert_eq!(unchecked.debounce_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_duplicate_offset_rejected() {
        let mosaic = MosaicConfig {
            offsets: vec![
                DetectorOffset { detector: 3, x: 0, y: 0 },
                DetectorOffset { detector: 3, x: 10, y: 0 },
            ],
        };
        assert!(matches!(
            mosaic.validate(),
            Err(ConfigError::DuplicateOffset(3))
        ));
    }
}
