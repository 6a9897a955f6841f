//! Instrument geometry presets.
//!
//! Camera variants differ only in their frame-id code, header keyword
//! prefix and a few constants, so each one is a record rather than a type.

use super::ConfigError;
use serde::{Deserialize, Serialize};

/// Camera-specific constants consumed by the generic pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Human-readable name.
    pub name: String,
    /// Three-letter instrument code at the start of each frame id.
    pub inscode: String,
    /// Prefix of the per-channel region keywords (`<PFX>_EFMN11` ...).
    pub keyword_prefix: String,
    /// Frames written per exposure; also the detector id modulus.
    pub frames_per_exposure: u64,
    /// Number of detectors with a flat field.
    pub num_ccds: usize,
    /// Field of view in degrees.
    pub fov_deg: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self::spcam()
    }
}

impl InstrumentConfig {
    /// Suprime-Cam: ten 4-channel CCDs.
    pub fn spcam() -> Self {
        Self {
            name: "SPCAM".to_string(),
            inscode: "SUP".to_string(),
            keyword_prefix: "S".to_string(),
            frames_per_exposure: 10,
            num_ccds: 10,
            fov_deg: 0.72,
        }
    }

    /// Hyper Suprime-Cam science array.
    pub fn hsc() -> Self {
        Self {
            name: "HSC".to_string(),
            inscode: "HSC".to_string(),
            keyword_prefix: "T".to_string(),
            frames_per_exposure: 112,
            num_ccds: 112,
            fov_deg: 2.0,
        }
    }

    /// Looks up a preset by (case-insensitive) name.
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "spcam" | "sup" => Ok(Self::spcam()),
            "hsc" => Ok(Self::hsc()),
            _ => Err(ConfigError::UnknownPreset(name.to_string())),
        }
    }

    /// Validates the instrument constants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix_ok = !self.keyword_prefix.is_empty()
            && self
                .keyword_prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        // longest generated keyword is `<PFX>_EFMN11`
        if !prefix_ok || self.keyword_prefix.len() + 7 > 8 {
            return Err(ConfigError::InvalidPrefix(self.keyword_prefix.clone()));
        }
        if self.inscode.len() != 3 || !self.inscode.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConfigError::InvalidInscode(self.inscode.clone()));
        }
        if self.frames_per_exposure == 0 {
            return Err(ConfigError::InvalidFramesPerExposure);
        }
        if self.num_ccds == 0 {
            return Err(ConfigError::InvalidCcdCount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(InstrumentConfig::spcam().validate().is_ok());
        assert!(InstrumentConfig::hsc().validate().is_ok());
        assert_eq!(InstrumentConfig::preset("HSC").unwrap().keyword_prefix, "T");
    }

    #[test]
    fn test_bad_prefix_rejected() {
        for prefix in ["", "s", "SS", "S-"] {
            let config = InstrumentConfig {
                keyword_prefix: prefix.to_string(),
                ..InstrumentConfig::spcam()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidPrefix(_))),
                "prefix {prefix:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            InstrumentConfig::preset("focas"),
            Err(ConfigError::UnknownPreset(_))
        ));
    }
}
