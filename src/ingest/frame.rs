//! Frame identity parsed from a file path.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of decimal digits in a frame number.
const FRAME_DIGITS: usize = 8;

/// Errors produced when a path does not name a camera frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameIdError {
    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("file name {0:?} is not <INS><TYPE><8 digits>")]
    BadFormat(String),
}

/// The `<INS><T><NNNNNNNN>` identity of a frame, e.g. `SUPA01234567`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId {
    /// Three-letter instrument code.
    pub inscode: String,
    /// Frame type letter (`A` for science, `Q` for quick-look).
    pub frame_type: char,
    /// Monotonic frame number.
    pub number: u64,
}

impl FrameId {
    /// Parses a frame id from a file-name stem.
    pub fn parse(name: &str) -> Result<Self, FrameIdError> {
        let bad = || FrameIdError::BadFormat(name.to_string());

        if name.len() != 4 + FRAME_DIGITS || !name.is_ascii() {
            return Err(bad());
        }
        let inscode = &name[..3];
        let frame_type = name[3..4].chars().next().ok_or_else(bad)?;
        let digits = &name[4..];

        if !inscode.chars().all(|c| c.is_ascii_uppercase())
            || !frame_type.is_ascii_uppercase()
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(bad());
        }

        Ok(Self {
            inscode: inscode.to_string(),
            frame_type,
            number: digits.parse().map_err(|_| bad())?,
        })
    }

    /// Returns the id with a different frame number.
    pub fn with_number(&self, number: u64) -> Self {
        Self {
            number,
            ..self.clone()
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:0width$}",
            self.inscode,
            self.frame_type,
            self.number,
            width = FRAME_DIGITS
        )
    }
}

/// One on-disk capture unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    path: PathBuf,
    id: FrameId,
    detector_id: u32,
}

impl Frame {
    /// Parses a frame from its path.
    ///
    /// The detector id is the frame number modulo `frames_per_exposure`.
    pub fn from_path(path: impl AsRef<Path>, frames_per_exposure: u64) -> Result<Self, FrameIdError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FrameIdError::NoFileName(path.to_path_buf()))?;
        let stem = name.split('.').next().unwrap_or(name);
        let id = FrameId::parse(stem)?;
        let detector_id = (id.number % frames_per_exposure.max(1)) as u32;

        Ok(Self {
            path: path.to_path_buf(),
            id,
            detector_id,
        })
    }

    /// Path the frame was read from.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frame identity.
    #[inline]
    pub fn id(&self) -> &FrameId {
        &self.id
    }

    /// Instrument code.
    #[inline]
    pub fn inscode(&self) -> &str {
        &self.id.inscode
    }

    /// Frame number.
    #[inline]
    pub fn number(&self) -> u64 {
        self.id.number
    }

    /// Detector id derived from the frame number.
    #[inline]
    pub fn detector_id(&self) -> u32 {
        self.detector_id
    }

    /// First frame number of the exposure this frame belongs to.
    pub fn exposure_number(&self, frames_per_exposure: u64) -> u64 {
        let fpe = frames_per_exposure.max(1);
        (self.id.number / fpe) * fpe
    }

    /// Id of the exposure this frame belongs to.
    pub fn exposure_id(&self, frames_per_exposure: u64) -> FrameId {
        self.id.with_number(self.exposure_number(frames_per_exposure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_path() {
        let frame = Frame::from_path("/data/SPCAM/SUPA01234567.fits", 10).unwrap();
        assert_eq!(frame.inscode(), "SUP");
        assert_eq!(frame.id().frame_type, 'A');
        assert_eq!(frame.number(), 1234567);
        assert_eq!(frame.detector_id(), 7);
        assert_eq!(frame.exposure_number(10), 1234560);
        assert_eq!(frame.exposure_id(10).to_string(), "SUPA01234560");
    }

    #[test]
    fn test_compressed_extension() {
        let frame = Frame::from_path("HSCA00012345.fits.fz", 112).unwrap();
        assert_eq!(frame.number(), 12345);
    }

    #[test]
    fn test_bad_names() {
        for name in ["notes.txt", "SUPA123.fits", "supa01234567.fits", "SUPA0123456X.fits"] {
            assert!(
                matches!(Frame::from_path(name, 10), Err(FrameIdError::BadFormat(_))),
                "{name} should not parse"
            );
        }
    }
}
