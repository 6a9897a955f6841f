//! FITS frame I/O on top of `fitsio`.
//!
//! Pixels come from the first 2-D image HDU in a file, so tile-compressed
//! `.fits.fz` frames (empty primary, image in an extension) read the same
//! as plain ones. cfitsio applies `BZERO`/`BSCALE`. Rows are kept in file
//! order, so array row `r` corresponds to header y coordinate `r + 1`.

mod header;
mod source;

pub use header::{Header, HeaderValue};
pub use source::{FitsFileSource, FrameSource, MemorySource};

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Keyword carrying the detector number of a frame.
pub const DETECTOR_KEYWORD: &str = "DET-ID";

/// Keywords every read fetches in addition to the caller's.
pub const STANDARD_KEYWORDS: &[&str] = &[
    DETECTOR_KEYWORD,
    "OBJECT",
    "EXP-ID",
    "FRAMEID",
    "DATE-OBS",
    "EXPTIME",
    "FILTER01",
];

/// Keywords cfitsio owns on write.
const STRUCTURAL_KEYWORDS: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BZERO", "BSCALE", "XTENSION",
    "PCOUNT", "GCOUNT", "END",
];

/// Errors that can occur while reading or writing FITS data.
#[derive(Debug, Error)]
pub enum FitsError {
    #[error("FITS error on {path}: {message}")]
    Fits { path: PathBuf, message: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} holds no 2-D image")]
    NoImage(PathBuf),
    #[error("image in {path} has {found} pixels, expected {expected}")]
    Shape {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

fn fits_error(path: &Path) -> impl FnOnce(fitsio::errors::Error) -> FitsError + '_ {
    move |e| FitsError::Fits {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct FitsImage {
    /// Keywords read from the file, plus `NAXIS1`/`NAXIS2` describing `data`.
    pub header: Header,
    /// Physical pixel values, shape `(NAXIS2, NAXIS1)`.
    pub data: Array2<f64>,
}

/// Reads the image of a frame file together with [`STANDARD_KEYWORDS`] and
/// `keywords`.
///
/// Keywords are looked up in the image HDU first, then in the primary HDU.
/// Absent keywords are left out of the header.
pub fn read_image(path: impl AsRef<Path>, keywords: &[String]) -> Result<FitsImage, FitsError> {
    let path = path.as_ref();
    let mut fptr = FitsFile::open(path).map_err(fits_error(path))?;
    let (index, hdu, height, width) = image_hdu(&mut fptr, path)?;

    let pixels: Vec<f64> = hdu.read_image(&mut fptr).map_err(fits_error(path))?;
    let expected = height.saturating_mul(width);
    let found = pixels.len();
    let data = Array2::from_shape_vec((height, width), pixels).map_err(|_| FitsError::Shape {
        path: path.to_path_buf(),
        expected,
        found,
    })?;

    let primary = if index > 0 {
        Some(fptr.primary_hdu().map_err(fits_error(path))?)
    } else {
        None
    };

    let mut header = Header::new();
    let requested = STANDARD_KEYWORDS
        .iter()
        .copied()
        .chain(keywords.iter().map(String::as_str));
    for key in requested {
        if header.contains(key) {
            continue;
        }
        let mut value = read_value(&hdu, &mut fptr, key);
        if value.is_none() {
            if let Some(primary) = &primary {
                value = read_value(primary, &mut fptr, key);
            }
        }
        if let Some(value) = value {
            header.set(key, value);
        }
    }
    header.set("NAXIS1", width as i64);
    header.set("NAXIS2", height as i64);

    Ok(FitsImage { header, data })
}

/// Finds the first HDU holding a non-empty 2-D image.
fn image_hdu(fptr: &mut FitsFile, path: &Path) -> Result<(usize, FitsHdu, usize, usize), FitsError> {
    let mut index = 0;
    while let Ok(hdu) = fptr.hdu(index) {
        if let HduInfo::ImageInfo { shape, .. } = &hdu.info {
            if let [height, width] = shape.as_slice() {
                let (height, width) = (*height, *width);
                if height > 0 && width > 0 {
                    return Ok((index, hdu, height, width));
                }
            }
        }
        index += 1;
    }
    Err(FitsError::NoImage(path.to_path_buf()))
}

fn read_value(hdu: &FitsHdu, fptr: &mut FitsFile, key: &str) -> Option<HeaderValue> {
    if let Ok(v) = hdu.read_key::<f64>(fptr, key) {
        return Some(HeaderValue::from_real(v));
    }
    hdu.read_key::<String>(fptr, key).ok().map(HeaderValue::Text)
}

/// Writes a header and image to `path` as a single `f64` primary HDU,
/// replacing any existing file.
///
/// Structural keywords in `header` are ignored; cfitsio writes ones
/// describing `data`.
pub fn write_image(
    path: impl AsRef<Path>,
    header: &Header,
    data: &Array2<f64>,
) -> Result<(), FitsError> {
    let path = path.as_ref();
    let (height, width) = data.dim();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[height, width],
    };

    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(fits_error(path))?;
    let hdu = fptr.primary_hdu().map_err(fits_error(path))?;

    let pixels: Vec<f64> = data.iter().copied().collect();
    hdu.write_image(&mut fptr, &pixels)
        .map_err(fits_error(path))?;

    for (key, value) in header.iter() {
        if STRUCTURAL_KEYWORDS.contains(&key) {
            continue;
        }
        match value {
            HeaderValue::Integer(v) => hdu.write_key(&mut fptr, key, *v),
            HeaderValue::Float(v) => hdu.write_key(&mut fptr, key, *v),
            HeaderValue::Text(v) => hdu.write_key(&mut fptr, key, v.clone()),
        }
        .map_err(fits_error(path))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_read_keeps_keywords_and_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let mut header = Header::new();
        header.set("DET-ID", 4_i64);
        header.set("S_GAIN1", 3.1);
        header.set("OBJECT", "M31");
        header.set("NAXIS1", 99_i64);
        let data = array![[1.0, 2.0, 3.0], [4.5, -5.0, 6.25]];

        write_image(&path, &header, &data).unwrap();
        let image = read_image(&path, &["S_GAIN1".to_string()]).unwrap();

        assert_eq!(image.data, data);
        assert_eq!(image.header.get_i64("DET-ID"), Some(4));
        assert_eq!(image.header.get_f64("S_GAIN1"), Some(3.1));
        assert_eq!(
            image.header.get("OBJECT"),
            Some(&HeaderValue::Text("M31".to_string()))
        );
        assert_eq!(image.header.get_i64("NAXIS1"), Some(3));
        assert_eq!(image.header.get_i64("NAXIS2"), Some(2));
        assert!(!image.header.contains("FRAMEID"));
    }

    #[test]
    fn test_image_in_extension_after_empty_primary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        {
            let mut fptr = FitsFile::create(&path).open().unwrap();
            let primary = fptr.primary_hdu().unwrap();
            primary.write_key(&mut fptr, "DET-ID", 7_i64).unwrap();

            let description = ImageDescription {
                data_type: ImageType::Double,
                dimensions: &[2, 4],
            };
            let hdu = fptr.create_image("SCI".to_string(), &description).unwrap();
            hdu.write_image(&mut fptr, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])
                .unwrap();
            hdu.write_key(&mut fptr, "S_GAIN1", 2.5).unwrap();
        }

        let image = read_image(&path, &["S_GAIN1".to_string()]).unwrap();
        assert_eq!(image.data.dim(), (2, 4));
        assert_eq!(image.data[[1, 0]], 4.0);
        assert_eq!(image.header.get_i64("DET-ID"), Some(7));
        assert_eq!(image.header.get_f64("S_GAIN1"), Some(2.5));
    }

    #[test]
    fn test_file_without_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.fits");
        FitsFile::create(&path).open().unwrap();

        assert!(matches!(
            read_image(&path, &[]),
            Err(FitsError::NoImage(p)) if p == path
        ));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.fits");
        let mut bytes = format!("{:<80}", "SIMPLE  =                    T").into_bytes();
        bytes.extend_from_slice(format!("{:<80}", "BITPIX  =                  -64").as_bytes());
        bytes.extend_from_slice(format!("{:<80}", "NAXIS   =                    2").as_bytes());
        bytes.extend_from_slice(format!("{:<80}", "NAXIS1  =                   -5").as_bytes());
        bytes.extend_from_slice(format!("{:<80}", "NAXIS2  =  9223372036854775807").as_bytes());
        bytes.extend_from_slice(format!("{:<80}", "END").as_bytes());
        bytes.resize(2880, b' ');
        std::fs::write(&path, bytes).unwrap();

        assert!(read_image(&path, &[]).is_err());

        std::fs::write(&path, b"not a fits file").unwrap();
        assert!(matches!(
            read_image(&path, &[]),
            Err(FitsError::Fits { .. })
        ));
    }
}
