//! Overscan bias removal.
//!
//! The bias level drifts from row to row, so each row of each channel is
//! corrected by the median of that row's overscan pixels. The corrected
//! effective-pixel blocks are packed side by side into a tile with no
//! overscan left in it.

use super::regions::{ImageGeometry, Region, RegionExtractor, NUM_CHANNELS};
use crate::fits::Header;
use ndarray::{s, Array2, ArrayView2};
use thiserror::Error;

/// Errors raised while correcting a frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrectionError {
    #[error("region mismatch in channel {channel}: {detail}")]
    RegionMismatch { channel: usize, detail: String },
}

impl CorrectionError {
    fn mismatch(channel: usize, detail: impl Into<String>) -> Self {
        CorrectionError::RegionMismatch {
            channel,
            detail: detail.into(),
        }
    }
}

/// Removes per-row overscan bias and trims frames to their effective pixels.
#[derive(Debug, Clone)]
pub struct OverscanCorrector {
    keywords: RegionExtractor,
    subtract_bias: bool,
    apply_gain: bool,
}

impl OverscanCorrector {
    /// Creates a corrector that rewrites `<prefix>_EF*` keywords.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            keywords: RegionExtractor::new(prefix),
            subtract_bias: true,
            apply_gain: false,
        }
    }

    /// Enables or disables bias subtraction (trimming always happens).
    pub fn with_bias_subtraction(mut self, enabled: bool) -> Self {
        self.subtract_bias = enabled;
        self
    }

    /// Enables or disables multiplying each channel by its gain.
    pub fn with_gain(mut self, enabled: bool) -> Self {
        self.apply_gain = enabled;
        self
    }

    /// Produces the corrected `(new_height, new_width)` tile.
    ///
    /// When `header` is given, its effective-region keywords and image size
    /// are rewritten to describe the trimmed tile.
    pub fn correct<A>(
        &self,
        raw: ArrayView2<'_, A>,
        geometry: &ImageGeometry,
        header: Option<&mut Header>,
    ) -> Result<Array2<f64>, CorrectionError>
    where
        A: Copy + Into<f64>,
    {
        for region in &geometry.channels {
            check_in_frame(raw.dim(), region)?;
        }
        if geometry.new_height > raw.nrows() || geometry.new_width > NUM_CHANNELS * raw.ncols() {
            return Err(CorrectionError::mismatch(
                NUM_CHANNELS,
                format!(
                    "{}x{} tile is larger than the {}x{} frame",
                    geometry.new_height,
                    geometry.new_width,
                    raw.nrows(),
                    raw.ncols()
                ),
            ));
        }

        let mut out = Array2::<f64>::zeros((geometry.new_height, geometry.new_width));

        for region in &geometry.channels {
            let medians = row_medians(raw, region)?;
            let efwd = region.effective_width();
            let efht = region.effective_height();

            if efht > geometry.new_height || region.start_pos_x + efwd > geometry.new_width {
                return Err(CorrectionError::mismatch(
                    region.channel,
                    format!(
                        "{efht}x{efwd} block at column {} does not fit the {}x{} tile",
                        region.start_pos_x, geometry.new_height, geometry.new_width
                    ),
                ));
            }

            let block = raw.slice(s![
                region.efmin_y..=region.efmax_y,
                region.efmin_x..=region.efmax_x
            ]);
            let mut target = out.slice_mut(s![
                0..efht,
                region.start_pos_x..region.start_pos_x + efwd
            ]);

            let scale = if self.apply_gain { region.gain } else { 1.0 };
            for ((mut out_row, in_row), &median) in target
                .outer_iter_mut()
                .zip(block.outer_iter())
                .zip(medians.iter())
            {
                let bias = if self.subtract_bias { median } else { 0.0 };
                for (o, &v) in out_row.iter_mut().zip(in_row.iter()) {
                    *o = (v.into() - bias) * scale;
                }
            }

            tracing::trace!(
                channel = region.channel,
                start_pos_x = region.start_pos_x,
                width = efwd,
                height = efht,
                "Corrected channel"
            );
        }

        if let Some(header) = header {
            self.rewrite_header(header, geometry);
        }

        Ok(out)
    }

    /// Rewrites effective-region keywords for the trimmed coordinate system.
    pub fn rewrite_header(&self, header: &mut Header, geometry: &ImageGeometry) {
        for region in &geometry.channels {
            let ch = region.channel;
            let left = region.start_pos_x as i64;
            let kw = |bound: &str, axis: usize| self.keywords.bound_keyword("EF", bound, ch, axis);

            header.set(&kw("MN", 1), left + 1);
            header.set(&kw("MX", 1), left + region.effective_width() as i64);
            header.set(&kw("MN", 2), 1_i64);
            header.set(&kw("MX", 2), region.effective_height() as i64);
        }
        header.set("NAXIS1", geometry.new_width as i64);
        header.set("NAXIS2", geometry.new_height as i64);
    }
}

/// The effective block must lie inside the frame.
fn check_in_frame((height, width): (usize, usize), region: &Region) -> Result<(), CorrectionError> {
    if region.efmax_x >= width {
        return Err(CorrectionError::mismatch(
            region.channel,
            format!(
                "effective columns end at {} but the frame is {width} wide",
                region.efmax_x + 1
            ),
        ));
    }
    if region.efmax_y >= height {
        return Err(CorrectionError::mismatch(
            region.channel,
            format!(
                "effective rows end at {} but the frame is {height} high",
                region.efmax_y + 1
            ),
        ));
    }
    Ok(())
}

/// Median of each overscan row over the channel's effective rows.
///
/// Rows and columns are clipped to the frame, so header geometry that runs
/// off the array shows up as a row-count mismatch.
pub fn row_medians<A>(raw: ArrayView2<'_, A>, region: &Region) -> Result<Vec<f64>, CorrectionError>
where
    A: Copy + Into<f64>,
{
    let (height, width) = raw.dim();
    let row_hi = (region.efmax_y + 1).min(height);
    let row_lo = region.efmin_y.min(row_hi);
    let col_hi = (region.osmax_x + 1).min(width);
    let col_lo = region.osmin_x.min(col_hi);

    if col_lo == col_hi {
        return Err(CorrectionError::mismatch(
            region.channel,
            format!(
                "overscan columns {}..={} lie outside the {width}-column frame",
                region.osmin_x + 1,
                region.osmax_x + 1
            ),
        ));
    }

    let overscan = raw.slice(s![row_lo..row_hi, col_lo..col_hi]);
    let mut scratch = Vec::with_capacity(col_hi - col_lo);
    let medians: Vec<f64> = overscan
        .outer_iter()
        .map(|row| {
            scratch.clear();
            scratch.extend(row.iter().map(|&v| v.into()));
            median(&mut scratch)
        })
        .collect();

    let expected = region.effective_height();
    if medians.len() != expected {
        return Err(CorrectionError::mismatch(
            region.channel,
            format!(
                "median array length ({}) doesn't match effective pixel height ({expected})",
                medians.len()
            ),
        ));
    }

    Ok(medians)
}

/// Median of a non-empty slice; the slice is reordered.
fn median(values: &mut [f64]) -> f64 {
    values.sort_unstable_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::super::regions::tests::{header_for, strip_layout};
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    /// Builds a raw frame for a strip layout: effective pixels are
    /// `effective + row`, overscan pixels `overscan + row`.
    fn synthetic_frame(
        width: i64,
        os: i64,
        height: i64,
        effective: f64,
        overscan: f64,
    ) -> Array2<f64> {
        let cols = (4 * (width + os)) as usize;
        Array2::from_shape_fn((height as usize, cols), |(row, col)| {
            let in_overscan = (col as i64) % (width + os) >= width;
            let base = if in_overscan { overscan } else { effective };
            base + row as f64
        })
    }

    fn geometry(width: i64, os: i64, height: i64, order: [i64; 4]) -> ImageGeometry {
        RegionExtractor::new("S")
            .extract(&header_for("S", &strip_layout(width, os, height, order)))
            .unwrap()
    }

    #[test]
    fn test_uniform_overscan_is_exact() {
        let raw = synthetic_frame(16, 4, 12, 100.0, 50.0);
        let geometry = geometry(16, 4, 12, [0, 1, 2, 3]);

        let out = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, None)
            .unwrap();

        assert_eq!(out.dim(), (12, 64));
        assert!(out.iter().all(|&v| v == 50.0));
    }

    #[test]
    fn test_integer_input() {
        let raw = synthetic_frame(8, 3, 6, 1000.0, 900.0).mapv(|v| v as u16);
        let geometry = geometry(8, 3, 6, [2, 0, 3, 1]);

        let out = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, None)
            .unwrap();
        assert!(out.iter().all(|&v| v == 100.0));
    }

    #[test]
    fn test_channels_land_in_physical_order() {
        // mark each channel's effective pixels with its slot number
        let (width, os, height) = (5_i64, 2_i64, 3_i64);
        let cols = (4 * (width + os)) as usize;
        let raw = Array2::from_shape_fn((height as usize, cols), |(_, col)| {
            let slot = col as i64 / (width + os);
            if (col as i64) % (width + os) >= width {
                0.0
            } else {
                slot as f64 * 10.0
            }
        });
        let geometry = geometry(width, os, height, [3, 1, 0, 2]);

        let out = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, None)
            .unwrap();
        for slot in 0..4 {
            let col = slot * width as usize;
            assert_eq!(out[[0, col]], slot as f64 * 10.0);
        }
    }

    #[test]
    fn test_even_overscan_median_averages() {
        let raw = Array2::from_shape_fn((2, 12), |(_, col)| match col {
            0 | 3 | 6 | 9 => 10.0,
            1 | 4 | 7 | 10 => 1.0,
            _ => 3.0,
        });
        // each channel: one effective column followed by two overscan columns
        let geometry = geometry(1, 2, 2, [0, 1, 2, 3]);

        let out = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, None)
            .unwrap();
        assert_relative_eq!(out[[0, 0]], 8.0);
    }

    #[test]
    fn test_rows_past_frame_are_mismatch() {
        let raw = synthetic_frame(8, 2, 6, 100.0, 50.0);
        let geometry = geometry(8, 2, 10, [0, 1, 2, 3]);

        let err = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, None)
            .unwrap_err();
        assert!(matches!(err, CorrectionError::RegionMismatch { channel: 1, .. }));
    }

    #[test]
    fn test_oversized_header_geometry_is_mismatch() {
        let raw = synthetic_frame(4, 2, 3, 100.0, 50.0);
        let mut header = header_for("S", &strip_layout(4, 2, 3, [0, 1, 2, 3]));
        header.set("S_EFMX11", 4e18);
        let geometry = RegionExtractor::new("S").extract(&header).unwrap();

        let err = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, Some(&mut header))
            .unwrap_err();
        assert!(matches!(err, CorrectionError::RegionMismatch { channel: 1, .. }));
        assert_eq!(header.get_f64("S_EFMX11"), Some(4e18));
    }

    #[test]
    fn test_overscan_outside_frame_is_mismatch() {
        let raw = synthetic_frame(8, 2, 6, 100.0, 50.0);
        let mut geometry = geometry(8, 2, 6, [0, 1, 2, 3]);
        geometry.channels[3].osmin_x = 100;
        geometry.channels[3].osmax_x = 110;

        let err = OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, None)
            .unwrap_err();
        assert!(matches!(err, CorrectionError::RegionMismatch { channel: 4, .. }));
    }

    #[test]
    fn test_trim_only_and_gain() {
        let raw = synthetic_frame(4, 2, 3, 100.0, 50.0);
        let geometry = geometry(4, 2, 3, [0, 1, 2, 3]);

        let trimmed = OverscanCorrector::new("S")
            .with_bias_subtraction(false)
            .correct(raw.view(), &geometry, None)
            .unwrap();
        assert_eq!(trimmed[[2, 0]], 102.0);

        // slot 1 has gain 1.1 in the strip layout
        let scaled = OverscanCorrector::new("S")
            .with_gain(true)
            .correct(raw.view(), &geometry, None)
            .unwrap();
        assert_relative_eq!(scaled[[0, 4]], 55.0, epsilon = 1e-9);
    }

    #[test]
    fn test_header_rewritten_to_trimmed_coordinates() {
        let mut header = header_for("S", &strip_layout(8, 2, 6, [1, 0, 3, 2]));
        let geometry = RegionExtractor::new("S").extract(&header).unwrap();
        let raw = synthetic_frame(8, 2, 6, 100.0, 50.0);

        OverscanCorrector::new("S")
            .correct(raw.view(), &geometry, Some(&mut header))
            .unwrap();

        // channel 1 sits in slot 1, so it starts at column 9 (1-based)
        assert_eq!(header.get_i64("S_EFMN11"), Some(9));
        assert_eq!(header.get_i64("S_EFMX11"), Some(16));
        assert_eq!(header.get_i64("S_EFMN21"), Some(1));
        assert_eq!(header.get_i64("S_EFMX32"), Some(6));
        assert_eq!(header.get_i64("NAXIS1"), Some(32));

        let reread = RegionExtractor::new("S").extract(&header);
        assert!(reread.is_ok());
    }

    proptest! {
        #[test]
        fn prop_uniform_overscan_rows_give_constant_offset(
            width in 1i64..12,
            os in 1i64..6,
            height in 1i64..12,
            effective in 0.0f64..5000.0,
            offset in 0.0f64..500.0,
        ) {
            let raw = synthetic_frame(width, os, height, effective, effective - offset);
            let geometry = geometry(width, os, height, [0, 1, 2, 3]);
            let out = OverscanCorrector::new("S")
                .correct(raw.view(), &geometry, None)
                .unwrap();
            for &v in out.iter() {
                prop_assert!((v - offset).abs() < 1e-9);
            }
        }
    }
}
