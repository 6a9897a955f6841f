//! Channel geometry from frame headers.
//!
//! Each frame carries four readout channels. For every channel the header
//! gives the effective-pixel and overscan rectangles (1-based, inclusive)
//! and a gain. Channels are laid out left to right in the corrected tile in
//! order of their effective-region right edge, whatever order the header
//! lists them in.

use crate::fits::Header;
use thiserror::Error;

/// Readout channels per frame.
pub const NUM_CHANNELS: usize = 4;

/// Errors raised while reading channel geometry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegionError {
    #[error("malformed metadata: keyword {keyword} is missing")]
    MissingKeyword { keyword: String },
    #[error("malformed metadata: keyword {keyword} has unusable value {value}")]
    InvalidValue { keyword: String, value: String },
    #[error("malformed metadata: channel {channel} {axis} range {min}..{max} is inverted")]
    InvertedRange {
        channel: usize,
        axis: &'static str,
        min: usize,
        max: usize,
    },
    #[error("malformed metadata: channel sizes overflow")]
    SizeOverflow,
}

/// Geometry of one readout channel, 0-based inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    /// Channel number, 1..=4.
    pub channel: usize,
    pub efmin_x: usize,
    pub efmax_x: usize,
    pub efmin_y: usize,
    pub efmax_y: usize,
    pub osmin_x: usize,
    pub osmax_x: usize,
    pub osmin_y: usize,
    pub osmax_y: usize,
    /// Gain in e-/ADU.
    pub gain: f64,
    /// Column of the channel's left edge in the corrected tile.
    pub start_pos_x: usize,
}

impl Region {
    /// Width of the effective-pixel area.
    #[inline]
    pub fn effective_width(&self) -> usize {
        self.efmax_x + 1 - self.efmin_x
    }

    /// Height of the effective-pixel area.
    #[inline]
    pub fn effective_height(&self) -> usize {
        self.efmax_y + 1 - self.efmin_y
    }

    /// Width of the overscan strip.
    #[inline]
    pub fn overscan_width(&self) -> usize {
        self.osmax_x + 1 - self.osmin_x
    }

    /// Height of the overscan strip.
    #[inline]
    pub fn overscan_height(&self) -> usize {
        self.osmax_y + 1 - self.osmin_y
    }
}

/// Geometry of a whole frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGeometry {
    /// Channels in channel-number order (1, 2, 3, 4).
    pub channels: [Region; NUM_CHANNELS],
    /// Total overscan columns removed.
    pub x_cut: usize,
    /// Overscan rows removed.
    pub y_cut: usize,
    /// Width of the corrected tile.
    pub new_width: usize,
    /// Height of the corrected tile.
    pub new_height: usize,
}

impl ImageGeometry {
    /// Channels ordered left to right as they appear in the corrected tile.
    pub fn channels_by_position(&self) -> [Region; NUM_CHANNELS] {
        let mut ordered = self.channels;
        ordered.sort_by_key(|r| r.start_pos_x);
        ordered
    }
}

/// Reads [`ImageGeometry`] from headers using an instrument keyword prefix.
#[derive(Debug, Clone)]
pub struct RegionExtractor {
    prefix: String,
}

impl RegionExtractor {
    /// Creates an extractor for keywords of the form `<prefix>_EFMN11`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Keyword prefix in use.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of a region keyword, e.g. `bound_keyword("EF", "MN", 2, 1)` → `S_EFMN21`.
    pub fn bound_keyword(&self, area: &str, bound: &str, channel: usize, axis: usize) -> String {
        format!("{}_{area}{bound}{channel}{axis}", self.prefix)
    }

    /// Name of a channel's gain keyword.
    pub fn gain_keyword(&self, channel: usize) -> String {
        format!("{}_GAIN{channel}", self.prefix)
    }

    /// Every keyword [`RegionExtractor::extract`] reads.
    pub fn keywords(&self) -> Vec<String> {
        let mut keywords = Vec::with_capacity(NUM_CHANNELS * 9);
        for channel in 1..=NUM_CHANNELS {
            for area in ["EF", "OS"] {
                for bound in ["MN", "MX"] {
                    for axis in 1..=2 {
                        keywords.push(self.bound_keyword(area, bound, channel, axis));
                    }
                }
            }
            keywords.push(self.gain_keyword(channel));
        }
        keywords
    }

    /// Extracts the geometry of all four channels.
    pub fn extract(&self, header: &Header) -> Result<ImageGeometry, RegionError> {
        let mut channels = Vec::with_capacity(NUM_CHANNELS);
        for channel in 1..=NUM_CHANNELS {
            channels.push(self.read_channel(header, channel)?);
        }

        // Assign left-to-right positions by effective right edge.
        let mut order: Vec<usize> = (0..NUM_CHANNELS).collect();
        order.sort_by_key(|&i| channels[i].efmax_x);
        let mut start_pos_x: usize = 0;
        for i in order {
            channels[i].start_pos_x = start_pos_x;
            start_pos_x = start_pos_x
                .checked_add(channels[i].effective_width())
                .ok_or(RegionError::SizeOverflow)?;
        }

        let x_cut = checked_total(channels.iter().map(Region::overscan_width))?;
        let new_width = start_pos_x;
        let last = channels[NUM_CHANNELS - 1];

        let channels: [Region; NUM_CHANNELS] = [channels[0], channels[1], channels[2], channels[3]];

        Ok(ImageGeometry {
            channels,
            x_cut,
            y_cut: last.overscan_height(),
            new_width,
            new_height: last.effective_height(),
        })
    }

    fn read_channel(&self, header: &Header, channel: usize) -> Result<Region, RegionError> {
        let bound = |area: &str, bound: &str, axis: usize| {
            self.read_bound(header, &self.bound_keyword(area, bound, channel, axis))
        };

        let region = Region {
            channel,
            efmin_x: bound("EF", "MN", 1)?,
            efmax_x: bound("EF", "MX", 1)?,
            efmin_y: bound("EF", "MN", 2)?,
            efmax_y: bound("EF", "MX", 2)?,
            osmin_x: bound("OS", "MN", 1)?,
            osmax_x: bound("OS", "MX", 1)?,
            osmin_y: bound("OS", "MN", 2)?,
            osmax_y: bound("OS", "MX", 2)?,
            gain: self.read_gain(header, channel)?,
            start_pos_x: 0,
        };

        let checks = [
            ("effective x", region.efmin_x, region.efmax_x),
            ("effective y", region.efmin_y, region.efmax_y),
            ("overscan x", region.osmin_x, region.osmax_x),
            ("overscan y", region.osmin_y, region.osmax_y),
        ];
        for (axis, min, max) in checks {
            if min > max {
                return Err(RegionError::InvertedRange {
                    channel,
                    axis,
                    min,
                    max,
                });
            }
        }

        Ok(region)
    }

    /// Reads a 1-based pixel coordinate and returns it 0-based.
    fn read_bound(&self, header: &Header, keyword: &str) -> Result<usize, RegionError> {
        let value = header.get(keyword).ok_or_else(|| RegionError::MissingKeyword {
            keyword: keyword.to_string(),
        })?;
        match value.as_i64() {
            Some(v) if v >= 1 => Ok((v - 1) as usize),
            _ => Err(RegionError::InvalidValue {
                keyword: keyword.to_string(),
                value: format!("{value:?}"),
            }),
        }
    }

    fn read_gain(&self, header: &Header, channel: usize) -> Result<f64, RegionError> {
        let keyword = self.gain_keyword(channel);
        let value = header.get(&keyword).ok_or_else(|| RegionError::MissingKeyword {
            keyword: keyword.clone(),
        })?;
        match value.as_f64() {
            Some(g) if g.is_finite() => Ok(g),
            _ => Err(RegionError::InvalidValue {
                keyword,
                value: format!("{value:?}"),
            }),
        }
    }
}

fn checked_total(mut values: impl Iterator<Item = usize>) -> Result<usize, RegionError> {
    values.try_fold(0usize, |acc, v| acc.checked_add(v).ok_or(RegionError::SizeOverflow))
}
