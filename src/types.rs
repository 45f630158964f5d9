//! Shared value types

use crate::error::{FuseError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Aspect ratios accepted by the Stability AI generate endpoints
pub const STABILITY_ASPECT_RATIOS: &[AspectRatio] = &[
    AspectRatio::new_const(21, 9),
    AspectRatio::new_const(16, 9),
    AspectRatio::new_const(3, 2),
    AspectRatio::new_const(5, 4),
    AspectRatio::new_const(1, 1),
    AspectRatio::new_const(4, 5),
    AspectRatio::new_const(2, 3),
    AspectRatio::new_const(9, 16),
    AspectRatio::new_const(9, 21),
];

/// Largest ratio between the long and the short side
const MAX_ELONGATION: f64 = 8.0;

/// Output aspect ratio such as `16:9`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    /// Create an aspect ratio, rejecting zero or extreme values
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FuseError::invalid_request(format!(
                "Aspect ratio components must be positive, got {}:{}",
                width, height
            )));
        }
        let ratio = Self { width, height };
        let value = ratio.value();
        if !(1.0 / MAX_ELONGATION..=MAX_ELONGATION).contains(&value) {
            return Err(FuseError::invalid_request(format!(
                "Aspect ratio {} is outside the supported range 1:8 to 8:1",
                ratio
            )));
        }
        Ok(ratio)
    }

    const fn new_const(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width divided by height
    pub fn value(&self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }

    pub fn is_stability_supported(&self) -> bool {
        STABILITY_ASPECT_RATIOS
            .iter()
            .any(|r| u64::from(r.width) * u64::from(self.height) == u64::from(r.height) * u64::from(self.width))
    }

    /// Supported Stability ratio closest to `width x height` on a log scale
    pub fn nearest_stability(width: u32, height: u32) -> Self {
        let target = (f64::from(width.max(1)) / f64::from(height.max(1))).ln();
        STABILITY_ASPECT_RATIOS
            .iter()
            .copied()
            .min_by(|a, b| {
                let da = (a.value().ln() - target).abs();
                let db = (b.value().ln() - target).abs();
                da.total_cmp(&db)
            })
            .unwrap_or(Self::new_const(1, 1))
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = FuseError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (w, h) = trimmed
            .split_once(':')
            .or_else(|| trimmed.split_once('/'))
            .ok_or_else(|| {
                FuseError::invalid_request(format!(
                    "Invalid aspect ratio '{}', expected the form W:H (e.g. 16:9)",
                    s
                ))
            })?;
        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                FuseError::invalid_request(format!(
                    "Invalid aspect ratio '{}', components must be integers",
                    s
                ))
            })
        };
        Self::new(parse(w)?, parse(h)?)
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = FuseError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.to_string()
    }
}

/// How the foreground is color-matched to the background before compositing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMatch {
    /// Composite the cutout untouched
    None,
    /// Replace the cutout's chroma with the background's dominant color
    #[default]
    Tint,
    /// Soft-light blend the dominant color over the cutout
    SoftLight,
}

impl std::fmt::Display for ColorMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Tint => write!(f, "tint"),
            Self::SoftLight => write!(f, "soft-light"),
        }
    }
}

impl FromStr for ColorMatch {
    type Err = FuseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "tint" => Ok(Self::Tint),
            "soft-light" | "softlight" | "soft_light" => Ok(Self::SoftLight),
            other => Err(FuseError::invalid_request(format!(
                "Unknown color match mode '{}'. Expected 'none', 'tint' or 'soft-light'",
                other
            ))),
        }
    }
}
