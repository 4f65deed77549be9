use crate::error::SiftError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters for [`detect`](crate::detect).
///
/// `thresh` is expressed in intensity units of the input image. Images built with
/// [`SiftImage::from_gray`](crate::SiftImage::from_gray) are scaled to `[0, 1]`, which is what the
/// default assumes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct DetectorConfig {
    /// Upper bound on the number of octaves. Octaves whose smaller side would drop below 16
    /// pixels are not built.
    pub num_octaves: usize,
    /// Blur already present in the input image, in input pixels.
    pub init_blur: f32,
    /// Lower bound on `|DoG|`, both for the raw extremum and its interpolated value.
    pub thresh: f32,
    /// Keypoints with a smaller scale (in input pixels) are dropped.
    pub lowest_scale: f32,
    /// Upsample the input 2x before building the pyramid.
    pub upsample: bool,
    /// Blur of the first layer of every octave, in that octave's pixels.
    pub base_sigma: f32,
    /// Principal curvature ratio `r`. Extrema with `tr² / det >= (r + 1)² / r` are edges.
    pub edge_limit: f32,
    pub max_interpolation_steps: usize,
    /// Secondary orientation peaks at least this fraction of the dominant one spawn an
    /// additional keypoint.
    pub orientation_peak_ratio: f32,
    /// Descriptor components are clipped to this value after the first normalization.
    pub descriptor_clip: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_octaves: 5,
            init_blur: 1.0,
            thresh: 0.01,
            lowest_scale: 0.0,
            upsample: false,
            base_sigma: 1.6,
            edge_limit: 10.0,
            max_interpolation_steps: 5,
            orientation_peak_ratio: 0.8,
            descriptor_clip: 0.2,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), SiftError> {
        if self.num_octaves == 0 {
            return Err(invalid("num_octaves must be at least 1"));
        }
        if !(self.init_blur >= 0.0 && self.init_blur.is_finite()) {
            return Err(invalid("init_blur must be finite and non-negative"));
        }
        if !(self.thresh >= 0.0 && self.thresh.is_finite()) {
            return Err(invalid("thresh must be finite and non-negative"));
        }
        if !self.lowest_scale.is_finite() {
            return Err(invalid("lowest_scale must be finite"));
        }
        if !(self.base_sigma > 0.0 && self.base_sigma.is_finite()) {
            return Err(invalid("base_sigma must be positive"));
        }
        if !(self.edge_limit >= 1.0 && self.edge_limit.is_finite()) {
            return Err(invalid("edge_limit must be at least 1"));
        }
        if self.max_interpolation_steps == 0 {
            return Err(invalid("max_interpolation_steps must be at least 1"));
        }
        if !(self.orientation_peak_ratio > 0.0 && self.orientation_peak_ratio <= 1.0) {
            return Err(invalid("orientation_peak_ratio must be in (0, 1]"));
        }
        if !(self.descriptor_clip > 0.0 && self.descriptor_clip <= 1.0) {
            return Err(invalid("descriptor_clip must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Parameters for [`estimate_homography`](crate::estimate_homography).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct RansacConfig {
    /// Number of minimal samples drawn.
    pub num_loops: usize,
    /// Minimum descriptor similarity of a usable correspondence, see
    /// [`Match::similarity`](crate::Match::similarity).
    pub min_score: f32,
    /// Maximum ambiguity of a usable correspondence.
    pub max_ambiguity: f32,
    /// Reprojection distance in pixels below which a correspondence is an inlier.
    pub thresh: f32,
    /// Seed of the sampling RNG.
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            num_loops: 1000,
            min_score: 0.85,
            max_ambiguity: 0.95,
            thresh: 5.0,
            seed: 0,
        }
    }
}

impl RansacConfig {
    pub fn validate(&self) -> Result<(), SiftError> {
        if self.num_loops == 0 {
            return Err(invalid("num_loops must be at least 1"));
        }
        validate_gate(self.min_score, self.max_ambiguity, self.thresh)
    }
}

/// Parameters for [`refine_homography`](crate::refine_homography).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct RefineConfig {
    pub max_iterations: usize,
    /// Minimum descriptor similarity of a correspondence taking part in the refit. The gate is
    /// the same in every round, only the reprojection threshold tightens. Zero admits every
    /// correspondence that passes the ambiguity gate.
    pub min_score: f32,
    pub max_ambiguity: f32,
    /// Final reprojection threshold in pixels.
    pub thresh: f32,
    /// The first round uses `thresh * initial_thresh_scale`.
    pub initial_thresh_scale: f32,
    /// Number of rounds over which the threshold shrinks geometrically to `thresh`.
    pub tighten_rounds: usize,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            min_score: 0.0,
            max_ambiguity: 0.95,
            thresh: 5.0,
            initial_thresh_scale: 4.0,
            tighten_rounds: 8,
        }
    }
}

impl RefineConfig {
    pub fn validate(&self) -> Result<(), SiftError> {
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be at least 1"));
        }
        if !(self.initial_thresh_scale >= 1.0 && self.initial_thresh_scale.is_finite()) {
            return Err(invalid("initial_thresh_scale must be at least 1"));
        }
        validate_gate(self.min_score, self.max_ambiguity, self.thresh)
    }

    /// Reprojection threshold used in round `round`.
    pub(crate) fn thresh_at(&self, round: usize) -> f32 {
        if self.tighten_rounds == 0 || round >= self.tighten_rounds {
            return self.thresh;
        }
        let progress = round as f32 / self.tighten_rounds as f32;
        let scale = self.initial_thresh_scale.powf(1.0 - progress);
        (self.thresh * scale).max(self.thresh)
    }
}

fn validate_gate(min_score: f32, max_ambiguity: f32, thresh: f32) -> Result<(), SiftError> {
    if !min_score.is_finite() {
        return Err(invalid("min_score must be finite"));
    }
    if !(0.0..=1.0).contains(&max_ambiguity) {
        return Err(invalid("max_ambiguity must be in [0, 1]"));
    }
    if !(thresh > 0.0 && thresh.is_finite()) {
        return Err(invalid("thresh must be positive"));
    }
    Ok(())
}

fn invalid(msg: &str) -> SiftError {
    SiftError::InvalidConfig(msg.to_owned())
}
