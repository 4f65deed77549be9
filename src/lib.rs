// This implementation of SIFT is derived from works by Rob Hess and Willow Garage Inc.
// It is made available under the terms of the MIT license included in the root of this repository.
//
// Copyright 2006-2010 Rob Hess
// Copyright 2009 Willow Garage Inc.
// Copyright 2024 Thomas Nibler

//! SIFT feature detection, exhaustive descriptor matching and robust homography estimation
//! between two images.
//!
//! The pipeline for a pair of images is
//! 1. [`detect`] on both images, each writing a [`FeatureSet`] in the device domain,
//! 2. [`match_features`] A against B, which fills in A's match records,
//! 3. [`FeatureSet::download`] to bring A's matches to the host,
//! 4. [`estimate_homography`] (RANSAC over minimal samples) and
//! 5. [`refine_homography`] (weighted least squares over all inliers).
//!
//! The data-parallel stages run on the `rayon` thread pool. Nothing is copied between the host
//! and device domains of a feature set unless the caller asks for it.
//!
//! Useful resources:
//! - [1]: [Lowe 1999](https://www.cs.ubc.ca/~lowe/papers/iccv99.pdf)
//! - [2]: [Lowe 2004](https://www.cs.ubc.ca/~lowe/papers/ijcv04.pdf)
//! - [3]: [Hartley 1997](https://doi.org/10.1109/34.601246), In defense of the eight-point
//!   algorithm
//! - [4]: [Rey-Otero 2014](https://www.ipol.im/pub/art/2014/82/article.pdf)
//!
//! The detector follows [4] (Anatomy of the SIFT Method), with the histogram smoothing and
//! descriptor interpolation of the OpenCV implementation.

use ndarray::Axis;
use rayon::prelude::*;

mod config;
mod descriptor;
mod error;
mod feature_set;
mod homography;
mod local_extrema;
mod matcher;
mod orientation;
mod pyramid;
mod ransac;
mod refine;
mod sift_image;
mod temp_memory;

pub use config::{DetectorConfig, RansacConfig, RefineConfig};
#[doc(hidden)]
pub use descriptor::compute_descriptor;
pub use error::SiftError;
pub use feature_set::{FeatureSet, Keypoint, Location, Match};
pub use homography::{Correspondence, Homography};
pub use matcher::match_features;
pub use pyramid::{
    build_scale_space, octave_sizes, ImageprocProcessing, Octave, Processing, ScaleSpace,
};
pub use ransac::{estimate_homography, HomographyEstimate};
pub use refine::refine_homography;
pub use sift_image::{LumaFImage, SiftImage};
pub use temp_memory::TempMemory;

use local_extrema::{find_extrema, Extremum};
use orientation::{dominant_orientations, orientation_histogram};

/// Number of scales searched for extrema in each octave.
pub const SCALES_PER_OCTAVE: usize = 3;

/// 3λori rounded up. Extrema closer to the octave border than this are not searched.
const IMAGE_BORDER: usize = 5;

const ORIENTATION_HISTOGRAM_BINS: usize = 36;
/// λ_ori in Eq. (19) in [4]
const LAMBDA_ORI: f32 = 1.5;
/// λ_descr in Eq. (25) in [4], width of one descriptor histogram cell in units of the keypoint
/// scale.
const LAMBDA_DESCR: f32 = 3.0;

// See Section 4.2 in [4]
const DESCRIPTOR_N_HISTOGRAMS: usize = 4;
// See Section 4.2 in [4]
const DESCRIPTOR_N_BINS: usize = 8;
/// Length of a descriptor vector.
pub const DESCRIPTOR_SIZE: usize =
    DESCRIPTOR_N_HISTOGRAMS * DESCRIPTOR_N_HISTOGRAMS * DESCRIPTOR_N_BINS;

/// Detect keypoints using the default blur and resampling implementations.
///
/// At most `capacity` keypoints are kept; the rest are dropped with a warning. `temp` must be at
/// least [`TempMemory::required_floats`] long and is reused in place.
pub fn detect(
    image: &SiftImage,
    config: &DetectorConfig,
    capacity: usize,
    temp: &mut TempMemory,
) -> Result<FeatureSet, SiftError> {
    detect_with_processing::<ImageprocProcessing>(image, config, capacity, temp)
}

/// Detect keypoints using the provided blur and resampling implementations.
pub fn detect_with_processing<P: Processing>(
    image: &SiftImage,
    config: &DetectorConfig,
    capacity: usize,
    temp: &mut TempMemory,
) -> Result<FeatureSet, SiftError> {
    config.validate()?;
    let scale_space = build_scale_space::<P>(image, config, temp)?;

    let mut keypoints: Vec<Keypoint> = Vec::new();
    for (index, octave) in scale_space.octaves().iter().enumerate() {
        let extrema = find_extrema(octave.dog(), config);
        let found: Vec<Keypoint> = extrema
            .par_iter()
            .flat_map_iter(|extremum| describe_extremum(octave, extremum, config))
            .collect();
        log::debug!(
            "octave {index}: {} extrema, {} keypoints",
            extrema.len(),
            found.len()
        );
        keypoints.extend(found);
    }

    if keypoints.len() > capacity {
        log::warn!(
            "feature set capacity {capacity} reached, dropping {} keypoints",
            keypoints.len() - capacity
        );
        keypoints.truncate(capacity);
    }
    log::debug!(
        "detected {} keypoints on {}x{} image",
        keypoints.len(),
        image.width(),
        image.height()
    );
    Ok(FeatureSet::from_detection(&keypoints, capacity))
}

/// One keypoint per reference orientation of the extremum.
fn describe_extremum(octave: &Octave, e: &Extremum, config: &DetectorConfig) -> Vec<Keypoint> {
    let gaussian = octave.gaussian();
    let img = gaussian.index_axis(Axis(0), e.layer);
    let subsampling = octave.subsampling();
    // Called sigma in [4], in octave pixels
    let octave_scale = config.base_sigma
        * 2_f32.powf((e.layer as f32 + e.offset_scale) / SCALES_PER_OCTAVE as f32);
    let scale = octave_scale * subsampling;
    if scale < config.lowest_scale {
        return Vec::new();
    }
    let x = e.x as f32 + e.offset_x;
    let y = e.y as f32 + e.offset_y;

    let hist = orientation_histogram(img, e.x, e.y, octave_scale);
    dominant_orientations(&hist, config.orientation_peak_ratio)
        .into_iter()
        .filter_map(|orientation| {
            let mut descriptor = [0.0; DESCRIPTOR_SIZE];
            compute_descriptor(
                &img,
                x,
                y,
                octave_scale,
                orientation,
                config.descriptor_clip,
                &mut descriptor,
            )
            .then(|| Keypoint {
                x: x * subsampling,
                y: y * subsampling,
                scale,
                sharpness: e.value,
                edgeness: e.edgeness,
                orientation,
                score: e.value.abs(),
                subsampling,
                descriptor,
                matched: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `(x, y, sigma)` of isolated blobs spanning the first three octaves.
    const CENTERS: [(f32, f32, f32); 4] = [
        (32.3, 33.6, 2.0),
        (94.7, 31.2, 3.5),
        (30.4, 95.8, 6.0),
        (96.6, 94.3, 2.6),
    ];

    fn blob(x: f32, y: f32, (cx, cy, s): (f32, f32, f32)) -> f32 {
        let sy = 1.3 * s;
        let e = (x - cx).powi(2) / (2.0 * s * s) + (y - cy).powi(2) / (2.0 * sy * sy);
        0.8 * (-e).exp()
    }

    /// Slightly elongated Gaussian blobs on a flat background.
    fn blobs(width: u32, height: u32, centers: &[(f32, f32, f32)]) -> SiftImage {
        let pixels: Vec<f32> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x as f32, y as f32)))
            .map(|(x, y)| 0.1 + centers.iter().map(|&c| blob(x, y, c)).sum::<f32>())
            .collect();
        SiftImage::from_row_major(width, height, &pixels).unwrap()
    }

    fn has_keypoint_near(set: &FeatureSet, (cx, cy): (f32, f32)) -> bool {
        set.keypoints()
            .unwrap()
            .iter()
            .any(|kp| (kp.x - cx).abs() < 1.5 && (kp.y - cy).abs() < 1.5)
    }

    #[test]
    fn detects_blobs() {
        let img = blobs(128, 128, &CENTERS);
        let config = DetectorConfig::default();
        let mut temp = TempMemory::for_config(128, 128, &config).unwrap();
        let mut set = detect(&img, &config, 1000, &mut temp).unwrap();
        assert_eq!(set.location(), Location::Device);
        assert!(!set.is_empty());
        set.download().unwrap();
        for kp in set.keypoints().unwrap() {
            assert!(kp.scale > 0.0);
            assert!((0.0..std::f32::consts::TAU).contains(&kp.orientation));
            let norm = kp.descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        for (cx, cy, _) in CENTERS {
            assert!(has_keypoint_near(&set, (cx, cy)), "no keypoint at ({cx}, {cy})");
        }
    }

    #[test]
    fn detects_blob_at_octave_boundary() {
        // Its DoG response peaks between the last searched layer of octave 0 and the first of
        // octave 1.
        let center = (60.4, 59.3, 3.5);
        let img = blobs(120, 120, &[center]);
        let config = DetectorConfig::default();
        let mut temp = TempMemory::for_config(120, 120, &config).unwrap();
        let mut set = detect(&img, &config, 100, &mut temp).unwrap();
        set.download().unwrap();
        assert!(has_keypoint_near(&set, (center.0, center.1)));
    }

    #[test]
    fn lowest_scale_drops_fine_keypoints() {
        let img = blobs(128, 128, &CENTERS);
        let config = DetectorConfig {
            lowest_scale: 1000.0,
            ..Default::default()
        };
        let mut temp = TempMemory::for_config(128, 128, &config).unwrap();
        assert!(detect(&img, &config, 100, &mut temp).unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let img = blobs(32, 32, &CENTERS[..1]);
        let config = DetectorConfig {
            base_sigma: -1.0,
            ..Default::default()
        };
        let mut temp = TempMemory::with_len(0).unwrap();
        assert!(matches!(
            detect(&img, &config, 10, &mut temp),
            Err(SiftError::InvalidConfig(_))
        ));
    }
}
