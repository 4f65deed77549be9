use nalgebra::Point2;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::RansacConfig;
use crate::error::SiftError;
use crate::feature_set::{FeatureSet, Keypoint};
use crate::homography::{fit_homography, Correspondence, Homography};

/// Correspondences in a minimal sample.
pub(crate) const SAMPLE_SIZE: usize = 4;

/// Three sample points closer to collinear than this (sine of the angle they span) make a sample
/// degenerate.
const MIN_SAMPLE_SINE: f64 = 1e-2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomographyEstimate {
    pub homography: Homography,
    /// Correspondences with a reprojection error below the threshold.
    pub inliers: usize,
    /// Correspondences that passed the score and ambiguity gate.
    pub considered: usize,
}

/// Matched keypoints with `similarity >= min_score` and `ambiguity <= max_ambiguity`, in keypoint
/// order.
pub(crate) fn gated_correspondences(
    keypoints: &[Keypoint],
    min_score: f32,
    max_ambiguity: f32,
) -> Vec<Correspondence> {
    keypoints
        .iter()
        .filter_map(|kp| {
            let m = kp.matched?;
            (m.ambiguity <= max_ambiguity && m.similarity() >= min_score).then(|| Correspondence {
                src: Point2::new(f64::from(kp.x), f64::from(kp.y)),
                dst: Point2::new(f64::from(m.x), f64::from(m.y)),
            })
        })
        .collect()
}

/// Number of correspondences with an error below `thresh` and the sum of their errors.
pub(crate) fn score(h: &Homography, correspondences: &[Correspondence], thresh: f64) -> (usize, f64) {
    correspondences
        .iter()
        .map(|c| h.transfer_error(c))
        .filter(|e| *e < thresh)
        .fold((0, 0.0), |(n, sum), e| (n + 1, sum + e))
}

fn nearly_collinear(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> bool {
    let (ab, ac) = (b - a, c - a);
    let cross = ab.x * ac.y - ab.y * ac.x;
    cross.abs() <= MIN_SAMPLE_SINE * ab.norm() * ac.norm()
}

/// Any three points of the sample are (nearly) collinear or coincide, in either image.
fn is_degenerate(sample: &[Correspondence; SAMPLE_SIZE]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES.iter().any(|&[i, j, k]| {
        nearly_collinear(sample[i].src, sample[j].src, sample[k].src)
            || nearly_collinear(sample[i].dst, sample[j].dst, sample[k].dst)
    })
}

#[derive(Debug, Clone, Copy)]
struct Trial {
    index: usize,
    homography: Homography,
    inliers: usize,
    error: f64,
}

impl Trial {
    /// More inliers, then lower error sum, then earlier trial.
    fn better(self, other: Self) -> Self {
        let self_wins = match self.inliers.cmp(&other.inliers) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                self.error < other.error || (self.error == other.error && self.index < other.index)
            }
        };
        if self_wins {
            self
        } else {
            other
        }
    }
}

/// Robustly estimate the homography mapping the keypoints of `set` onto their matches.
///
/// `set` must have its match results on the host, see [`FeatureSet::download`]. Minimal samples
/// are drawn up front from a generator seeded with `config.seed` and evaluated in parallel, so the
/// result only depends on the inputs and the seed.
pub fn estimate_homography(
    set: &FeatureSet,
    config: &RansacConfig,
) -> Result<HomographyEstimate, SiftError> {
    config.validate()?;
    let correspondences =
        gated_correspondences(set.keypoints()?, config.min_score, config.max_ambiguity);
    let considered = correspondences.len();
    if considered < SAMPLE_SIZE {
        return Err(SiftError::NotEnoughCorrespondences {
            found: considered,
            required: SAMPLE_SIZE,
        });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let samples: Vec<[usize; SAMPLE_SIZE]> = (0..config.num_loops)
        .map(|_| {
            let idx = sample(&mut rng, considered, SAMPLE_SIZE);
            std::array::from_fn(|i| idx.index(i))
        })
        .collect();

    let thresh = f64::from(config.thresh);
    let best = samples
        .par_iter()
        .enumerate()
        .filter_map(|(index, picked)| {
            let points = picked.map(|i| correspondences[i]);
            if is_degenerate(&points) {
                return None;
            }
            let homography = fit_homography(&points, None)?;
            let (inliers, error) = score(&homography, &correspondences, thresh);
            Some(Trial {
                index,
                homography,
                inliers,
                error,
            })
        })
        .reduce_with(Trial::better)
        .ok_or(SiftError::DegenerateFit {
            trials: config.num_loops,
        })?;

    log::info!(
        "ransac: {} of {considered} correspondences are inliers (trial {})",
        best.inliers,
        best.index
    );
    Ok(HomographyEstimate {
        homography: best.homography,
        inliers: best.inliers,
        considered,
    })
}
