use rayon::prelude::*;

use crate::config::RefineConfig;
use crate::error::SiftError;
use crate::feature_set::FeatureSet;
use crate::homography::{fit_homography, Homography};
use crate::ransac::{gated_correspondences, score, HomographyEstimate, SAMPLE_SIZE};

/// Improve `initial` by repeated weighted least squares over all inliers.
///
/// The inlier threshold starts at `thresh * initial_thresh_scale` and shrinks to `thresh` over
/// `tighten_rounds` rounds. Inliers are weighted by `t² / (e² + t²)`. A refit is only kept when it
/// has at least as many inliers at the final threshold as the best estimate so far, so the result
/// never has fewer inliers than `initial`.
pub fn refine_homography(
    set: &FeatureSet,
    initial: &Homography,
    config: &RefineConfig,
) -> Result<HomographyEstimate, SiftError> {
    config.validate()?;
    let correspondences = gated_correspondences(
        set.keypoints()?,
        config.min_score,
        config.max_ambiguity,
    );
    let considered = correspondences.len();
    if considered < SAMPLE_SIZE {
        return Err(SiftError::NotEnoughCorrespondences {
            found: considered,
            required: SAMPLE_SIZE,
        });
    }

    let final_thresh = f64::from(config.thresh);
    let (mut best_inliers, mut best_error) = score(initial, &correspondences, final_thresh);
    let mut best = *initial;
    let mut previous: Option<(f64, Vec<bool>)> = None;
    let mut rounds = 0;

    for round in 0..config.max_iterations {
        rounds = round + 1;
        let t = f64::from(config.thresh_at(round));
        let errors: Vec<f64> = correspondences
            .par_iter()
            .map(|c| best.transfer_error(c))
            .collect();
        let membership: Vec<bool> = errors.iter().map(|e| *e < t).collect();
        if let Some((prev_t, prev_membership)) = &previous {
            if *prev_t == final_thresh && t == final_thresh && *prev_membership == membership {
                log::debug!("refine: inlier set stable after {round} rounds");
                break;
            }
        }
        if membership.iter().filter(|m| **m).count() < SAMPLE_SIZE {
            break;
        }
        let weights: Vec<f64> = errors
            .iter()
            .zip(&membership)
            .map(|(e, inlier)| if *inlier { t * t / (e * e + t * t) } else { 0.0 })
            .collect();
        let Some(candidate) = fit_homography(&correspondences, Some(&weights)) else {
            break;
        };
        let (inliers, error) = score(&candidate, &correspondences, final_thresh);
        if inliers < best_inliers || (inliers == best_inliers && error > best_error) {
            log::debug!("refine: round {round} would lose inliers, stopping");
            break;
        }
        best = candidate;
        best_inliers = inliers;
        best_error = error;
        previous = Some((t, membership));
    }

    log::info!(
        "refine: {best_inliers} of {considered} correspondences are inliers after {rounds} rounds"
    );
    Ok(HomographyEstimate {
        homography: best,
        inliers: best_inliers,
        considered,
    })
}
