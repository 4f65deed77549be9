use ndarray::{ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::SiftError;
use crate::feature_set::{FeatureSet, Match, PointRecord};

/// Nearest and second nearest candidate seen so far, as squared descriptor distances.
///
/// `merge` is associative and commutative, so partial results from any split of the candidates
/// combine to the same pair. Equal distances go to the lower index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct NearestPair {
    best: f32,
    second: f32,
    index: usize,
}

impl NearestPair {
    const EMPTY: Self = Self {
        best: f32::INFINITY,
        second: f32::INFINITY,
        index: usize::MAX,
    };

    fn single(index: usize, distance: f32) -> Self {
        Self {
            best: distance,
            second: f32::INFINITY,
            index,
        }
    }

    fn merge(self, other: Self) -> Self {
        let other_wins =
            other.best < self.best || (other.best == self.best && other.index < self.index);
        let (winner, loser) = if other_wins {
            (other, self)
        } else {
            (self, other)
        };
        Self {
            best: winner.best,
            second: winner.second.min(loser.best),
            index: winner.index,
        }
    }

    /// `best / second`, 1 when there is no usable second candidate.
    fn ambiguity(&self) -> f32 {
        if self.second > 0.0 && self.second.is_finite() {
            (self.best / self.second).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }
}

fn squared_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_pair(query: ArrayView1<f32>, candidates: ArrayView2<f32>) -> NearestPair {
    (0..candidates.nrows())
        .into_par_iter()
        .fold(
            || NearestPair::EMPTY,
            |acc, j| acc.merge(NearestPair::single(j, squared_distance(query, candidates.row(j)))),
        )
        .reduce(|| NearestPair::EMPTY, NearestPair::merge)
}

/// Match every keypoint of `a` against all keypoints of `b` by exhaustive descriptor search and
/// store the result in `a`'s device match records.
///
/// Both sets must be resident on the device. Afterwards `a` is [`Location::Device`] only; call
/// [`FeatureSet::download`] before estimating a homography from it.
///
/// Returns the mean descriptor distance over matched keypoints, `None` if nothing matched. A
/// keypoint without any candidate at a finite distance, for example when `b` is empty, is left
/// unmatched.
///
/// [`Location::Device`]: crate::Location::Device
pub fn match_features(a: &mut FeatureSet, b: &FeatureSet) -> Result<Option<f32>, SiftError> {
    let b_points: &[PointRecord] = &b.device()?.points;
    let b_descriptors = b.descriptors()?;

    let matches: Vec<Option<Match>> = {
        let a_descriptors = a.descriptors()?;
        a_descriptors
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|query| {
                let pair = nearest_pair(query, b_descriptors);
                // No candidate at a finite distance, including an empty `b`
                let target = b_points.get(pair.index)?;
                Some(Match {
                    index: pair.index,
                    x: target.x,
                    y: target.y,
                    error: pair.best.sqrt(),
                    ambiguity: pair.ambiguity(),
                })
            })
            .collect()
    };

    let (matched, error_sum) = matches
        .iter()
        .flatten()
        .fold((0usize, 0.0f64), |(n, sum), m| (n + 1, sum + f64::from(m.error)));
    a.device_matches_mut()?.copy_from_slice(&matches);

    log::debug!(
        "matched {matched} of {} keypoints against {}",
        matches.len(),
        b_points.len()
    );
    Ok((matched > 0).then(|| (error_sum / matched as f64) as f32))
}
