use itertools::iproduct;
use ndarray::{s, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::config::DetectorConfig;
use crate::{IMAGE_BORDER, SCALES_PER_OCTAVE};

/// DoG extremum after sub-pixel refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Extremum {
    /// DoG layer, in `1..=SCALES_PER_OCTAVE`.
    pub layer: usize,
    pub x: usize,
    pub y: usize,
    pub offset_scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    /// Interpolated DoG value.
    pub value: f32,
    pub edgeness: f32,
}

/// All refined extrema of one octave's DoG stack, ordered by layer, row and column of the
/// discrete extremum.
pub(crate) fn find_extrema(dog: ArrayView3<f32>, config: &DetectorConfig) -> Vec<Extremum> {
    assert_eq!(dog.shape()[0], SCALES_PER_OCTAVE + 2);
    let height = dog.shape()[1];
    let width = dog.shape()[2];
    if height <= 2 * IMAGE_BORDER || width <= 2 * IMAGE_BORDER {
        return Vec::new();
    }
    (1..=SCALES_PER_OCTAVE)
        .flat_map(|layer| {
            (IMAGE_BORDER..height - IMAGE_BORDER)
                .into_par_iter()
                .flat_map_iter(move |y| {
                    (IMAGE_BORDER..width - IMAGE_BORDER)
                        .filter(move |&x| is_strict_extremum(dog, layer, y, x, config.thresh))
                        .filter_map(move |x| refine_extremum(dog, layer, y, x, config))
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// `dog[(layer, y, x)]` is strictly above or strictly below all 26 neighbours and its magnitude
/// exceeds `thresh`.
fn is_strict_extremum(dog: ArrayView3<f32>, layer: usize, y: usize, x: usize, thresh: f32) -> bool {
    let val = dog[(layer, y, x)];
    if val.abs() <= thresh {
        return false;
    }
    let mut neighbours = iproduct!(layer - 1..=layer + 1, y - 1..=y + 1, x - 1..=x + 1)
        .filter(|&p| p != (layer, y, x))
        .map(|p| dog[p]);
    if val > 0.0 {
        neighbours.all(|n| val > n)
    } else {
        neighbours.all(|n| val < n)
    }
}

fn refine_extremum(
    dog: ArrayView3<f32>,
    layer: usize,
    y: usize,
    x: usize,
    config: &DetectorConfig,
) -> Option<Extremum> {
    let interp = interpolate_extremum(dog, layer, x, y, config.max_interpolation_steps)?;
    // discard low contrast extrema
    if interp.value.abs() < config.thresh {
        return None;
    }
    let curr = dog.index_axis(Axis(0), interp.layer);
    let edgeness = extremum_edgeness(curr, interp.x, interp.y)?;
    let r = config.edge_limit;
    if edgeness >= (r + 1.0) * (r + 1.0) / r {
        return None;
    }
    Some(Extremum {
        edgeness,
        ..interp
    })
}

/// Scale space extrema are initially identified on the grid of discrete pixels in a particular
/// image in the scale space. The real DoG function approximated by the stack of DoG images is
/// continous though, and the actual extremum may not fall exactly on a sampling point
/// (scale, row, column). To get a better approximation of the extremum's location, the second
/// order Taylor expansion is used to fit the DoG function around a point and the local extremum of
/// this quadratic is used as a keypoint.
/// See P18-19 in [4].
fn interpolate_extremum(
    dog: ArrayView3<f32>,
    layer: usize,
    x: usize,
    y: usize,
    max_steps: usize,
) -> Option<Extremum> {
    let height = dog.shape()[1] as isize;
    let width = dog.shape()[2] as isize;
    let (mut layer, mut x, mut y) = (layer as isize, x as isize, y as isize);
    for _ in 0..max_steps {
        let (l, r, c) = (layer as usize, y as usize, x as usize);
        let prev = dog.slice(s![l - 1, .., ..]);
        let curr = dog.slice(s![l, .., ..]);
        let next = dog.slice(s![l + 1, .., ..]);

        // 3D Gradient
        let g1 = (next[(r, c)] - prev[(r, c)]) / 2.;
        let g2 = (curr[(r + 1, c)] - curr[(r - 1, c)]) / 2.;
        let g3 = (curr[(r, c + 1)] - curr[(r, c - 1)]) / 2.;

        // Hessian matrix
        let value2x = curr[(r, c)] * 2.;
        let h11 = next[(r, c)] + prev[(r, c)] - value2x;
        let h12 = (next[(r + 1, c)] - next[(r - 1, c)] - prev[(r + 1, c)] + prev[(r - 1, c)]) / 4.;
        let h13 = (next[(r, c + 1)] - next[(r, c - 1)] - prev[(r, c + 1)] + prev[(r, c - 1)]) / 4.;
        let h22 = curr[(r + 1, c)] + curr[(r - 1, c)] - value2x;
        let h33 = curr[(r, c + 1)] + curr[(r, c - 1)] - value2x;
        let h23 = (curr[(r + 1, c + 1)] - curr[(r + 1, c - 1)] - curr[(r - 1, c + 1)]
            + curr[(r - 1, c - 1)])
            / 4.;

        // Solve for α* as shown in Eq. (14) by inverting the hessian
        let det = h11 * h22 * h33 - h11 * h23 * h23 - h12 * h12 * h33 + 2. * h12 * h13 * h23
            - h13 * h13 * h22;
        if det == 0. || !det.is_finite() {
            return None;
        }
        let hinv11 = (h22 * h33 - h23 * h23) / det;
        let hinv12 = (h13 * h23 - h12 * h33) / det;
        let hinv13 = (h12 * h23 - h13 * h22) / det;
        let hinv22 = (h11 * h33 - h13 * h13) / det;
        let hinv23 = (h12 * h13 - h11 * h23) / det;
        let hinv33 = (h11 * h22 - h12 * h12) / det;

        // Solution vector α* is (offset_scale, offset_row, offset_col)
        let offset_scale = -(hinv11 * g1 + hinv12 * g2 + hinv13 * g3);
        let offset_y = -(hinv12 * g1 + hinv22 * g2 + hinv23 * g3);
        let offset_x = -(hinv13 * g1 + hinv23 * g2 + hinv33 * g3);

        // If offsets are outside the interval [-0.5; 0.5] the extremum belongs
        // to a different pixel or scale and should be rejected here.
        if offset_scale.abs() < 0.5 && offset_x.abs() < 0.5 && offset_y.abs() < 0.5 {
            // Value of the interpolating function at α*, P11 Eq. (3) in [2].
            let value = curr[(r, c)] + 0.5 * (offset_scale * g1 + offset_y * g2 + offset_x * g3);
            return Some(Extremum {
                layer: l,
                x: c,
                y: r,
                offset_scale,
                offset_x,
                offset_y,
                value,
                edgeness: 0.0,
            });
        }
        // Interpolation step rejected, move to the neighbouring sample and retry.
        x += offset_x.round() as isize;
        y += offset_y.round() as isize;
        layer += offset_scale.round() as isize;

        let border = IMAGE_BORDER as isize;
        if !(1..=SCALES_PER_OCTAVE as isize).contains(&layer)
            || x < border
            || x >= width - border
            || y < border
            || y >= height - border
        {
            return None;
        }
    }
    // did not converge with in iteration limit
    None
}

/// Ratio `tr² / det` of the spatial Hessian, `None` if the curvatures have different signs.
/// P382, Eq. (17) and Eq. (18) in [4]
fn extremum_edgeness(dog_curr: ArrayView2<f32>, x: usize, y: usize) -> Option<f32> {
    assert!(x > 0 && x < dog_curr.shape()[1] - 1);
    assert!(y > 0 && y < dog_curr.shape()[0] - 1);
    let val2x = dog_curr[(y, x)] * 2.0;
    let h11 = dog_curr[(y + 1, x)] + dog_curr[(y - 1, x)] - val2x;
    let h22 = dog_curr[(y, x + 1)] + dog_curr[(y, x - 1)] - val2x;
    let h12 = (dog_curr[(y + 1, x + 1)] - dog_curr[(y + 1, x - 1)] - dog_curr[(y - 1, x + 1)]
        + dog_curr[(y - 1, x - 1)])
        / 4.;

    let tr = h11 + h22;
    let det = h11 * h22 - h12 * h12;
    if det <= 0. {
        return None;
    }
    Some(tr * tr / det)
}
