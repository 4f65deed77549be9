use std::f32::consts::TAU;

use itertools::{izip, Itertools};
use ndarray::ArrayView2;

use crate::{LAMBDA_ORI, ORIENTATION_HISTOGRAM_BINS};

/// Histogram of gradient directions in square patch of side length 2*radius around (x, y), with
/// `radius = 3 λori scale`. Angles are `atan2(dy, dx)` with y pointing down.
/// See Section 4.1 in [4].
pub(crate) fn orientation_histogram(
    img: ArrayView2<f32>,
    x: usize,
    y: usize,
    scale: f32,
) -> [f32; ORIENTATION_HISTOGRAM_BINS] {
    let n_bins = ORIENTATION_HISTOGRAM_BINS;
    let sigma = LAMBDA_ORI * scale;
    let radius = (3. * sigma).round() as isize;
    let (height, width) = img.dim();
    // Denominator of exponent in Eq. (20) in [4], used to compute weights
    let grad_weight_scale = -1.0 / (2.0 * sigma * sigma);

    let (grads_x, grads_y, grad_weights): (Vec<f32>, Vec<f32>, Vec<f32>) = (-radius..=radius)
        .filter_map(|y_patch| {
            let y_img = y as isize + y_patch;
            (y_img > 0 && y_img < height as isize - 1).then_some((y_img as usize, y_patch))
        })
        .flat_map(|(y_img, y_patch)| {
            (-radius..=radius)
                .filter_map(move |x_patch| {
                    let x_img = x as isize + x_patch;
                    (x_img > 0 && x_img < width as isize - 1).then_some((x_img as usize, x_patch))
                })
                .map(move |(x_img, x_patch)| {
                    let dx = img[(y_img, x_img + 1)] - img[(y_img, x_img - 1)];
                    let dy = img[(y_img + 1, x_img)] - img[(y_img - 1, x_img)];
                    // squared euclidian distance from (x, y) * weighting factor
                    let w = (y_patch * y_patch + x_patch * x_patch) as f32 * grad_weight_scale;
                    (dx, dy, w)
                })
        })
        .multiunzip();

    // Range of angles (radians) assigned to one histogram bin
    let bin_angle_step = n_bins as f32 / TAU;

    // The gradient orientation histogram undergoes a final smoothing step with the kernel
    // [1/16, 4/16, 6/16, 4/16, 1/16]. raw_hist has length n_bins + 4 because the convolution is
    // circular and wraps around, so the first and last 2 values are copied to the other end.
    let mut raw_hist = [0.0; ORIENTATION_HISTOGRAM_BINS + 4];
    izip!(grads_x, grads_y, grad_weights).for_each(|(dx, dy, w)| {
        let magnitude = (dx * dx + dy * dy).sqrt();
        let bin = (dy.atan2(dx) * bin_angle_step).round() as isize;
        let bin = bin.rem_euclid(n_bins as isize) as usize;
        raw_hist[bin + 2] += w.exp() * magnitude;
    });
    raw_hist[1] = raw_hist[n_bins + 1];
    raw_hist[0] = raw_hist[n_bins];
    raw_hist[n_bins + 2] = raw_hist[2];
    raw_hist[n_bins + 3] = raw_hist[3];
    let mut hist = [0.; ORIENTATION_HISTOGRAM_BINS];
    for i in 2..n_bins + 2 {
        hist[i - 2] = (raw_hist[i - 2] + raw_hist[i + 2]) * (1. / 16.)
            + (raw_hist[i - 1] + raw_hist[i + 1]) * (4. / 16.)
            + raw_hist[i] * 6. / 16.;
    }
    hist
}

/// Reference orientations in radians, `[0, 2π)`: every strict local maximum of the circular
/// histogram reaching `peak_ratio` of the global maximum, refined by parabolic interpolation.
/// Section 4.1.C in [4].
pub(crate) fn dominant_orientations(hist: &[f32], peak_ratio: f32) -> Vec<f32> {
    let n = hist.len();
    let histogram_max = hist.iter().copied().fold(0.0, f32::max);
    let localmax_threshold = histogram_max * peak_ratio;
    (0..n)
        .filter_map(|k| {
            // h_k- and h_k+ in [4].
            let k_minus = (k + n - 1) % n;
            let k_plus = (k + 1) % n;
            let is_local_max = hist[k] > hist[k_minus] && hist[k] > hist[k_plus];
            if !(is_local_max && hist[k] >= localmax_threshold) {
                return None;
            }
            // argmax of the quadratic function interpolating h_k-, h_k, h_k+
            // See Eq. (23) in [4]
            let interp =
                (hist[k_minus] - hist[k_plus]) / (hist[k_minus] - 2.0 * hist[k] + hist[k_plus]);
            let bin = (k as f32 + 0.5 * interp).rem_euclid(n as f32);
            let angle = TAU * bin / n as f32;
            Some(if angle >= TAU { 0.0 } else { angle })
        })
        .collect_vec()
}
