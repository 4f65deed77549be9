use std::f32::consts::TAU;

use itertools::{izip, Itertools};
use ndarray::{s, Array3, ArrayView2};

use crate::{DESCRIPTOR_N_BINS, DESCRIPTOR_N_HISTOGRAMS, DESCRIPTOR_SIZE, LAMBDA_DESCR};

const BIN_ANGLE_STEP: f32 = DESCRIPTOR_N_BINS as f32 / TAU;

/// Compute the unit length descriptor of a keypoint at `(x, y)` of `img` (octave pixels) into
/// `out`. `orientation` is in radians with y pointing down.
///
/// Returns `false` and leaves `out` zeroed when the patch has no gradient at all.
#[doc(hidden)]
pub fn compute_descriptor(
    img: &ArrayView2<f32>,
    x: f32,
    y: f32,
    scale: f32,
    orientation: f32,
    clip: f32,
    out: &mut [f32],
) -> bool {
    assert_eq!(out.len(), DESCRIPTOR_SIZE);
    out.fill(0.0);
    let hist = weighted_histograms(img, x, y, scale, orientation);

    #[allow(clippy::reversed_empty_ranges)]
    let mut hist_flat = hist.slice_move(s![1..-1, 1..-1, ..]).into_flat();

    let l2 = hist_flat.iter().map(|v| v * v).sum::<f32>().sqrt();
    if l2 <= 0.0 || !l2.is_finite() {
        return false;
    }
    // Components of the unit vector can not be larger than `clip`
    hist_flat.mapv_inplace(|v| (v / l2).min(clip));

    let l2_clipped = hist_flat.iter().map(|v| v * v).sum::<f32>().sqrt();
    izip!(out.iter_mut(), hist_flat.iter()).for_each(|(o, v)| *o = v / l2_clipped);
    true
}

/// `(n + 2) x (n + 2) x bins` histograms, the outer ring collecting what falls just outside the
/// `n x n` grid.
fn weighted_histograms(
    img: &ArrayView2<f32>,
    x: f32,
    y: f32,
    scale: f32,
    orientation: f32,
) -> Array3<f32> {
    let n_hist = DESCRIPTOR_N_HISTOGRAMS;
    let n_bins = DESCRIPTOR_N_BINS;
    let (height, width) = img.dim();
    let x = x.round() as i32;
    let y = y.round() as i32;
    let hist_width = LAMBDA_DESCR * scale;
    let radius = (hist_width * 2_f32.sqrt() * (n_hist + 1) as f32 * 0.5).round() as i32;
    let (sin_ori, cos_ori) = orientation.sin_cos();
    let (sin_ori_scaled, cos_ori_scaled) = (sin_ori / hist_width, cos_ori / hist_width);

    // Instead of 4*4 histograms, we work with 6*6 here so that the interpolation works out simpler
    // at the borders. The outermost histograms will be discarded.
    let mut hist: Array3<f32> = Array3::zeros((n_hist + 2, n_hist + 2, n_bins));

    let (gradients_x, gradients_y, row_bins, col_bins, weights): (
        Vec<_>,
        Vec<_>,
        Vec<_>,
        Vec<_>,
        Vec<_>,
    ) = (-radius..=radius)
        .flat_map(|y_in_window| {
            (-radius..=radius).filter_map(move |x_in_window| {
                // row and col in the keypoint's frame, aligned with its reference orientation
                let col_rotated: f32 =
                    x_in_window as f32 * cos_ori_scaled + y_in_window as f32 * sin_ori_scaled;
                let row_rotated: f32 =
                    -(x_in_window as f32) * sin_ori_scaled + y_in_window as f32 * cos_ori_scaled;
                // Bin here means which of the 4*4 histograms the gradient at this point will
                // contribute to. It is not a bin within a histogram.
                let row_bin = row_rotated + (n_hist / 2) as f32;
                let col_bin = col_rotated + (n_hist / 2) as f32;

                // coordinates to read pixels from. No resampling here
                let abs_y = y + y_in_window;
                let abs_x = x + x_in_window;

                // +/- 0.5 to check if the sample would contribute anything to the 4*4 histograms
                // of interest with interpolation.
                if row_bin > -0.5
                    && row_bin < n_hist as f32 + 0.5
                    && col_bin > -0.5
                    && col_bin < n_hist as f32 + 0.5
                    && abs_y > 0
                    && abs_y < (height - 1) as i32
                    && abs_x > 0
                    && abs_x < (width - 1) as i32
                {
                    let abs_y = abs_y as usize;
                    let abs_x = abs_x as usize;
                    let dx = img[(abs_y, abs_x + 1)] - img[(abs_y, abs_x - 1)];
                    let dy = img[(abs_y + 1, abs_x)] - img[(abs_y - 1, abs_x)];

                    // Samples contribute less to histogram as they get further away.
                    // Exponents in Eq. (27) in [4]
                    let weight = col_rotated.powi(2) + row_rotated.powi(2);
                    Some((dx, dy, row_bin, col_bin, weight))
                } else {
                    None
                }
            })
        })
        .multiunzip();
    // Gaussian with a sigma of half the descriptor window
    let weight_scale = -2. / (n_hist.pow(2) as f32);
    let weights = weights
        .into_iter()
        .map(|w| (w * weight_scale).exp())
        .collect_vec();
    // Gradient orientations in patch relative to the keypoint's reference orientation.
    let normalized_orientations = gradients_x
        .iter()
        .zip(&gradients_y)
        .map(|(dx, dy)| (dy.atan2(*dx) - orientation).rem_euclid(TAU))
        .collect_vec();
    let magnitude = gradients_x
        .into_iter()
        .zip(&gradients_y)
        .map(|(dx, dy)| (dx * dx + dy * dy).sqrt())
        .collect_vec();

    // Spread each sample point's contribution to its 8 neighbouring histograms based on its distance
    // from the histogram window's center and weighted by the sample's gradient magnitude.
    izip!(
        row_bins,
        col_bins,
        normalized_orientations,
        magnitude,
        weights
    )
    .for_each(|(row_bin, col_bin, orientation, mag, weight)| {
        // Subtracting 0.5 here because the trilinear interpolation (the reverse actually)
        // below works on the {-0.5, 0.5}^3 cube, but our histograms are located in {0, 1}^ cubes.
        let row_bin = row_bin - 0.5;
        let col_bin = col_bin - 0.5;
        let mag = mag * weight;
        let obin = orientation * BIN_ANGLE_STEP;
        let row_floor = row_bin.floor();
        let col_floor = col_bin.floor();
        let ori_floor = obin.floor();
        let row_frac = row_bin - row_floor;
        let col_frac = col_bin - col_floor;
        let ori_frac = obin - ori_floor;

        // The numbers are to be seen as coordinates on a cube.
        // Notation taken from https://en.wikipedia.org/wiki/Trilinear_interpolation.
        let c1 = mag * row_frac;
        let c0 = mag - c1;
        let c11 = c1 * col_frac;
        let c10 = c1 - c11;
        let c01 = c0 * col_frac;
        let c00 = c0 - c01;
        let c111 = c11 * ori_frac;
        let c110 = c11 - c111;
        let c101 = c10 * ori_frac;
        let c100 = c10 - c101;
        let c011 = c01 * ori_frac;
        let c010 = c01 - c011;
        let c001 = c00 * ori_frac;
        let c000 = c00 - c001;

        let row_floor_p1 = (row_floor + 1.) as usize;
        let col_floor_p1 = (col_floor + 1.) as usize;
        let row_floor_p2 = (row_floor + 2.) as usize;
        let col_floor_p2 = (col_floor + 2.) as usize;
        // Histogram bin indices wrap around because angles
        let ori_floor = (ori_floor as usize) % n_bins;
        let ori_floor_p1 = (ori_floor + 1) % n_bins;

        hist[(row_floor_p1, col_floor_p1, ori_floor)] += c000;
        hist[(row_floor_p1, col_floor_p1, ori_floor_p1)] += c001;
        hist[(row_floor_p1, col_floor_p2, ori_floor)] += c010;
        hist[(row_floor_p1, col_floor_p2, ori_floor_p1)] += c011;
        hist[(row_floor_p2, col_floor_p1, ori_floor)] += c100;
        hist[(row_floor_p2, col_floor_p1, ori_floor_p1)] += c101;
        hist[(row_floor_p2, col_floor_p2, ori_floor)] += c110;
        hist[(row_floor_p2, col_floor_p2, ori_floor_p1)] += c111;
    });
    hist
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn textured(height: usize, width: usize) -> Array2<f32> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            let (x, y) = (x as f32, y as f32);
            0.5 + 0.2 * (0.35 * x).sin() * (0.21 * y + 0.3).cos() + 0.1 * (0.13 * (x + 2.0 * y)).sin()
        })
    }

    #[test]
    fn descriptor_is_clipped_unit_vector() {
        let img = textured(64, 64);
        let mut desc = [0.0; DESCRIPTOR_SIZE];
        assert!(compute_descriptor(&img.view(), 31.6, 30.2, 2.5, 1.0, 0.2, &mut desc));
        let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(desc.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn flat_patch_has_no_descriptor() {
        let img = Array2::from_elem((40, 40), 0.3);
        let mut desc = [1.0; DESCRIPTOR_SIZE];
        assert!(!compute_descriptor(&img.view(), 20.0, 20.0, 2.0, 0.0, 0.2, &mut desc));
        assert!(desc.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn descriptor_follows_rotation() {
        // Rotating the image by 90 degrees and the orientation by a quarter turn gives the same
        // descriptor.
        let img = textured(65, 65);
        let rotated = Array2::from_shape_fn((65, 65), |(y, x)| img[(64 - x, y)]);
        let (mut a, mut b) = ([0.0; DESCRIPTOR_SIZE], [0.0; DESCRIPTOR_SIZE]);
        assert!(compute_descriptor(&img.view(), 32.0, 32.0, 3.0, 0.4, 0.2, &mut a));
        assert!(compute_descriptor(&rotated.view(), 32.0, 32.0, 3.0, 0.4 + TAU / 4.0, 0.2, &mut b));
        let distance = izip!(&a, &b).map(|(p, q)| (p - q) * (p - q)).sum::<f32>().sqrt();
        assert!(distance < 0.05, "distance {distance}");
    }
}
