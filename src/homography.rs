use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

/// Projective map from image A to image B, `x_b ~ H x_a`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(Matrix3<f64>);

/// Smallest ratio of singular values a fitted matrix may have before it counts as singular.
const MIN_CONDITION: f64 = 1e-12;

impl Homography {
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self(matrix)
    }

    pub fn from_row_major(values: [f64; 9]) -> Self {
        Self(Matrix3::from_row_slice(&values))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    pub fn to_row_major(&self) -> [f64; 9] {
        let m = &self.0;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    /// Map a point of image A into image B. `None` for points sent to infinity.
    pub fn project(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.0 * Vector3::new(p.x, p.y, 1.0);
        if v.z.abs() <= f64::EPSILON {
            return None;
        }
        Some(Point2::new(v.x / v.z, v.y / v.z))
    }

    pub fn inverse(&self) -> Option<Self> {
        self.0.try_inverse().map(Self)
    }

    /// Euclidean reprojection error of a correspondence, infinite when `src` projects to infinity.
    pub(crate) fn transfer_error(&self, c: &Correspondence) -> f64 {
        self.project(c.src)
            .map_or(f64::INFINITY, |p| (p - c.dst).norm())
    }
}

/// A point in image A and its match in image B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub src: Point2<f64>,
    pub dst: Point2<f64>,
}

/// Hartley normalization: zero mean, average distance sqrt(2) from the origin.
fn normalize_points(points: impl Iterator<Item = Point2<f64>> + Clone) -> Option<Matrix3<f64>> {
    let n = points.clone().count() as f64;
    let (sx, sy) = points.clone().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= f64::EPSILON || !mean_dist.is_finite() {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// Weighted direct linear transform over all `correspondences`.
///
/// Rows of each correspondence are scaled by the square root of its weight. Returns `None` for
/// fewer than 4 correspondences, coincident points and singular results.
pub(crate) fn fit_homography(
    correspondences: &[Correspondence],
    weights: Option<&[f64]>,
) -> Option<Homography> {
    let n = correspondences.len();
    if n < 4 {
        return None;
    }
    let t_src = normalize_points(correspondences.iter().map(|c| c.src))?;
    let t_dst = normalize_points(correspondences.iter().map(|c| c.dst))?;

    // Pad to a square system so the SVD yields the full right null space.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, c) in correspondences.iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[i].max(0.0).sqrt());
        let p = t_src * Vector3::new(c.src.x, c.src.y, 1.0);
        let q = t_dst * Vector3::new(c.dst.x, c.dst.y, 1.0);
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = -x * w;
        a[(r0, 1)] = -y * w;
        a[(r0, 2)] = -w;
        a[(r0, 6)] = u * x * w;
        a[(r0, 7)] = u * y * w;
        a[(r0, 8)] = u * w;

        a[(r1, 3)] = -x * w;
        a[(r1, 4)] = -y * w;
        a[(r1, 5)] = -w;
        a[(r1, 6)] = v * x * w;
        a[(r1, 7)] = v * y * w;
        a[(r1, 8)] = v * w;
    }

    // Solve A h = 0 via SVD: take the singular vector for the smallest singular value.
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(svd.singular_values.imin());
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let mut m = t_dst.try_inverse()? * h_norm * t_src;
    if !m.iter().all(|v| v.is_finite()) {
        return None;
    }
    let singular = m.singular_values();
    if singular.min() <= singular.max() * MIN_CONDITION {
        return None;
    }
    // normalise such that H[2,2] = 1
    let scale = m[(2, 2)];
    if scale.abs() > f64::EPSILON {
        m /= scale;
    } else {
        m /= m.norm();
    }
    Some(Homography(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warp() -> Homography {
        Homography::from_row_major([1.05, 0.08, 12.0, -0.04, 0.97, -7.5, 1e-4, -2e-4, 1.0])
    }

    fn grid(h: &Homography) -> Vec<Correspondence> {
        (0..5)
            .flat_map(|i| (0..4).map(move |j| Point2::new(30.0 * i as f64 + 5.0, 25.0 * j as f64)))
            .map(|src| Correspondence {
                src,
                dst: h.project(src).unwrap(),
            })
            .collect()
    }

    #[test]
    fn recovers_exact_homography() {
        let h = warp();
        let fitted = fit_homography(&grid(&h), None).unwrap();
        assert!((fitted.matrix() - h.matrix()).abs().max() < 1e-8);
    }

    #[test]
    fn minimal_sample_is_enough() {
        let h = warp();
        let corr = grid(&h);
        let sample = [corr[0], corr[3], corr[16], corr[19]];
        let fitted = fit_homography(&sample, None).unwrap();
        assert!((fitted.matrix() - h.matrix()).abs().max() < 1e-8);
    }

    #[test]
    fn zero_weights_ignore_outliers() {
        let h = warp();
        let mut corr = grid(&h);
        corr[7].dst.x += 40.0;
        let mut weights = vec![1.0; corr.len()];
        weights[7] = 0.0;
        let fitted = fit_homography(&corr, Some(&weights)).unwrap();
        assert!((fitted.matrix() - h.matrix()).abs().max() < 1e-8);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        let p = Point2::new(3.0, 4.0);
        let same = [Correspondence { src: p, dst: p }; 4];
        assert_eq!(fit_homography(&same, None), None);
        assert_eq!(fit_homography(&grid(&warp())[..3], None), None);
    }

    #[test]
    fn projection_and_inverse() {
        let h = warp();
        let p = Point2::new(40.0, 60.0);
        let q = h.project(p).unwrap();
        let back = h.inverse().unwrap().project(q).unwrap();
        assert!((back - p).norm() < 1e-9);
        assert_eq!(Homography::from_row_major(h.to_row_major()), h);
        assert_eq!(
            Homography::identity().project(p),
            Some(p)
        );
    }
}
