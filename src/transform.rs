use crate::{matrix, Error, Result};
use nalgebra::{DMatrix, DVector, Matrix3, Point2, Vector3};
use cv_core::sample_consensus::{Estimator, Model};
use cv_core::FeatureMatch;
use float_ord::FloatOrd;
use log::*;
use std::cmp::Reverse;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A planar correspondence: a point in the first image and its match in the second.
pub type PointMatch = FeatureMatch<Point2<f64>>;

/// Projective `w` below this is treated as a point at infinity.
const W_EPSILON: f64 = 1e-12;

/// Relative size below which a singular value of the DLT system counts as zero.
const RANK_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransformKind {
    Affine,
    Homography,
}

/// A 3x3 mapping of homogeneous image coordinates from the first image to the second.
///
/// Affine transforms always have `(0, 0, 1)` as their last row.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Transform {
    pub matrix: Matrix3<f64>,
    pub kind: TransformKind,
}

impl Transform {
    pub fn affine(matrix: Matrix3<f64>) -> Self {
        Self {
            matrix,
            kind: TransformKind::Affine,
        }
    }

    pub fn homography(matrix: Matrix3<f64>) -> Self {
        Self {
            matrix,
            kind: TransformKind::Homography,
        }
    }

    /// Maps a point, or returns `None` if it lands at infinity.
    pub fn apply(&self, point: &Point2<f64>) -> Option<Point2<f64>> {
        let mapped = self.matrix * Vector3::new(point.x, point.y, 1.0);
        if mapped.z.abs() < W_EPSILON {
            None
        } else {
            Some(Point2::new(mapped.x / mapped.z, mapped.y / mapped.z))
        }
    }
}

impl Model<PointMatch> for Transform {
    /// Reprojection error of the first point against the second, in pixels.
    fn residual(&self, data: &PointMatch) -> f64 {
        let FeatureMatch(a, b) = data;
        self.apply(a)
            .map_or(f64::INFINITY, |mapped| (mapped - b).norm())
    }
}

/// Least squares fit of a 6 parameter affine transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffineEstimator;

impl AffineEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` if the points do not determine a transform (fewer than 3, or
    /// collinear).
    pub fn fit<I>(&self, data: I) -> Option<Transform>
    where
        I: Iterator<Item = PointMatch>,
    {
        let data: Vec<PointMatch> = data.collect();
        if data.len() < <Self as Estimator<PointMatch>>::MIN_SAMPLES {
            return None;
        }
        let mut a = DMatrix::<f64>::zeros(2 * data.len(), 6);
        let mut b = DVector::<f64>::zeros(2 * data.len());
        for (i, FeatureMatch(from, to)) in data.iter().enumerate() {
            let row = 2 * i;
            a[(row, 0)] = from.x;
            a[(row, 1)] = from.y;
            a[(row, 2)] = 1.0;
            a[(row + 1, 3)] = from.x;
            a[(row + 1, 4)] = from.y;
            a[(row + 1, 5)] = 1.0;
            b[row] = to.x;
            b[row + 1] = to.y;
        }
        match matrix::solve_least_squares(&a, &b) {
            Ok(x) => Some(Transform::affine(Matrix3::new(
                x[0], x[1], x[2], x[3], x[4], x[5], 0.0, 0.0, 1.0,
            ))),
            Err(e) => {
                log_fit_failure("Affine", &e);
                None
            }
        }
    }
}

impl Estimator<PointMatch> for AffineEstimator {
    type Model = Transform;
    type ModelIter = Option<Transform>;
    const MIN_SAMPLES: usize = 3;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PointMatch> + Clone,
    {
        self.fit(data)
    }
}

/// Direct linear transform fit of a homography, normalized so that `h33 = 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HomographyEstimator;

impl HomographyEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` for degenerate configurations, such as fewer than 4 points, three
    /// collinear points in a minimal sample, or a solution with `h33 = 0`.
    pub fn fit<I>(&self, data: I) -> Option<Transform>
    where
        I: Iterator<Item = PointMatch>,
    {
        let data: Vec<PointMatch> = data.collect();
        if data.len() < <Self as Estimator<PointMatch>>::MIN_SAMPLES {
            return None;
        }
        // Condition both point sets before building the system.
        let from_norm = normalizing_transform(data.iter().map(|m| m.0))?;
        let to_norm = normalizing_transform(data.iter().map(|m| m.1))?;
        let to_denorm = to_norm.try_inverse()?;

        let mut a = DMatrix::<f64>::zeros(2 * data.len(), 9);
        for (i, FeatureMatch(from, to)) in data.iter().enumerate() {
            let p = from_norm.transform_point(from);
            let q = to_norm.transform_point(to);
            let row = 2 * i;
            a.row_mut(row).copy_from_slice(&[
                -p.x,
                -p.y,
                -1.0,
                0.0,
                0.0,
                0.0,
                p.x * q.x,
                p.y * q.x,
                q.x,
            ]);
            a.row_mut(row + 1).copy_from_slice(&[
                0.0,
                0.0,
                0.0,
                -p.x,
                -p.y,
                -1.0,
                p.x * q.y,
                p.y * q.y,
                q.y,
            ]);
        }
        // A unique solution needs the system to have rank 8.
        let mut singular_values: Vec<f64> = match matrix::svd(&a) {
            Ok(decomposition) => decomposition.singular_values.iter().copied().collect(),
            Err(e) => {
                log_fit_failure("Homography", &e);
                return None;
            }
        };
        singular_values.sort_by_key(|&v| Reverse(FloatOrd(v)));
        if singular_values.len() < 8 || singular_values[7] < RANK_TOLERANCE * singular_values[0] {
            trace!("Homography sample is degenerate.");
            return None;
        }
        let h = match matrix::null_vector(&a) {
            Ok(h) => h,
            Err(e) => {
                log_fit_failure("Homography", &e);
                return None;
            }
        };
        let normalized = Matrix3::from_row_slice(h.as_slice());
        let mut homography = to_denorm * normalized * from_norm;
        let scale = homography[(2, 2)];
        if scale.abs() < W_EPSILON {
            return None;
        }
        homography /= scale;
        if homography.determinant().abs() < W_EPSILON || !homography.iter().all(|v| v.is_finite())
        {
            return None;
        }
        Some(Transform::homography(homography))
    }
}

impl Estimator<PointMatch> for HomographyEstimator {
    type Model = Transform;
    type ModelIter = Option<Transform>;
    const MIN_SAMPLES: usize = 4;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PointMatch> + Clone,
    {
        self.fit(data)
    }
}

/// Similarity moving the centroid to the origin with mean distance `sqrt(2)`.
fn normalizing_transform(
    points: impl Iterator<Item = Point2<f64>> + Clone,
) -> Option<Matrix3<f64>> {
    let count = points.clone().count() as f64;
    let centroid = points.clone().fold(Vector3::zeros(), |acc, p| {
        acc + Vector3::new(p.x, p.y, 0.0)
    }) / count;
    let mean_distance = points
        .map(|p| ((p.x - centroid.x).powi(2) + (p.y - centroid.y).powi(2)).sqrt())
        .sum::<f64>()
        / count;
    if mean_distance.is_nan() || mean_distance <= W_EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_distance;
    Some(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

/// Indices of the four points with the largest sum of pairwise distances.
///
/// Exhaustive over all quadruples; ties keep the first quadruple in lexicographic
/// order.
pub fn furthest_quadrilateral(points: &[Point2<f64>]) -> Result<[usize; 4]> {
    let n = points.len();
    if n < 4 {
        return Err(Error::InsufficientPoints {
            required: 4,
            actual: n,
        });
    }
    let d = |i: usize, j: usize| (points[i] - points[j]).norm();
    let mut best = [0, 1, 2, 3];
    let mut best_sum = f64::NEG_INFINITY;
    for i in 0..n - 3 {
        for j in i + 1..n - 2 {
            for k in j + 1..n - 1 {
                let partial = d(i, j) + d(i, k) + d(j, k);
                for l in k + 1..n {
                    let sum = partial + d(i, l) + d(j, l) + d(k, l);
                    if sum > best_sum {
                        best_sum = sum;
                        best = [i, j, k, l];
                    }
                }
            }
        }
    }
    Ok(best)
}

/// Degenerate samples are routine during consensus, anything else is worth a debug line.
fn log_fit_failure(kind: &str, e: &Error) {
    if e.is_numerical() {
        trace!("{} fit failed on a degenerate sample: {}", kind, e);
    } else {
        debug!("{} fit failed: {}", kind, e);
    }
}
