use crate::matrix;
use crate::pyramid::{DifferenceOfGaussians, Octave, Pyramid};
use crate::{DetectionSite, Result, ScaleDerivative, Sift};
use nalgebra::{DMatrix, DVector};
use log::*;

/// Added to the diagonal of the Hessian before it is inverted.
const HESSIAN_REGULARIZATION: f64 = 1e-10;

impl Sift {
    /// Find the refined extrema of every octave of a difference of Gaussians pyramid.
    pub(crate) fn find_scale_space_extrema(
        &self,
        dog: &Pyramid<DifferenceOfGaussians>,
    ) -> Vec<DetectionSite> {
        let sites: Vec<DetectionSite> = dog
            .iter()
            .enumerate()
            .flat_map(|(octave_index, octave)| self.find_octave_extrema(octave_index, octave))
            .collect();
        debug!("Kept {} refined scale space extrema.", sites.len());
        sites
    }

    /// Scans levels `1..=levels` of one octave for strict 26-neighbour extrema and
    /// refines each of them.
    pub(crate) fn find_octave_extrema(
        &self,
        octave_index: usize,
        octave: &Octave<DifferenceOfGaussians>,
    ) -> Vec<DetectionSite> {
        let border = self.image_border.max(1);
        let width = octave.width();
        let height = octave.height();
        let threshold = 0.5 * self.contrast_threshold / self.levels as f32;
        let last_level = self.levels.min(octave.len().saturating_sub(2));
        let mut candidates = 0usize;
        let mut sites = vec![];
        for level in 1..=last_level {
            for y in border..height.saturating_sub(border) {
                for x in border..width.saturating_sub(border) {
                    if octave.value(level, x, y).abs() <= threshold
                        || !is_local_extremum(octave, level, x, y)
                    {
                        continue;
                    }
                    candidates += 1;
                    if let Some(site) = self.refine_extremum(octave_index, octave, level, x, y) {
                        sites.push(site);
                    }
                }
            }
        }
        trace!(
            "Octave {}: {} candidates, {} survived refinement.",
            octave_index,
            candidates,
            sites.len()
        );
        sites
    }

    /// Newton iteration towards the sub-sample extremum near `(x, y, level)`.
    ///
    /// Returns `None` when the iteration leaves the valid region, does not settle within
    /// `max_interpolation_steps`, hits a singular Hessian, or when the refined point
    /// fails the edge test. With `refined_contrast_check` the interpolated response must
    /// also clear `contrast_threshold / levels`.
    pub(crate) fn refine_extremum(
        &self,
        octave_index: usize,
        octave: &Octave<DifferenceOfGaussians>,
        mut level: usize,
        mut x: usize,
        mut y: usize,
    ) -> Option<DetectionSite> {
        let border = self.image_border.max(1) as isize;
        let width = octave.width() as isize;
        let height = octave.height() as isize;
        for _ in 0..self.max_interpolation_steps {
            let (gradient, hessian) = local_derivatives(octave, level, x, y, self.scale_derivative);
            let offset = match newton_step(&gradient, &hessian) {
                Ok(offset) => offset,
                Err(e) if e.is_numerical() => {
                    trace!("Dropping extremum at ({}, {}, {}): {}", x, y, level, e);
                    return None;
                }
                Err(e) => {
                    debug!("Newton step at ({}, {}, {}) failed: {}", x, y, level, e);
                    return None;
                }
            };
            if !offset.iter().all(|o| o.is_finite()) {
                return None;
            }
            if offset.iter().all(|o| o.abs() < 0.5) {
                return self.accept_extremum(octave_index, octave, level, x, y, &gradient, &offset);
            }
            let next_x = x as isize + offset[0].round() as isize;
            let next_y = y as isize + offset[1].round() as isize;
            let next_level = level as isize + offset[2].round() as isize;
            if next_level < 1
                || next_level > self.levels as isize
                || next_x < border
                || next_y < border
                || next_x >= width - border
                || next_y >= height - border
            {
                trace!("Extremum at ({}, {}, {}) left the valid region.", x, y, level);
                return None;
            }
            x = next_x as usize;
            y = next_y as usize;
            level = next_level as usize;
        }
        trace!(
            "Extremum near ({}, {}, {}) did not converge in {} steps.",
            x,
            y,
            level,
            self.max_interpolation_steps
        );
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_extremum(
        &self,
        octave_index: usize,
        octave: &Octave<DifferenceOfGaussians>,
        level: usize,
        x: usize,
        y: usize,
        gradient: &DVector<f64>,
        offset: &DVector<f64>,
    ) -> Option<DetectionSite> {
        let response = f64::from(octave.value(level, x, y)) + 0.5 * gradient.dot(offset);
        if self.refined_contrast_check
            && response.abs() < f64::from(self.contrast_threshold) / self.levels as f64
        {
            return None;
        }
        if self.is_edge(octave, level, x, y) {
            return None;
        }
        let sub_level = offset[2] as f32;
        Some(DetectionSite {
            octave: octave_index,
            level,
            row: y,
            column: x,
            sub_row: offset[1] as f32,
            sub_col: offset[0] as f32,
            sub_level,
            scale_octave: self.sigma * 2f32.powf((level as f32 + sub_level) / self.levels as f32),
            response: response as f32,
        })
    }

    /// Principal curvature ratio test on the 2x2 spatial Hessian.
    fn is_edge(
        &self,
        octave: &Octave<DifferenceOfGaussians>,
        level: usize,
        x: usize,
        y: usize,
    ) -> bool {
        let d = |x: usize, y: usize| f64::from(octave.value(level, x, y));
        let center = d(x, y);
        let dxx = d(x + 1, y) + d(x - 1, y) - 2.0 * center;
        let dyy = d(x, y + 1) + d(x, y - 1) - 2.0 * center;
        let dxy = (d(x + 1, y + 1) - d(x - 1, y + 1) - d(x + 1, y - 1) + d(x - 1, y - 1)) / 4.0;
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        let r = f64::from(self.edge_threshold);
        det <= 0.0 || trace * trace / det >= (r + 1.0) * (r + 1.0) / r
    }
}

/// Strictly greater than all 26 neighbours or strictly less than all of them.
/// `-(H + eI)^-1 g`, the offset from the sample to the extremum of the local quadratic.
fn newton_step(gradient: &DVector<f64>, hessian: &DMatrix<f64>) -> Result<DVector<f64>> {
    let inverse = matrix::invert(hessian, HESSIAN_REGULARIZATION)?;
    let gradient = DMatrix::from_column_slice(gradient.len(), 1, gradient.as_slice());
    let step = matrix::multiply(&inverse, &gradient)?;
    Ok(-step.column(0).into_owned())
}

fn is_local_extremum(
    octave: &Octave<DifferenceOfGaussians>,
    level: usize,
    x: usize,
    y: usize,
) -> bool {
    let value = octave.value(level, x, y);
    let mut neighbors = (level - 1..=level + 1)
        .flat_map(|l| {
            (y - 1..=y + 1).flat_map(move |ny| (x - 1..=x + 1).map(move |nx| (l, nx, ny)))
        })
        .filter(|&sample| sample != (level, x, y))
        .map(|(l, nx, ny)| octave.value(l, nx, ny));
    if value > 0.0 {
        neighbors.all(|n| value > n)
    } else {
        neighbors.all(|n| value < n)
    }
}

/// Gradient `(dx, dy, ds)` and Hessian by central differences.
fn local_derivatives(
    octave: &Octave<DifferenceOfGaussians>,
    level: usize,
    x: usize,
    y: usize,
    scale_derivative: ScaleDerivative,
) -> (DVector<f64>, DMatrix<f64>) {
    let d = |l: usize, x: usize, y: usize| f64::from(octave.value(l, x, y));
    let (prev, next) = (level - 1, level + 1);
    let center = d(level, x, y);

    let dx = (d(level, x + 1, y) - d(level, x - 1, y)) / 2.0;
    let dy = (d(level, x, y + 1) - d(level, x, y - 1)) / 2.0;
    let ds = match scale_derivative {
        ScaleDerivative::Central => (d(next, x, y) - d(prev, x, y)) / 2.0,
        ScaleDerivative::SameLevel => 0.0,
    };

    let dxx = d(level, x + 1, y) + d(level, x - 1, y) - 2.0 * center;
    let dyy = d(level, x, y + 1) + d(level, x, y - 1) - 2.0 * center;
    let dss = d(next, x, y) + d(prev, x, y) - 2.0 * center;
    let dxy = (d(level, x + 1, y + 1) - d(level, x - 1, y + 1) - d(level, x + 1, y - 1)
        + d(level, x - 1, y - 1))
        / 4.0;
    let dxs = (d(next, x + 1, y) - d(next, x - 1, y) - d(prev, x + 1, y) + d(prev, x - 1, y)) / 4.0;
    let dys = (d(next, x, y + 1) - d(next, x, y - 1) - d(prev, x, y + 1) + d(prev, x, y - 1)) / 4.0;

    let gradient = DVector::from_column_slice(&[dx, dy, ds]);
    let hessian = DMatrix::from_row_slice(3, 3, &[dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss]);
    (gradient, hessian)
}
