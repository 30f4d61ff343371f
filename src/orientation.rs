use crate::image::GrayFloatImage;
use crate::pyramid::{Gaussian, Pyramid};
use crate::{DetectionSite, Feature, Sift};
use log::*;
use std::collections::VecDeque;
use std::f32::consts::PI;

impl Sift {
    /// Assign one or more orientations to every detection site.
    ///
    /// Sites are consumed from a FIFO queue. Each site produces one feature per
    /// qualifying peak of its gradient orientation histogram, in bin order, so a site on
    /// a featureless patch produces nothing.
    pub(crate) fn assign_orientations(
        &self,
        gaussian: &Pyramid<Gaussian>,
        sites: Vec<DetectionSite>,
    ) -> Vec<Feature> {
        let mut queue: VecDeque<DetectionSite> = sites.into();
        let mut features = Vec::with_capacity(queue.len());
        while let Some(site) = queue.pop_front() {
            let image = &gaussian[site.octave][site.level];
            let mut histogram = self.orientation_histogram(image, &site);
            for _ in 0..self.orientation_smooth_passes {
                smooth_histogram(&mut histogram);
            }
            features.extend(
                self.dominant_orientations(&histogram)
                    .into_iter()
                    .map(|orientation| Feature::unfinished(site, orientation)),
            );
        }
        debug!("Assigned orientations to {} features.", features.len());
        features
    }

    /// Gaussian weighted histogram of gradient orientations around the site.
    pub(crate) fn orientation_histogram(
        &self,
        image: &GrayFloatImage,
        site: &DetectionSite,
    ) -> Vec<f32> {
        let bins = self.orientation_bins;
        let radius = (self.orientation_radius_factor * site.scale_octave).round() as isize;
        let sigma = self.orientation_sigma_factor * site.scale_octave;
        let exp_denom = 2.0 * sigma * sigma;
        let mut histogram = vec![0f32; bins];
        for i in -radius..=radius {
            for j in -radius..=radius {
                let x = site.column as isize + j;
                let y = site.row as isize + i;
                if let Some((magnitude, orientation)) = image.gradient(x, y) {
                    let weight = (-((i * i + j * j) as f32) / exp_denom).exp();
                    let bin = (bins as f32 * (orientation + PI) / (2.0 * PI)).round() as usize;
                    let bin = if bin < bins { bin } else { 0 };
                    histogram[bin] += weight * magnitude;
                }
            }
        }
        histogram
    }

    /// Interpolated angles of the histogram peaks within `orientation_peak_ratio` of the
    /// maximum, each in `(-pi, pi]`.
    pub(crate) fn dominant_orientations(&self, histogram: &[f32]) -> Vec<f32> {
        let n = histogram.len();
        let maximum = histogram.iter().copied().fold(0f32, f32::max);
        let threshold = maximum * self.orientation_peak_ratio;
        let mut orientations = vec![];
        for i in 0..n {
            let left = histogram[(i + n - 1) % n];
            let center = histogram[i];
            let right = histogram[(i + 1) % n];
            if center > left && center > right && center >= threshold {
                let mut bin = i as f32 + 0.5 * (left - right) / (left - 2.0 * center + right);
                if bin < 0.0 {
                    bin += n as f32;
                } else if bin >= n as f32 {
                    bin -= n as f32;
                }
                let mut angle = 2.0 * PI * bin / n as f32 - PI;
                if angle <= -PI {
                    angle += 2.0 * PI;
                }
                orientations.push(angle);
            }
        }
        orientations
    }
}

/// One circular pass of the `[1/4, 1/2, 1/4]` kernel.
pub(crate) fn smooth_histogram(histogram: &mut [f32]) {
    let n = histogram.len();
    if n == 0 {
        return;
    }
    let first = histogram[0];
    let mut previous = histogram[n - 1];
    for i in 0..n {
        let current = histogram[i];
        let next = if i + 1 == n { first } else { histogram[i + 1] };
        histogram[i] = 0.25 * previous + 0.5 * current + 0.25 * next;
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{ImageBuffer, Luma};

    fn site_at(column: usize, row: usize) -> DetectionSite {
        DetectionSite {
            octave: 0,
            level: 1,
            row,
            column,
            sub_row: 0.0,
            sub_col: 0.0,
            sub_level: 0.0,
            scale_octave: 2.0,
            response: 1.0,
        }
    }

    fn histogram_with(peaks: &[(usize, f32)]) -> Vec<f32> {
        let mut histogram = vec![0f32; 36];
        for &(bin, value) in peaks {
            histogram[bin] = value;
        }
        histogram
    }

    #[test]
    fn smoothing_is_circular_and_keeps_mass() {
        let mut histogram = histogram_with(&[(0, 4.0)]);
        smooth_histogram(&mut histogram);
        assert_relative_eq!(histogram[35], 1.0);
        assert_relative_eq!(histogram[0], 2.0);
        assert_relative_eq!(histogram[1], 1.0);
        assert_relative_eq!(histogram.iter().sum::<f32>(), 4.0);
    }

    #[test]
    fn single_peak_maps_to_bin_angle() {
        let orientations = Sift::default().dominant_orientations(&histogram_with(&[(9, 1.0)]));
        assert_eq!(orientations.len(), 1);
        assert_relative_eq!(orientations[0], -PI / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn secondary_peaks_above_ratio_are_kept() {
        let sift = Sift::default();
        let both = sift.dominant_orientations(&histogram_with(&[(0, 1.0), (18, 0.85)]));
        assert_eq!(both.len(), 2);
        // Bin 0 sits exactly on -pi, which is reported as pi.
        assert_relative_eq!(both[0], PI, epsilon = 1e-6);
        assert_relative_eq!(both[1], 0.0, epsilon = 1e-6);

        let one = sift.dominant_orientations(&histogram_with(&[(0, 1.0), (18, 0.75)]));
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn interpolation_leans_to_larger_neighbour() {
        let orientations =
            Sift::default().dominant_orientations(&histogram_with(&[(17, 0.5), (18, 1.0)]));
        assert_eq!(orientations.len(), 1);
        let bin = 18.0 - 1.0 / 6.0;
        assert_relative_eq!(orientations[0], 2.0 * PI * bin / 36.0 - PI, epsilon = 1e-5);
    }

    #[test]
    fn empty_histogram_has_no_orientation() {
        assert!(Sift::default()
            .dominant_orientations(&vec![0f32; 36])
            .is_empty());
    }

    #[test]
    fn horizontal_ramp_points_along_x() {
        let image = GrayFloatImage(ImageBuffer::from_fn(31, 31, |x, _| {
            Luma([x as f32 * 0.01])
        }));
        let sift = Sift::default();
        let mut histogram = sift.orientation_histogram(&image, &site_at(15, 15));
        smooth_histogram(&mut histogram);
        let orientations = sift.dominant_orientations(&histogram);
        assert_eq!(orientations.len(), 1);
        assert_relative_eq!(orientations[0], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn bright_top_points_up() {
        let image = GrayFloatImage(ImageBuffer::from_fn(31, 31, |_, y| {
            Luma([(31 - y) as f32 * 0.01])
        }));
        let sift = Sift::default();
        let histogram = sift.orientation_histogram(&image, &site_at(15, 15));
        let orientations = sift.dominant_orientations(&histogram);
        assert_eq!(orientations.len(), 1);
        assert_relative_eq!(orientations[0], PI / 2.0, epsilon = 1e-5);
    }
}
