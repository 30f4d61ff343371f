use crate::image::GrayFloatImage;
use crate::pyramid::{Gaussian, Pyramid};
use crate::{DetectionSite, Feature, Sift};
use ndarray::Array3;
use std::f32::consts::{PI, SQRT_2};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

impl Sift {
    /// Fill in the descriptor of every feature.
    ///
    /// # Arguments
    /// * `gaussian` - the Gaussian pyramid the features were detected in.
    /// * `features` - oriented features, updated in place.
    pub(crate) fn compute_descriptors(
        &self,
        gaussian: &Pyramid<Gaussian>,
        features: &mut [Feature],
    ) {
        #[cfg(not(feature = "rayon"))]
        {
            features.iter_mut().for_each(|feature| {
                let image = &gaussian[feature.site.octave][feature.site.level];
                feature.descriptor = self.descriptor(image, &feature.site, feature.orientation);
            });
        }
        #[cfg(feature = "rayon")]
        {
            features.par_iter_mut().for_each(|feature| {
                let image = &gaussian[feature.site.octave][feature.site.level];
                feature.descriptor = self.descriptor(image, &feature.site, feature.orientation);
            });
        }
    }

    /// Quantized gradient histogram descriptor of `descriptor_width^2 * descriptor_bins`
    /// entries, each an integer in `[0, 255]`.
    pub fn descriptor(
        &self,
        image: &GrayFloatImage,
        site: &DetectionSite,
        orientation: f32,
    ) -> Vec<f32> {
        let histogram = self.descriptor_histogram(image, site, orientation);
        let normalized = self.normalize_descriptor(histogram.iter().copied().collect());
        self.quantize_descriptor(&normalized)
    }

    /// Samples gradients in a window rotated to `orientation` and spreads them over a
    /// `width x width x bins` histogram.
    pub(crate) fn descriptor_histogram(
        &self,
        image: &GrayFloatImage,
        site: &DetectionSite,
        orientation: f32,
    ) -> Array3<f32> {
        let d = self.descriptor_width;
        let bins = self.descriptor_bins;
        let mut histogram = Array3::zeros((d, d, bins));

        let cos_t = orientation.cos();
        let sin_t = orientation.sin();
        let bins_per_rad = bins as f32 / (2.0 * PI);
        let exp_denom = (d * d) as f32 * 0.5;
        let hist_width = self.descriptor_scale_factor * site.scale_octave;
        let radius = (hist_width * SQRT_2 * (d as f32 + 1.0) * 0.5 + 0.5) as isize;
        // Shifted so that a sample in the middle of a cell lands on an integer bin.
        let center_offset = (d / 2) as f32 - 0.5;

        for i in -radius..=radius {
            for j in -radius..=radius {
                let c_rot = (j as f32 * cos_t - i as f32 * sin_t) / hist_width;
                let r_rot = (j as f32 * sin_t + i as f32 * cos_t) / hist_width;
                let rbin = r_rot + center_offset;
                let cbin = c_rot + center_offset;
                if rbin <= -1.0 || rbin >= d as f32 || cbin <= -1.0 || cbin >= d as f32 {
                    continue;
                }
                let x = site.column as isize + j;
                let y = site.row as isize + i;
                if let Some((magnitude, gradient_orientation)) = image.gradient(x, y) {
                    let mut relative = (gradient_orientation - orientation).rem_euclid(2.0 * PI);
                    if relative >= 2.0 * PI {
                        relative = 0.0;
                    }
                    let weight = (-(c_rot * c_rot + r_rot * r_rot) / exp_denom).exp();
                    distribute(
                        &mut histogram,
                        rbin,
                        cbin,
                        relative * bins_per_rad,
                        magnitude * weight,
                    );
                }
            }
        }
        histogram
    }

    /// Normalize, clamp large entries to `descriptor_magnitude_threshold`, normalize
    /// again. An all-zero histogram is returned unchanged.
    pub(crate) fn normalize_descriptor(&self, mut values: Vec<f32>) -> Vec<f32> {
        normalize(&mut values);
        for value in values.iter_mut() {
            *value = value.min(self.descriptor_magnitude_threshold);
        }
        normalize(&mut values);
        values
    }

    pub(crate) fn quantize_descriptor(&self, values: &[f32]) -> Vec<f32> {
        values
            .iter()
            .map(|&value| {
                let scaled = (self.descriptor_quantization_factor * value) as i32;
                scaled.clamp(0, 255) as f32
            })
            .collect()
    }
}

/// Trilinear interpolation of one weighted sample into the histogram.
///
/// Row and column bins outside `[0, width)` receive nothing; orientation bins wrap.
fn distribute(histogram: &mut Array3<f32>, rbin: f32, cbin: f32, obin: f32, magnitude: f32) {
    let (d_rows, d_cols, bins) = histogram.dim();
    let r0 = rbin.floor();
    let c0 = cbin.floor();
    let o0 = obin.floor();
    let d_r = rbin - r0;
    let d_c = cbin - c0;
    let d_o = obin - o0;
    let (r0, c0, o0) = (r0 as isize, c0 as isize, o0 as isize);

    for (r, w_r) in [(r0, 1.0 - d_r), (r0 + 1, d_r)] {
        if r < 0 || r >= d_rows as isize {
            continue;
        }
        for (c, w_c) in [(c0, 1.0 - d_c), (c0 + 1, d_c)] {
            if c < 0 || c >= d_cols as isize {
                continue;
            }
            for (o, w_o) in [(o0, 1.0 - d_o), (o0 + 1, d_o)] {
                let o = o.rem_euclid(bins as isize) as usize;
                histogram[[r as usize, c as usize, o]] += magnitude * w_r * w_c * w_o;
            }
        }
    }
}

fn normalize(values: &mut [f32]) {
    let norm = values
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        for value in values.iter_mut() {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
}
