//! Scale invariant feature transform (SIFT) keypoints and descriptors, together with
//! the pieces needed to put them to use: k-d tree descriptor matching with Lowe's
//! ratio test and RANSAC verification of matches under an affine or projective model.
//!
//! ```
//! use sift::{GrayFloatImage, Sift};
//!
//! let image = GrayFloatImage::new(64, 64);
//! let features = Sift::default().extract(&image).unwrap();
//! assert!(features.is_empty());
//! ```

mod consensus;
mod descriptors;
mod errors;
mod extrema;
pub mod image;
pub mod kdtree;
mod matching;
pub mod matrix;
mod orientation;
pub mod pyramid;
pub mod transform;

pub use crate::consensus::{Ransac, Verification};
pub use crate::errors::{Error, Result};
pub use crate::image::GrayFloatImage;
pub use crate::kdtree::{KdTree, Neighbor};
pub use crate::matching::{best_matches, knn_match, Match, Matcher};
pub use crate::transform::{AffineEstimator, HomographyEstimator, Transform, TransformKind};

use crate::image::gaussian_blur;
use crate::pyramid::{number_of_octaves, Gaussian, Pyramid};
use ::image::DynamicImage;
use nalgebra::Point2;
use cv_core::ImagePoint;
use float_ord::FloatOrd;
use log::*;
use std::cmp::Reverse;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How the derivative along scale is taken during extremum refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ScaleDerivative {
    /// Central difference between the levels above and below.
    #[default]
    Central,
    /// Differences taken within the level itself, which makes the scale gradient zero.
    /// Sub-level offsets then come from the Hessian coupling alone.
    SameLevel,
}

/// A refined extremum of the difference of Gaussians pyramid.
///
/// Integer coordinates are in the pixel grid of the octave, offsets are in units of
/// that grid and of levels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectionSite {
    pub octave: usize,
    pub level: usize,
    pub row: usize,
    pub column: usize,
    pub sub_row: f32,
    pub sub_col: f32,
    pub sub_level: f32,
    /// Blur of the site relative to its octave: `sigma * 2^((level + sub_level) / levels)`.
    pub scale_octave: f32,
    /// Interpolated difference of Gaussians value at the refined location.
    pub response: f32,
}

impl DetectionSite {
    /// Location in the pixel grid of the upsampled base image.
    pub fn point(&self) -> (f32, f32) {
        let factor = self.octave_factor();
        (
            (self.column as f32 + self.sub_col) * factor,
            (self.row as f32 + self.sub_row) * factor,
        )
    }

    /// Scale in the pixel grid of the upsampled base image.
    pub fn scale(&self) -> f32 {
        self.scale_octave * self.octave_factor()
    }

    fn octave_factor(&self) -> f32 {
        2f32.powi(self.octave as i32)
    }
}

/// An oriented keypoint with its descriptor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Feature {
    /// Horizontal coordinate in the input image, +x to the right.
    pub x: f32,
    /// Vertical coordinate in the input image, +y down.
    pub y: f32,
    /// Blur at which the feature was detected, in input image pixels.
    pub scale: f32,
    /// Dominant gradient direction in radians, in `(-pi, pi]`.
    pub orientation: f32,
    /// `descriptor_width^2 * descriptor_bins` integer values in `[0, 255]`.
    pub descriptor: Vec<f32>,
    pub site: DetectionSite,
}

impl Feature {
    /// A feature located in base image coordinates with an empty descriptor.
    pub(crate) fn unfinished(site: DetectionSite, orientation: f32) -> Self {
        let (x, y) = site.point();
        Self {
            x,
            y,
            scale: site.scale(),
            orientation,
            descriptor: vec![],
            site,
        }
    }
}

impl ImagePoint for Feature {
    fn image_point(&self) -> Point2<f64> {
        Point2::new(self.x as f64, self.y as f64)
    }
}

/// Contains the configuration parameters of SIFT.
///
/// The parameter most worth tuning is `contrast_threshold`. [`Sift::new`] sets it and
/// leaves everything else default; [`Sift::sparse`] and [`Sift::dense`] are shortcuts.
/// The default is `0.03`. [`Sift::lowe`] gives the parameters of Lowe's paper instead.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sift {
    /// Blur of level 0 of every octave
    pub sigma: f32,

    /// Number of levels per octave searched for extrema
    pub levels: usize,

    /// Blur assumed to be present in the input image
    pub initial_sigma: f32,

    /// Pixels at the edge of each octave that are never searched
    pub image_border: usize,

    /// Minimum absolute difference of Gaussians response, divided by `levels`
    pub contrast_threshold: f32,

    /// Also apply `contrast_threshold` to the interpolated response of a refined extremum
    pub refined_contrast_check: bool,

    /// Maximum ratio of principal curvatures
    pub edge_threshold: f32,

    /// Newton steps allowed before an extremum is dropped
    pub max_interpolation_steps: usize,

    pub scale_derivative: ScaleDerivative,

    pub orientation_bins: usize,

    /// Radius of the orientation window in units of the site scale
    pub orientation_radius_factor: f32,

    /// Gaussian weight of the orientation window in units of the site scale
    pub orientation_sigma_factor: f32,

    pub orientation_smooth_passes: usize,

    /// Fraction of the highest orientation peak another peak needs to become a feature
    pub orientation_peak_ratio: f32,

    /// Spatial cells along each side of the descriptor window
    pub descriptor_width: usize,

    /// Orientation bins per descriptor cell
    pub descriptor_bins: usize,

    /// Cell width in units of the site scale
    pub descriptor_scale_factor: f32,

    /// Values of the normalized descriptor are clamped to this
    pub descriptor_magnitude_threshold: f32,

    pub descriptor_quantization_factor: f32,
}

impl Sift {
    /// This convenience constructor is provided for the very common case
    /// that the contrast threshold needs to be modified.
    pub fn new(contrast_threshold: f32) -> Self {
        Self {
            contrast_threshold,
            ..Default::default()
        }
    }

    /// Create a `Sift` that sparsely detects features.
    ///
    /// Uses a contrast threshold of `0.06` (default is `0.03`).
    pub fn sparse() -> Self {
        Self::new(0.06)
    }

    /// Create a `Sift` that densely detects features.
    ///
    /// Uses a contrast threshold of `0.015` (default is `0.03`).
    pub fn dense() -> Self {
        Self::new(0.015)
    }

    /// Parameters from Lowe's paper: `sigma` of `1.6`, contrast threshold of `0.04`
    /// checked again after refinement, and an orientation window of `3 * 1.5` scales.
    pub fn lowe() -> Self {
        Self {
            sigma: 1.6,
            contrast_threshold: 0.04,
            refined_contrast_check: true,
            orientation_radius_factor: 4.5,
            ..Default::default()
        }
    }

    /// Checks the parameters that would otherwise make extraction meaningless or panic.
    pub fn validate(&self) -> Result<()> {
        if self.levels == 0 {
            return Err(Error::InvalidConfig("levels must be at least 1"));
        }
        if self.sigma.is_nan() || self.sigma <= 0.0 {
            return Err(Error::InvalidConfig("sigma must be positive"));
        }
        if self.descriptor_width == 0 {
            return Err(Error::InvalidConfig("descriptor_width must be at least 1"));
        }
        if self.descriptor_bins == 0 {
            return Err(Error::InvalidConfig("descriptor_bins must be at least 1"));
        }
        if self.orientation_bins < 3 {
            return Err(Error::InvalidConfig("orientation_bins must be at least 3"));
        }
        Ok(())
    }

    /// Length of the descriptors this configuration produces.
    pub fn descriptor_size(&self) -> usize {
        self.descriptor_width * self.descriptor_width * self.descriptor_bins
    }

    /// The first level of the pyramid: the input doubled in size and blurred up to
    /// `sigma`, assuming the doubled input already carries `2 * initial_sigma`.
    pub fn base_image(&self, image: &GrayFloatImage) -> GrayFloatImage {
        let doubled = image.double_size();
        let assumed = 2.0 * self.initial_sigma;
        let sigma_diff = (self.sigma * self.sigma - assumed * assumed)
            .max(0.01)
            .sqrt();
        gaussian_blur(&doubled, sigma_diff)
    }

    /// Extract features using the SIFT feature extractor.
    ///
    /// This performs all operations end-to-end. The pyramids are built from the input
    /// doubled in size, and the resulting features are mapped back to input
    /// coordinates. Features are sorted by descending scale; the sort is stable, so
    /// features of equal scale stay in detection order.
    ///
    /// # Example
    /// ```
    /// use sift::{GrayFloatImage, Sift};
    ///
    /// let mut image = GrayFloatImage::new(64, 64);
    /// for y in 0..64 {
    ///     for x in 0..64 {
    ///         let r2 = (x as f32 - 32.0).powi(2) + (y as f32 - 32.0).powi(2);
    ///         image.put(x, y, (-r2 / 18.0).exp());
    ///     }
    /// }
    /// let features = Sift::default().extract(&image).unwrap();
    /// assert!(features.iter().all(|f| f.descriptor.len() == 128));
    /// ```
    pub fn extract(&self, image: &GrayFloatImage) -> Result<Vec<Feature>> {
        self.validate()?;
        let octaves = number_of_octaves(2 * image.width(), 2 * image.height())?;
        let base = self.base_image(image);
        trace!("Building {} octaves of {} levels.", octaves, self.levels);
        let gaussian = Pyramid::<Gaussian>::build(base, octaves, self.levels, self.sigma);
        let dog = gaussian.difference_of_gaussians();
        trace!("Finding scale space extrema.");
        let sites = self.find_scale_space_extrema(&dog);
        trace!("Assigning orientations.");
        let mut features = self.assign_orientations(&gaussian, sites);
        trace!("Extracting descriptors.");
        self.compute_descriptors(&gaussian, &mut features);
        for feature in &mut features {
            feature.x *= 0.5;
            feature.y *= 0.5;
            feature.scale *= 0.5;
        }
        features.sort_by_key(|feature| Reverse(FloatOrd(feature.scale)));
        info!("Extracted {} features", features.len());
        Ok(features)
    }

    /// Extract features from any image, converting it to grayscale first.
    pub fn extract_image(&self, image: &DynamicImage) -> Result<Vec<Feature>> {
        self.extract(&GrayFloatImage::from_dynamic(image))
    }
}

impl Default for Sift {
    fn default() -> Sift {
        Sift {
            sigma: 1.7,
            levels: 3,
            initial_sigma: 0.5,
            image_border: 3,
            contrast_threshold: 0.03,
            refined_contrast_check: false,
            edge_threshold: 10.0,
            max_interpolation_steps: 5,
            scale_derivative: ScaleDerivative::Central,
            orientation_bins: 36,
            orientation_radius_factor: 7.5,
            orientation_sigma_factor: 1.5,
            orientation_smooth_passes: 2,
            orientation_peak_ratio: 0.8,
            descriptor_width: 4,
            descriptor_bins: 8,
            descriptor_scale_factor: 3.0,
            descriptor_magnitude_threshold: 0.2,
            descriptor_quantization_factor: 512.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_only_change_the_contrast_threshold() {
        let default = Sift::default();
        assert_eq!(default.descriptor_size(), 128);
        assert_eq!(Sift::new(0.03), default);
        assert_eq!(
            Sift {
                contrast_threshold: 0.03,
                ..Sift::sparse()
            },
            default
        );
        assert!(Sift::dense().contrast_threshold < default.contrast_threshold);
    }

    #[test]
    fn defaults_and_lowe_preset() {
        let default = Sift::default();
        assert_eq!(default.sigma, 1.7);
        assert_eq!(default.contrast_threshold, 0.03);
        assert_eq!(default.orientation_radius_factor, 7.5);
        assert!(!default.refined_contrast_check);

        let lowe = Sift::lowe();
        assert!(lowe.validate().is_ok());
        assert_eq!(
            (lowe.sigma, lowe.contrast_threshold, lowe.orientation_radius_factor),
            (1.6, 0.04, 4.5)
        );
        assert!(lowe.refined_contrast_check);
        assert_eq!(lowe.descriptor_size(), default.descriptor_size());
    }

    #[test]
    fn flat_dynamic_image_has_no_features() {
        let flat = ::image::GrayImage::from_pixel(64, 64, ::image::Luma([128]));
        let features = Sift::default()
            .extract_image(&DynamicImage::ImageLuma8(flat))
            .unwrap();
        assert!(features.is_empty());
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(Sift::default().validate().is_ok());
        let broken = [
            Sift {
                levels: 0,
                ..Default::default()
            },
            Sift {
                sigma: 0.0,
                ..Default::default()
            },
            Sift {
                sigma: f32::NAN,
                ..Default::default()
            },
            Sift {
                descriptor_width: 0,
                ..Default::default()
            },
            Sift {
                descriptor_bins: 0,
                ..Default::default()
            },
            Sift {
                orientation_bins: 2,
                ..Default::default()
            },
        ];
        for sift in broken {
            assert!(matches!(sift.validate(), Err(Error::InvalidConfig(_))));
            let image = GrayFloatImage::new(32, 32);
            assert!(matches!(sift.extract(&image), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn tiny_images_are_rejected() {
        let sift = Sift::default();
        for (width, height) in [(0, 0), (3, 40), (40, 3)] {
            assert!(matches!(
                sift.extract(&GrayFloatImage::new(width, height)),
                Err(Error::ImageTooSmall { .. })
            ));
        }
        assert!(sift.extract(&GrayFloatImage::new(4, 4)).is_ok());
    }

    #[test]
    fn site_coordinates_scale_with_the_octave() {
        let site = DetectionSite {
            octave: 2,
            row: 5,
            column: 3,
            sub_row: 0.25,
            sub_col: -0.5,
            scale_octave: 1.5,
            ..Default::default()
        };
        assert_eq!(site.point(), (10.0, 21.0));
        assert_eq!(site.scale(), 6.0);
        let feature = Feature::unfinished(site, 0.5);
        assert_eq!((feature.x, feature.y, feature.scale), (10.0, 21.0, 6.0));
        assert_eq!(feature.image_point(), Point2::new(10.0, 21.0));
        assert!(feature.descriptor.is_empty());
    }
}
