use crate::image::{gaussian_blur, GrayFloatImage};
use crate::{Error, Result};
use log::*;
use std::marker::PhantomData;
use std::ops::Index;

/// Marker for octaves holding progressively blurred images.
#[derive(Debug, Clone, Copy)]
pub struct Gaussian;

/// Marker for octaves holding differences of adjacent Gaussian levels.
#[derive(Debug, Clone, Copy)]
pub struct DifferenceOfGaussians;

/// The levels of one octave. All levels share the same dimensions.
#[derive(Debug, Clone)]
pub struct Octave<T> {
    levels: Vec<GrayFloatImage>,
    _kind: PhantomData<T>,
}

impl<T> Octave<T> {
    pub(crate) fn from_levels(levels: Vec<GrayFloatImage>) -> Self {
        Self {
            levels,
            _kind: PhantomData,
        }
    }

    pub fn levels(&self) -> &[GrayFloatImage] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn width(&self) -> usize {
        self.levels.first().map_or(0, GrayFloatImage::width)
    }

    pub fn height(&self) -> usize {
        self.levels.first().map_or(0, GrayFloatImage::height)
    }

    /// Sample of `level` at column `x` and row `y`.
    #[inline]
    pub fn value(&self, level: usize, x: usize, y: usize) -> f32 {
        self.levels[level].get(x, y)
    }
}

impl<T> Index<usize> for Octave<T> {
    type Output = GrayFloatImage;

    fn index(&self, level: usize) -> &GrayFloatImage {
        &self.levels[level]
    }
}

impl Octave<Gaussian> {
    fn blur_from(base: GrayFloatImage, sigmas: &[f32]) -> Self {
        let mut levels = Vec::with_capacity(sigmas.len());
        levels.push(base);
        for &sigma in &sigmas[1..] {
            let next = gaussian_blur(&levels[levels.len() - 1], sigma);
            levels.push(next);
        }
        Self {
            levels,
            _kind: PhantomData,
        }
    }

    /// `levels[i + 1] - levels[i]` for every adjacent pair.
    pub fn difference_of_gaussians(&self) -> Octave<DifferenceOfGaussians> {
        Octave {
            levels: self
                .levels
                .windows(2)
                .map(|pair| pair[1].subtract(&pair[0]))
                .collect(),
            _kind: PhantomData,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pyramid<T> {
    octaves: Vec<Octave<T>>,
}

impl<T> Pyramid<T> {
    pub fn octaves(&self) -> &[Octave<T>] {
        &self.octaves
    }

    pub fn len(&self) -> usize {
        self.octaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octaves.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<Octave<T>> {
        self.octaves.iter()
    }
}

impl<T> Index<usize> for Pyramid<T> {
    type Output = Octave<T>;

    fn index(&self, octave: usize) -> &Octave<T> {
        &self.octaves[octave]
    }
}

impl Pyramid<Gaussian> {
    /// Builds `octaves` octaves of `levels + 3` images each.
    ///
    /// Level 0 of the first octave is `base`, which must already carry a blur of `sigma`.
    /// Every following octave starts from level `levels` of the previous one, keeping
    /// every second pixel.
    pub fn build(base: GrayFloatImage, octaves: usize, levels: usize, sigma: f32) -> Self {
        let sigmas = gaussian_sigmas(sigma, levels);
        let mut pyramid = Vec::with_capacity(octaves);
        let mut base = Some(base);
        for octave in 0..octaves {
            let start = match base.take() {
                Some(image) => image,
                None => break,
            };
            trace!(
                "Blurring octave {} of size {}x{}",
                octave,
                start.width(),
                start.height()
            );
            let current = Octave::blur_from(start, &sigmas);
            if octave + 1 < octaves {
                base = Some(current[levels].half_size());
            }
            pyramid.push(current);
        }
        Self { octaves: pyramid }
    }

    pub fn difference_of_gaussians(&self) -> Pyramid<DifferenceOfGaussians> {
        Pyramid {
            octaves: self
                .octaves
                .iter()
                .map(Octave::difference_of_gaussians)
                .collect(),
        }
    }
}

/// Incremental blur for each level of an octave.
///
/// Entry 0 is `sigma` itself. Entry `i` is the blur that takes a level of total blur
/// `sigma * k^(i-1)` to `sigma * k^i` where `k = 2^(1/levels)`.
pub fn gaussian_sigmas(sigma: f32, levels: usize) -> Vec<f32> {
    let k = 2f32.powf(1.0 / levels as f32);
    let mut sigmas = Vec::with_capacity(levels + 3);
    sigmas.push(sigma);
    for i in 1..levels + 3 {
        let previous = sigma * k.powi(i as i32 - 1);
        let total = previous * k;
        sigmas.push((total * total - previous * previous).sqrt());
    }
    sigmas
}

/// Number of octaves that fit a base image: `floor(log2(min(width, height)) - 2)`.
pub fn number_of_octaves(width: usize, height: usize) -> Result<usize> {
    let shortest = width.min(height);
    let octaves = if shortest == 0 {
        0.0
    } else {
        ((shortest as f64).log2() - 2.0).floor()
    };
    if octaves < 1.0 {
        return Err(Error::ImageTooSmall { width, height });
    }
    Ok(octaves as usize)
}
