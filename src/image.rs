use crate::errors::{Error, Result};
use derive_more::{Deref, DerefMut};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use log::*;
use ndarray::{azip, s, Array2, ArrayView2};
use std::f32;
use wide::f32x4;

pub type GrayImageBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// The image type used throughout the scale space.
///
/// This is a thin wrapper around a contiguous row-major f32 buffer holding luminance
/// values, normally in `[0, 1]`. Filters work on the raw buffer directly because going
/// through per-pixel accessors made the separable blur several times slower.
///
/// Decoding files is left to the caller; [`GrayFloatImage::from_dynamic`] converts an
/// already decoded `image::DynamicImage`.
#[derive(Debug, Clone, PartialEq, Deref, DerefMut)]
pub struct GrayFloatImage(pub GrayImageBuffer);

impl GrayFloatImage {
    /// Create a unit float image from the image crate's DynamicImage type.
    ///
    /// Luminance uses the 0.299/0.587/0.114 weights on the linear channel values,
    /// without gamma correction. Alpha is ignored.
    pub fn from_dynamic(input_image: &DynamicImage) -> Self {
        let rgb = input_image.to_rgb32f();
        info!("Converting a {} x {} image to luminance", rgb.width(), rgb.height());
        Self(ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
            let [r, g, b] = rgb[(x, y)].0;
            Luma([0.299 * r + 0.587 * g + 0.114 * b])
        }))
    }

    /// Rescale an 8-bit luminance image to `[0, 1]`.
    pub fn from_luma(input_image: &GrayImage) -> Self {
        Self(ImageBuffer::from_fn(
            input_image.width(),
            input_image.height(),
            |x, y| Luma([f32::from(input_image[(x, y)][0]) / 255.0]),
        ))
    }

    /// Wrap a row-major buffer of `width * height` samples.
    pub fn from_raw(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::DimensionMismatch {
                expected: width * height,
                actual: data.len(),
            });
        }
        GrayImageBuffer::from_raw(width as u32, height as u32, data)
            .map(Self)
            .ok_or(Error::DimensionMismatch {
                expected: width * height,
                actual: 0,
            })
    }

    /// Wrap an array indexed as `[row, column]`.
    pub fn from_array2(arr: Array2<f32>) -> Self {
        let (height, width) = arr.dim();
        let data = if arr.is_standard_layout() {
            arr.into_raw_vec()
        } else {
            arr.iter().copied().collect()
        };
        Self(
            ImageBuffer::from_raw(width as u32, height as u32, data)
                .expect("array holds exactly width * height pixels"),
        )
    }

    pub fn ref_array2(&self) -> ArrayView2<f32> {
        ArrayView2::from_shape((self.height(), self.width()), self.0.as_raw())
            .expect("buffer holds exactly width * height pixels")
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn new(width: usize, height: usize) -> Self {
        Self(ImageBuffer::from_pixel(
            width as u32,
            height as u32,
            Luma([0.0]),
        ))
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.get_pixel(x as u32, y as u32)[0]
    }

    pub fn put(&mut self, x: usize, y: usize, pixel_value: f32) {
        self.put_pixel(x as u32, y as u32, Luma([pixel_value]));
    }

    /// Keeps every second pixel in both directions. Odd trailing rows and columns are
    /// dropped, so pixel `(x, y)` of the result is pixel `(2x, 2y)` of the input.
    pub fn half_size(&self) -> Self {
        let width = self.width() / 2;
        let height = self.height() / 2;
        let half = self
            .ref_array2()
            .slice(s![..height * 2;2, ..width * 2;2])
            .to_owned();
        Self::from_array2(half)
    }

    /// Bilinear 2x upsampling where pixel `(2x, 2y)` of the result is pixel `(x, y)` of
    /// the input, keeping coordinates consistent with [`GrayFloatImage::half_size`].
    pub fn double_size(&self) -> Self {
        let width = self.width();
        let height = self.height();
        let src = self.ref_array2();
        let mut double = Array2::zeros((height * 2, width * 2));
        for ((y, x), out) in double.indexed_iter_mut() {
            let y0 = (y / 2).min(height - 1);
            let x0 = (x / 2).min(width - 1);
            let y1 = ((y + 1) / 2).min(height - 1);
            let x1 = ((x + 1) / 2).min(width - 1);
            let top = 0.5 * (src[[y0, x0]] + src[[y0, x1]]);
            let bottom = 0.5 * (src[[y1, x0]] + src[[y1, x1]]);
            *out = 0.5 * (top + bottom);
        }
        Self::from_array2(double)
    }

    /// Pixel-wise `self - other`.
    pub fn subtract(&self, other: &Self) -> Self {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        let mut out = Array2::zeros((self.height(), self.width()));
        azip!((out in &mut out, &a in &self.ref_array2(), &b in &other.ref_array2()) {
            *out = a - b;
        });
        Self::from_array2(out)
    }

    /// Gradient magnitude and orientation (radians, `atan2` range) at `(x, y)`.
    ///
    /// The vertical difference is taken bottom-to-top so that angles are measured
    /// counter-clockwise in the image. Returns `None` on the outermost ring of pixels.
    pub fn gradient(&self, x: isize, y: isize) -> Option<(f32, f32)> {
        if x <= 0 || y <= 0 || x >= self.width() as isize - 1 || y >= self.height() as isize - 1
        {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        let dx = self.get(x + 1, y) - self.get(x - 1, y);
        let dy = self.get(x, y - 1) - self.get(x, y + 1);
        Some(((dx * dx + dy * dy).sqrt(), dy.atan2(dx)))
    }
}

/// Convolves lines of a fixed length with a kernel, replicating the end values.
struct LineFilter {
    /// The kernel padded with zeros up to a multiple of the lane count.
    kernel: Vec<f32x4>,
    radius: usize,
    padded: Vec<f32>,
}

impl LineFilter {
    fn new(kernel: &[f32], length: usize) -> Self {
        debug_assert!(kernel.len() % 2 == 1);
        let lanes: Vec<f32x4> = kernel
            .chunks(4)
            .map(|chunk| {
                let mut lane = [0f32; 4];
                lane[..chunk.len()].copy_from_slice(chunk);
                f32x4::new(lane)
            })
            .collect();
        let zeros = 4 * lanes.len() - kernel.len();
        let radius = kernel.len() / 2;
        Self {
            kernel: lanes,
            radius,
            padded: vec![0.0; length + 2 * radius + zeros],
        }
    }

    fn apply(&mut self, line: &[f32], out: &mut [f32]) {
        let length = line.len();
        let (before, rest) = self.padded.split_at_mut(self.radius);
        before.fill(line[0]);
        let (middle, rest) = rest.split_at_mut(length);
        middle.copy_from_slice(line);
        let (after, zeros) = rest.split_at_mut(self.radius);
        after.fill(line[length - 1]);
        zeros.fill(0.0);
        let window = 4 * self.kernel.len();
        for (samples, out) in self.padded.windows(window).zip(out) {
            *out = dot(samples, &self.kernel);
        }
    }
}

#[inline]
fn dot(samples: &[f32], kernel: &[f32x4]) -> f32 {
    samples
        .chunks_exact(4)
        .zip(kernel)
        .fold(f32x4::splat(0.0), |acc, (chunk, &k)| {
            f32x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]).mul_add(k, acc)
        })
        .reduce_add()
}

/// Filters every row with `kernel`.
pub fn horizontal_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    let width = image.width() as usize;
    if width == 0 || image.height() == 0 {
        return image.clone();
    }
    let mut output = vec![0.0; image.as_raw().len()];
    let mut filter = LineFilter::new(kernel, width);
    for (row, out) in image
        .as_raw()
        .chunks_exact(width)
        .zip(output.chunks_exact_mut(width))
    {
        filter.apply(row, out);
    }
    GrayImageBuffer::from_raw(image.width(), image.height(), output)
        .expect("filter output has the input dimensions")
}

/// Filters every column with `kernel`.
pub fn vertical_filter(image: &GrayImageBuffer, kernel: &[f32]) -> GrayImageBuffer {
    let width = image.width() as usize;
    let height = image.height() as usize;
    if width == 0 || height == 0 {
        return image.clone();
    }
    let raw = image.as_raw();
    let mut output = vec![0.0; raw.len()];
    let mut column = vec![0.0; height];
    let mut filtered = vec![0.0; height];
    let mut filter = LineFilter::new(kernel, height);
    for x in 0..width {
        for (y, value) in column.iter_mut().enumerate() {
            *value = raw[y * width + x];
        }
        filter.apply(&column, &mut filtered);
        for (y, &value) in filtered.iter().enumerate() {
            output[y * width + x] = value;
        }
    }
    GrayImageBuffer::from_raw(image.width(), image.height(), output)
        .expect("filter output has the input dimensions")
}

pub fn separable_filter(
    image: &GrayImageBuffer,
    h_kernel: &[f32],
    v_kernel: &[f32],
) -> GrayImageBuffer {
    let h = horizontal_filter(image, h_kernel);
    vertical_filter(&h, v_kernel)
}

/// Normalized Gaussian kernel of `2 * radius + 1` taps.
pub fn gaussian_kernel(sigma: f32, radius: usize) -> Vec<f32> {
    let radius = radius as i32;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|offset| (-((offset * offset) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|weight| weight / total).collect()
}

/// Kernel radius used for a blur of the given sigma: `round(3 * sigma)`.
pub fn gaussian_radius(sigma: f32) -> usize {
    (3.0 * sigma).round().max(0.0) as usize
}

/// Separable Gaussian blur with edge replication.
pub fn gaussian_blur(image: &GrayFloatImage, sigma: f32) -> GrayFloatImage {
    debug_assert!(sigma > 0.0, "sigma must be > 0.0");
    let kernel = gaussian_kernel(sigma, gaussian_radius(sigma));
    GrayFloatImage(separable_filter(image, &kernel, &kernel))
}
