use image::Luma;
use imageproc::filter::separable_filter_equal;
use ndarray::{s, ArrayView3, ArrayViewMut3, Axis, Zip};
use nshare::AsNdarray2;

use crate::config::DetectorConfig;
use crate::error::SiftError;
use crate::sift_image::{LumaFImage, SiftImage};
use crate::temp_memory::TempMemory;
use crate::SCALES_PER_OCTAVE;

/// Each octave contains 3 additional images 0, SCALES_PER_OCTAVE+1, SCALES_PER_OCTAVE+2 so that
/// extrema can be searched at every one of the SCALES_PER_OCTAVE inner DoG layers.
const GAUSSIAN_LAYERS: usize = SCALES_PER_OCTAVE + 3;
const DOG_LAYERS: usize = SCALES_PER_OCTAVE + 2;

/// No octave is built whose smaller side is below this.
const MIN_OCTAVE_SIDE: usize = 16;

/// Seed blurs below this are skipped.
const MIN_SEED_BLUR: f64 = 0.01;

/// Half width of the blur kernel in units of sigma. Shorter kernels blur less than asked for,
/// and the shortfall differs between octaves.
const KERNEL_RADIUS_SIGMAS: f64 = 4.0;

/// Basic image operations used to build the scale space.
/// For testing or benchmarking, it's useful to swap in other blur and resampling implementations.
pub trait Processing {
    fn gaussian_blur(img: &LumaFImage, sigma: f64) -> LumaFImage;
    /// Output pixel `2i` must coincide with input pixel `i`.
    fn upsample_2x(img: &LumaFImage) -> LumaFImage;
    /// Output pixel `i` must coincide with input pixel `2i`.
    fn downsample_2x(img: &LumaFImage) -> LumaFImage;
}

/// Uses `imageproc`'s separable filter with a `4σ` Gaussian kernel and exact 2x resampling.
pub struct ImageprocProcessing;

impl Processing for ImageprocProcessing {
    fn gaussian_blur(img: &LumaFImage, sigma: f64) -> LumaFImage {
        separable_filter_equal(img, &gaussian_kernel(sigma))
    }

    fn upsample_2x(img: &LumaFImage) -> LumaFImage {
        let (width, height) = img.dimensions();
        let at = |x: u32, y: u32| img.get_pixel(x.min(width - 1), y.min(height - 1))[0];
        LumaFImage::from_fn(width * 2, height * 2, |x, y| {
            let (x0, y0) = (x / 2, y / 2);
            let (dx, dy) = (x % 2, y % 2);
            let sum = at(x0, y0) + at(x0 + dx, y0) + at(x0, y0 + dy) + at(x0 + dx, y0 + dy);
            Luma([0.25 * sum])
        })
    }

    fn downsample_2x(img: &LumaFImage) -> LumaFImage {
        LumaFImage::from_fn(img.width() / 2, img.height() / 2, |x, y| {
            *img.get_pixel(2 * x, 2 * y)
        })
    }
}

/// Normalized 1D Gaussian of radius `ceil(4σ)`.
fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (KERNEL_RADIUS_SIGMAS * sigma).ceil() as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.iter().map(|w| (w / sum) as f32).collect()
}

/// `(width, height)` of every octave that will be built.
pub fn octave_sizes(
    width: u32,
    height: u32,
    num_octaves: usize,
    upsample: bool,
) -> Vec<(usize, usize)> {
    let factor = if upsample { 2 } else { 1 };
    let mut width = width as usize * factor;
    let mut height = height as usize * factor;
    let mut sizes = Vec::with_capacity(num_octaves);
    while sizes.len() < num_octaves && width.min(height) >= MIN_OCTAVE_SIDE {
        sizes.push((width, height));
        width /= 2;
        height /= 2;
    }
    sizes
}

/// Floats of temporary memory taken by one octave.
pub(crate) fn octave_floats((width, height): (usize, usize)) -> usize {
    (GAUSSIAN_LAYERS + DOG_LAYERS) * width * height
}

/// One octave of the scale space, stored in the caller's [`TempMemory`].
pub struct Octave<'a> {
    gaussian: ArrayView3<'a, f32>,
    dog: ArrayView3<'a, f32>,
    subsampling: f32,
}

impl<'a> Octave<'a> {
    /// Shape `(SCALES_PER_OCTAVE + 3, height, width)`.
    pub fn gaussian(&self) -> ArrayView3<'a, f32> {
        self.gaussian
    }

    /// Shape `(SCALES_PER_OCTAVE + 2, height, width)`, layer `i` is gaussian `i + 1` minus
    /// gaussian `i`.
    pub fn dog(&self) -> ArrayView3<'a, f32> {
        self.dog
    }

    /// Size of one pixel of this octave in input image pixels.
    pub fn subsampling(&self) -> f32 {
        self.subsampling
    }
}

pub struct ScaleSpace<'a> {
    octaves: Vec<Octave<'a>>,
}

impl<'a> ScaleSpace<'a> {
    pub fn octaves(&self) -> &[Octave<'a>] {
        &self.octaves
    }
}

/// Build the Gaussian and DoG pyramids of `image` inside `temp`.
///
/// See Section 2.2 and 3.1 in [4].
pub fn build_scale_space<'a, P: Processing>(
    image: &SiftImage,
    config: &DetectorConfig,
    temp: &'a mut TempMemory,
) -> Result<ScaleSpace<'a>, SiftError> {
    let sizes = octave_sizes(
        image.width(),
        image.height(),
        config.num_octaves,
        config.upsample,
    );
    if sizes.is_empty() {
        return Err(SiftError::ImageTooSmall {
            width: image.width(),
            height: image.height(),
        });
    }
    let required: usize = sizes.iter().copied().map(octave_floats).sum();
    let available = temp.len();
    if available < required {
        return Err(SiftError::TempMemoryTooSmall {
            required,
            available,
        });
    }

    let sigmas = layer_sigmas(f64::from(config.base_sigma));
    let pixel_size = if config.upsample { 0.5 } else { 1.0 };
    let mut remaining: &'a mut [f32] = &mut temp.as_mut_slice()[..required];
    let mut octaves = Vec::with_capacity(sizes.len());
    let mut initial = Some(create_seed_image::<P>(image, config));

    for (index, &(width, height)) in sizes.iter().enumerate() {
        let seed = initial.take().expect("every octave has a seed image");
        assert_eq!((seed.width() as usize, seed.height() as usize), (width, height));

        let layer_len = width * height;
        let (gaussian_buf, rest) =
            std::mem::take(&mut remaining).split_at_mut(GAUSSIAN_LAYERS * layer_len);
        let (dog_buf, rest) = rest.split_at_mut(DOG_LAYERS * layer_len);
        remaining = rest;

        let next_seed = {
            let layers =
                ArrayViewMut3::from_shape((GAUSSIAN_LAYERS, height, width), &mut *gaussian_buf)
                    .expect("buffer is sized for the octave");
            fill_gaussian_layers::<P>(seed, &sigmas, layers)
        };
        let gaussian_buf: &'a [f32] = gaussian_buf;
        let gaussian = ArrayView3::from_shape((GAUSSIAN_LAYERS, height, width), gaussian_buf)
            .expect("buffer is sized for the octave");

        {
            let mut dog = ArrayViewMut3::from_shape((DOG_LAYERS, height, width), &mut *dog_buf)
                .expect("buffer is sized for the octave");
            Zip::from(&mut dog)
                .and(gaussian.slice(s![1.., .., ..]))
                .and(gaussian.slice(s![..-1, .., ..]))
                .par_for_each(|d, &hi, &lo| *d = hi - lo);
        }
        let dog_buf: &'a [f32] = dog_buf;
        let dog = ArrayView3::from_shape((DOG_LAYERS, height, width), dog_buf)
            .expect("buffer is sized for the octave");

        log::debug!("octave {index}: {width}x{height}");
        octaves.push(Octave {
            gaussian,
            dog,
            subsampling: pixel_size * 2_f32.powi(index as i32),
        });

        if index + 1 < sizes.len() {
            // The first image of each octave is the layer with twice the base blur of the
            // previous octave, subsampled by a factor of 2. See Eq. (8) in [4].
            initial = Some(P::downsample_2x(&next_seed));
        }
    }
    Ok(ScaleSpace { octaves })
}

/// Optionally upsampled input, blurred from `init_blur` up to `base_sigma`.
fn create_seed_image<P: Processing>(image: &SiftImage, config: &DetectorConfig) -> LumaFImage {
    let img = image.to_luma32f();
    let (img, factor) = if config.upsample {
        (P::upsample_2x(&img), 2.0)
    } else {
        (img, 1.0)
    };
    let present = f64::from(config.init_blur) * factor;
    let base = f64::from(config.base_sigma);
    let sigma_sq = base * base - present * present;
    if sigma_sq <= MIN_SEED_BLUR * MIN_SEED_BLUR {
        img
    } else {
        P::gaussian_blur(&img, sigma_sq.sqrt())
    }
}

/// Incremental blurs taking layer `s - 1` to layer `s`, for `s` in `1..GAUSSIAN_LAYERS`.
/// Geometric series of blur sigmas within an octave as given in Eq. (7) of [4].
fn layer_sigmas(base_sigma: f64) -> Vec<f64> {
    let m: f64 = 2_f64.powf(2.0 / SCALES_PER_OCTAVE as f64);
    (1..GAUSSIAN_LAYERS as i32)
        .map(|s| {
            // right term under square root
            let a = m.powi(s - 1);
            // left term under square root
            let b = a * m;
            (b - a).sqrt() * base_sigma
        })
        .collect()
}

/// Returns layer `SCALES_PER_OCTAVE`, the seed of the next octave.
fn fill_gaussian_layers<P: Processing>(
    initial: LumaFImage,
    sigmas: &[f64],
    mut layers: ArrayViewMut3<f32>,
) -> LumaFImage {
    assert_eq!(sigmas.len() + 1, layers.shape()[0]);
    let mut next_seed = None;
    let mut current = initial;
    layers
        .index_axis_mut(Axis(0), 0)
        .assign(&current.as_ndarray2());
    for (layer, sigma) in (1..).zip(sigmas) {
        current = P::gaussian_blur(&current, *sigma);
        layers
            .index_axis_mut(Axis(0), layer)
            .assign(&current.as_ndarray2());
        if layer == SCALES_PER_OCTAVE {
            next_seed = Some(current.clone());
        }
    }
    next_seed.expect("octave has more than SCALES_PER_OCTAVE layers")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: u32, height: u32) -> SiftImage {
        let pixels: Vec<f32> = (0..height)
            .flat_map(|y| {
                (0..width).map(move |x| {
                    let (x, y) = (x as f32, y as f32);
                    0.5 + 0.25 * (x * 0.3).sin() * (y * 0.2).cos()
                })
            })
            .collect();
        SiftImage::from_row_major(width, height, &pixels).unwrap()
    }

    #[test]
    fn octave_sizes_stop_at_min_side() {
        assert_eq!(octave_sizes(100, 40, 5, false), vec![(100, 40), (50, 20)]);
        assert_eq!(
            octave_sizes(100, 40, 5, true),
            vec![(200, 80), (100, 40), (50, 20)]
        );
        assert_eq!(octave_sizes(100, 40, 1, false), vec![(100, 40)]);
        assert!(octave_sizes(10, 40, 5, false).is_empty());
    }

    #[test]
    fn layer_sigmas_double_blur_per_octave() {
        let base = 1.6;
        let sigmas = layer_sigmas(base);
        let total = sigmas[..SCALES_PER_OCTAVE]
            .iter()
            .fold(base * base, |acc, s| acc + s * s)
            .sqrt();
        assert!((total - 2.0 * base).abs() < 1e-9);
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let img = test_image(64, 64);
        let config = DetectorConfig::default();
        let mut temp = TempMemory::with_len(100).unwrap();
        let err = build_scale_space::<ImageprocProcessing>(&img, &config, &mut temp)
            .err()
            .unwrap();
        assert_eq!(
            err,
            SiftError::TempMemoryTooSmall {
                required: TempMemory::required_floats(64, 64, config.num_octaves, false),
                available: 100
            }
        );
    }

    #[test]
    fn tiny_image_is_rejected() {
        let img = test_image(12, 40);
        let mut temp = TempMemory::with_len(10_000).unwrap();
        assert!(matches!(
            build_scale_space::<ImageprocProcessing>(&img, &DetectorConfig::default(), &mut temp),
            Err(SiftError::ImageTooSmall { .. })
        ));
    }

    #[test]
    fn dog_is_difference_of_layers() {
        let img = test_image(64, 48);
        let config = DetectorConfig::default();
        let mut temp = TempMemory::for_config(64, 48, &config).unwrap();
        let space = build_scale_space::<ImageprocProcessing>(&img, &config, &mut temp).unwrap();
        assert_eq!(space.octaves().len(), 2);
        let octave = &space.octaves()[0];
        assert_eq!(octave.gaussian().shape(), &[GAUSSIAN_LAYERS, 48, 64]);
        assert_eq!(octave.dog().shape(), &[DOG_LAYERS, 48, 64]);
        let (g, d) = (octave.gaussian(), octave.dog());
        for layer in 0..DOG_LAYERS {
            assert_eq!(
                d[(layer, 10, 20)],
                g[(layer + 1, 10, 20)] - g[(layer, 10, 20)]
            );
        }
        // Octave 1 starts from layer SCALES_PER_OCTAVE of octave 0, subsampled
        let next = &space.octaves()[1];
        assert_eq!(next.subsampling(), 2.0);
        assert_eq!(
            next.gaussian()[(0, 7, 9)],
            g[(SCALES_PER_OCTAVE, 14, 18)]
        );
    }

    fn blob_image(size: u32, cx: f32, cy: f32, sigma: f32) -> SiftImage {
        let pixels: Vec<f32> = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x as f32 - cx, y as f32 - cy)))
            .map(|(dx, dy)| {
                let sy = 1.3 * sigma;
                0.1 + 0.8 * (-(dx * dx) / (2.0 * sigma * sigma) - (dy * dy) / (2.0 * sy * sy)).exp()
            })
            .collect();
        SiftImage::from_row_major(size, size, &pixels).unwrap()
    }

    #[test]
    fn kernel_is_normalized_and_wide() {
        let kernel = gaussian_kernel(1.5);
        assert_eq!(kernel.len(), 2 * 6 + 1);
        assert!((kernel.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(kernel[0], kernel[12]);
        assert!(kernel[6] > kernel[5]);
    }

    #[test]
    fn neighbouring_octaves_agree_on_shared_scale() {
        // Layer SCALES_PER_OCTAVE of octave o and layer 0 of octave o + 1 have the same blur
        // in input pixels, so their DoG responses must coincide.
        let img = blob_image(96, 40.0, 40.0, 3.5);
        let config = DetectorConfig::default();
        let mut temp = TempMemory::for_config(96, 96, &config).unwrap();
        let space = build_scale_space::<ImageprocProcessing>(&img, &config, &mut temp).unwrap();
        let (fine, coarse) = (space.octaves()[0].dog(), space.octaves()[1].dog());
        for (y, x) in [(40, 40), (40, 44), (34, 40), (46, 36)] {
            let a = fine[(SCALES_PER_OCTAVE, y, x)];
            let b = coarse[(0, y / 2, x / 2)];
            assert!(
                (a - b).abs() < 2e-3,
                "({x}, {y}): octave 0 {a}, octave 1 {b}"
            );
        }
    }

    #[test]
    fn build_is_deterministic() {
        let img = test_image(50, 50);
        let config = DetectorConfig {
            upsample: true,
            ..Default::default()
        };
        let mut temp_a = TempMemory::for_config(50, 50, &config).unwrap();
        let mut temp_b = TempMemory::for_config(50, 50, &config).unwrap();
        let a = build_scale_space::<ImageprocProcessing>(&img, &config, &mut temp_a).unwrap();
        let b = build_scale_space::<ImageprocProcessing>(&img, &config, &mut temp_b).unwrap();
        assert_eq!(a.octaves().len(), b.octaves().len());
        assert_eq!(a.octaves()[0].subsampling(), 0.5);
        for (oa, ob) in a.octaves().iter().zip(b.octaves()) {
            assert_eq!(oa.dog(), ob.dog());
        }
    }

    #[test]
    fn resampling_keeps_even_pixels() {
        let img = test_image(20, 18).to_luma32f();
        let up = ImageprocProcessing::upsample_2x(&img);
        assert_eq!(up.dimensions(), (40, 36));
        assert_eq!(up.get_pixel(8, 6)[0], img.get_pixel(4, 3)[0]);
        let down = ImageprocProcessing::downsample_2x(&up);
        assert_eq!(down, img);
    }
}
